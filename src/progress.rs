//! Transfer progress reporting
//!
//! A single numeric callback receives the cumulative number of bytes uploaded each
//! time a part finishes. Replayed parts of a resumed execution are counted too, so the
//! final value always equals the object size.
//!
//! ```
//! use ferry::progress::ProgressReporter;
//!
//! let reporter = ProgressReporter::new(|bytes| eprintln!("{} bytes uploaded", bytes));
//! reporter.add(1024);
//! assert_eq!(reporter.bytes(), 1024);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving cumulative bytes
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Accumulates uploaded bytes and forwards the running total
#[derive(Clone, Default)]
pub struct ProgressReporter {
    bytes: Arc<AtomicU64>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(0)),
            callback: Some(Arc::new(callback)),
        }
    }

    /// A reporter that only counts
    pub fn silent() -> Self {
        Self::default()
    }

    /// Count `delta` more bytes and notify the callback
    pub fn add(&self, delta: u64) {
        let total = self.bytes.fetch_add(delta, Ordering::SeqCst) + delta;
        if let Some(callback) = &self.callback {
            callback(total);
        }
    }

    /// Bytes counted so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("bytes", &self.bytes())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
