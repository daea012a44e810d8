use bytes::Bytes;
use ferry::logging::init_test_logging;
use ferry::store::{MemoryStore, ObjectStore, StoreError};
use ferry::{
    ChunkStrategy, ExecutionStatus, ProgressReporter, StepJournal, StepPolicies, StepPolicy,
    TransferEngine, TransferError, TransferOptions, TransferRequest, UploadMode,
};
use ferry_journal::MemoryJournal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn fast_policies() -> StepPolicies {
    StepPolicies::default().map(|policy| StepPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
        ..policy
    })
}

fn sample(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn engine_with(store: &MemoryStore, options: TransferOptions) -> TransferEngine {
    init_test_logging();
    let store: Arc<dyn ObjectStore> = Arc::new(store.clone());
    let journal: Arc<dyn StepJournal> = Arc::new(MemoryJournal::new());
    TransferEngine::new(store.clone(), store, journal)
        .with_options(options)
        .with_policies(fast_policies())
}

fn ranged(part_size: u64) -> TransferOptions {
    TransferOptions {
        part_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ranged_round_trip() {
    let store = MemoryStore::new();
    let data = sample(250);
    store.insert_object("video.mp4", data.clone());
    let engine = engine_with(&store, ranged(100));

    let outcome = engine
        .transfer(TransferRequest::new("video.mp4"))
        .await
        .unwrap();

    let sizes: Vec<u64> = outcome.parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(outcome.bytes, 250);

    let etags: HashSet<&str> = outcome.parts.iter().map(|p| p.etag.as_str()).collect();
    assert_eq!(etags.len(), 3, "every part has its own entity tag");

    assert_eq!(store.completions(), vec![vec![1, 2, 3]]);
    assert_eq!(store.object("video.mp4").unwrap(), data);
    assert_eq!(store.open_uploads(), 0);

    let execution = engine.status(outcome.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.error, None);

    let steps: Vec<String> = engine
        .steps(outcome.execution_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.step)
        .collect();
    for expected in [
        "probe-size",
        "plan",
        "initiate",
        "upload-part-00001",
        "upload-part-00002",
        "upload-part-00003",
        "complete",
    ] {
        assert!(steps.iter().any(|s| s == expected), "missing step {}", expected);
    }
}

#[tokio::test]
async fn test_part_count_covers_object() {
    let store = MemoryStore::new();
    for (len, part_size, expected) in [(100, 100, 1), (101, 100, 2), (1, 100, 1), (1000, 7, 143)] {
        let key = format!("obj-{}-{}", len, part_size);
        store.insert_object(key.clone(), sample(len));

        let outcome = engine_with(&store, ranged(part_size))
            .transfer(TransferRequest::new(key.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.parts.len(), expected, "{} / {}", len, part_size);
        assert_eq!(store.object(&key).unwrap(), sample(len));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_parts_reassemble_in_order() {
    let store = MemoryStore::new();
    let data = sample(400);
    store.insert_object("k", data.clone());
    // Later parts finish first
    store.delay_part(1, Duration::from_millis(400));
    store.delay_part(2, Duration::from_millis(300));
    store.delay_part(3, Duration::from_millis(200));

    let engine = engine_with(
        &store,
        TransferOptions {
            part_size: 100,
            mode: UploadMode::Concurrent,
            max_concurrent_parts: 4,
            ..Default::default()
        },
    );

    let outcome = engine.transfer(TransferRequest::new("k")).await.unwrap();

    let numbers: Vec<u32> = outcome.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(store.completions(), vec![vec![1, 2, 3, 4]]);
    assert_eq!(store.object("k").unwrap(), data);
}

#[tokio::test]
async fn test_part_failure_aborts_once_with_root_cause() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.fail_part_with(2, u32::MAX, StoreError::service(403, "AccessDenied", "denied"));
    let engine = engine_with(&store, ranged(100));
    let id = engine.submit(TransferRequest::new("k")).await.unwrap();

    let err = engine.run(id).await.unwrap_err();

    assert!(matches!(
        err.root_cause(),
        TransferError::PartUploadFailed { part_number: 2, .. }
    ));
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.complete_calls(), 0);
    assert_eq!(store.open_uploads(), 0);
    // A denied part still uses every attempt before the transfer gives up
    assert_eq!(store.upload_calls(2), 3);
    assert_eq!(store.upload_calls(3), 0);
    assert!(store.object("k").is_some(), "source untouched");

    let execution = engine.status(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("part 2"));
}

#[tokio::test]
async fn test_retryable_failure_exhausts_attempts() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.fail_part(2, u32::MAX);
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    match &err {
        TransferError::StepExhausted { step, attempts, .. } => {
            assert_eq!(step, "upload-part-00002");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.upload_calls(2), 3);
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_absorbed() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.fail_head(2);
    store.fail_range_reads(1);
    store.fail_part(1, 1);
    store.fail_complete(1, StoreError::service(500, "InternalError", "try again"));
    let engine = engine_with(&store, ranged(100));

    let outcome = engine.transfer(TransferRequest::new("k")).await.unwrap();

    assert_eq!(outcome.parts.len(), 3);
    // First attempt of part 1 fails on the range read, the second on the upload
    assert_eq!(store.upload_calls(1), 2);
    assert_eq!(store.complete_calls(), 2);
    assert_eq!(store.abort_calls(), 0);
    assert_eq!(store.object("k").unwrap(), sample(300));
}

#[tokio::test]
async fn test_abort_failure_keeps_root_cause() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.fail_part_with(3, u32::MAX, StoreError::service(400, "InvalidArgument", "bad"));
    store.fail_abort();
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    assert!(matches!(
        err.root_cause(),
        TransferError::PartUploadFailed { part_number: 3, .. }
    ));
    assert_eq!(store.abort_calls(), 3);
    assert_eq!(store.open_uploads(), 1, "upload stays open after failed abort");
}

#[tokio::test]
async fn test_complete_failure_aborts() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(150));
    store.fail_complete(u32::MAX, StoreError::service(400, "InvalidPart", "no"));
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), TransferError::CompleteFailed { .. }));
    assert_eq!(store.complete_calls(), 3);
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn test_lost_complete_response_counts_as_success() {
    init_test_logging();
    let source = MemoryStore::new();
    let destination = MemoryStore::new();
    let data = sample(250);
    source.insert_object("k", data.clone());
    destination.lose_complete_responses(1);

    let engine = TransferEngine::new(
        Arc::new(source.clone()),
        Arc::new(destination.clone()),
        Arc::new(MemoryJournal::new()),
    )
    .with_options(ranged(100))
    .with_policies(fast_policies());

    let outcome = engine.transfer(TransferRequest::new("k")).await.unwrap();

    assert_eq!(outcome.parts.len(), 3);
    assert_eq!(destination.complete_calls(), 2);
    assert_eq!(destination.abort_calls(), 0);
    assert_eq!(destination.completions(), vec![vec![1, 2, 3]]);
    assert_eq!(destination.object("k").unwrap(), data);

    let execution = engine.status(outcome.execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.error, None);
}

#[tokio::test]
async fn test_failure_before_initiate_does_not_abort() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("missing"))
        .await
        .unwrap_err();

    assert!(matches!(
        err.root_cause(),
        TransferError::SizeUnavailable {
            source: StoreError::NotFound(_),
            ..
        }
    ));
    assert_eq!(store.initiate_calls(), 0);
    assert_eq!(store.abort_calls(), 0);
}

#[tokio::test]
async fn test_denied_initiate_uses_every_attempt() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(10));
    store.fail_initiate(u32::MAX, StoreError::service(403, "AccessDenied", "denied"));
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    match &err {
        TransferError::StepExhausted { step, attempts, .. } => {
            assert_eq!(step, "initiate");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), TransferError::InitiateFailed { .. }));
    assert_eq!(store.initiate_calls(), 3);
    assert_eq!(store.abort_calls(), 0);
}

#[tokio::test]
async fn test_missing_content_length() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(10));
    store.omit_content_length();
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), TransferError::SizeUnavailable { .. }));
    assert_eq!(store.initiate_calls(), 0);
}

#[tokio::test]
async fn test_missing_upload_id_is_retried_then_fails() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(10));
    store.omit_upload_id();
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), TransferError::UploadIdMissing { .. }));
    assert_eq!(store.initiate_calls(), 3);
    assert_eq!(store.abort_calls(), 0);
}

#[tokio::test]
async fn test_missing_etag_aborts() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.omit_etag(2);
    let engine = engine_with(&store, ranged(100));

    let err = engine
        .transfer(TransferRequest::new("k"))
        .await
        .unwrap_err();

    assert!(matches!(
        err.root_cause(),
        TransferError::ETagMissing { part_number: 2 }
    ));
    assert_eq!(store.upload_calls(2), 3);
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test]
async fn test_short_range_read_is_retried() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(200));
    store.short_range_reads(1);
    let engine = engine_with(&store, ranged(100));

    engine.transfer(TransferRequest::new("k")).await.unwrap();
    assert_eq!(store.object("k").unwrap(), sample(200));
}

#[tokio::test]
async fn test_empty_object_uses_single_put() {
    for strategy in [ChunkStrategy::Ranged, ChunkStrategy::Streamed] {
        let store = MemoryStore::new();
        store.insert_object("empty", Bytes::new());
        let engine = engine_with(
            &store,
            TransferOptions {
                part_size: 100,
                buffer_capacity: 100,
                strategy,
                ..Default::default()
            },
        );

        let outcome = engine.transfer(TransferRequest::new("empty")).await.unwrap();

        assert_eq!(outcome.upload_id, None, "{}", strategy);
        assert!(outcome.parts.is_empty());
        assert_eq!(outcome.bytes, 0);
        assert_eq!(store.initiate_calls(), 0);
        assert_eq!(store.put_calls(), 1);
        assert_eq!(store.object("empty").unwrap(), Bytes::new());
    }
}

#[tokio::test]
async fn test_streamed_transfer_regroups_chunks() {
    let store = MemoryStore::new();
    let data = sample(25);
    store.insert_object("stream", data.clone());
    store.read_chunk_sizes(vec![7, 3, 15]);
    let engine = engine_with(
        &store,
        TransferOptions {
            buffer_capacity: 20,
            strategy: ChunkStrategy::Streamed,
            ..Default::default()
        },
    );

    let outcome = engine.transfer(TransferRequest::new("stream")).await.unwrap();

    let sizes: Vec<u64> = outcome.parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![20, 5]);
    assert_eq!(store.completions(), vec![vec![1, 2]]);
    assert_eq!(store.object("stream").unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn test_streamed_concurrent_round_trip() {
    let store = MemoryStore::new();
    let data = sample(95);
    store.insert_object("stream", data.clone());
    store.read_chunk_sizes(vec![7, 3, 15]);
    // Early parts settle last
    store.delay_part(1, Duration::from_millis(300));
    store.delay_part(2, Duration::from_millis(100));
    let engine = engine_with(
        &store,
        TransferOptions {
            buffer_capacity: 20,
            strategy: ChunkStrategy::Streamed,
            mode: UploadMode::Concurrent,
            max_concurrent_parts: 3,
            ..Default::default()
        },
    );

    let outcome = engine.transfer(TransferRequest::new("stream")).await.unwrap();

    let sizes: Vec<u64> = outcome.parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![20, 20, 20, 20, 15]);
    let numbers: Vec<u32> = outcome.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.total_upload_calls(), 5);
    assert_eq!(store.completions(), vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(store.object("stream").unwrap(), data);
}

#[tokio::test]
async fn test_streamed_read_failure_aborts() {
    let store = MemoryStore::new();
    store.insert_object("stream", sample(100));
    store.read_chunk_sizes(vec![10]);
    store.fail_stream_after(45);
    let engine = engine_with(
        &store,
        TransferOptions {
            buffer_capacity: 20,
            strategy: ChunkStrategy::Streamed,
            ..Default::default()
        },
    );

    let err = engine
        .transfer(TransferRequest::new("stream"))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), TransferError::DownloadFailed { .. }));
    assert_eq!(store.upload_calls(1), 1);
    assert_eq!(store.upload_calls(2), 1);
    assert_eq!(store.upload_calls(3), 0);
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_execution_is_not_aborted() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(300));
    store.delay_part(2, Duration::from_millis(100));
    let engine = engine_with(&store, ranged(100));
    let id = engine.submit(TransferRequest::new("k")).await.unwrap();

    let running = engine.clone();
    let handle = tokio::spawn(async move { running.run(id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.terminate(id).await.unwrap());

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_terminated());
    assert_eq!(store.upload_calls(3), 0);
    assert_eq!(store.abort_calls(), 0);
    assert_eq!(store.open_uploads(), 1);
    assert_eq!(
        engine.status(id).await.unwrap().status,
        ExecutionStatus::Terminated
    );

    // Already finished
    assert!(!engine.terminate(id).await.unwrap());
    assert!(matches!(
        engine.run(id).await,
        Err(TransferError::ExecutionFinished {
            status: ExecutionStatus::Terminated,
            ..
        })
    ));
}

#[tokio::test]
async fn test_progress_reaches_object_size() {
    let store = MemoryStore::new();
    store.insert_object("k", sample(250));
    let progress = ProgressReporter::silent();
    let engine = engine_with(&store, ranged(100)).with_progress(progress.clone());

    engine.transfer(TransferRequest::new("k")).await.unwrap();
    assert_eq!(progress.bytes(), 250);
}

#[tokio::test]
async fn test_blob_transfer() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, ranged(100));
    let id = engine.submit(TransferRequest::new("upload.bin")).await.unwrap();

    let outcome = engine.run_blob(id, sample(250)).await.unwrap();

    assert_eq!(outcome.parts.len(), 3);
    assert_eq!(store.object("upload.bin").unwrap(), sample(250));
}
