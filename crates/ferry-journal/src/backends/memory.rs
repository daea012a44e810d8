//! In-memory backend
//!
//! Nothing survives the process. Used by tests and for one-shot transfers where
//! resumption is not wanted.

use crate::{Execution, ExecutionId, ExecutionStatus, StepJournal, StepRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    executions: HashMap<ExecutionId, Execution>,
    steps: BTreeMap<(ExecutionId, String), StepRecord>,
}

/// In-memory step journal
#[derive(Default)]
pub struct MemoryJournal {
    state: RwLock<MemoryState>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| anyhow::anyhow!("Memory journal lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| anyhow::anyhow!("Memory journal lock poisoned"))
    }
}

#[async_trait]
impl StepJournal for MemoryJournal {
    async fn create_execution(&self, key: &str) -> Result<ExecutionId> {
        let execution = Execution::new(key);
        let id = execution.id;
        self.write()?.executions.insert(id, execution);
        Ok(id)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        Ok(self.read()?.executions.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.write()?;
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", id))?;

        execution.status = status;
        execution.error = error;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn load_step(&self, id: ExecutionId, step: &str) -> Result<Option<StepRecord>> {
        Ok(self.read()?.steps.get(&(id, step.to_string())).cloned())
    }

    async fn record_step(&self, id: ExecutionId, step: &str, output: &str) -> Result<()> {
        let mut state = self.write()?;
        if !state.executions.contains_key(&id) {
            return Err(anyhow::anyhow!("Execution not found: {}", id));
        }

        state
            .steps
            .entry((id, step.to_string()))
            .or_insert_with(|| StepRecord::new(id, step, output));
        Ok(())
    }

    async fn list_steps(&self, id: ExecutionId) -> Result<Vec<StepRecord>> {
        Ok(self
            .read()?
            .steps
            .iter()
            .filter(|((execution_id, _), _)| *execution_id == id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        let mut state = self.write()?;
        state.executions.remove(&id);
        state.steps.retain(|(execution_id, _), _| *execution_id != id);
        Ok(())
    }
}
