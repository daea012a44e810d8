//! redb backend implementation
//!
//! Pure Rust embedded database. Useful where SQLite's C dependency is unwanted.

use crate::{Execution, ExecutionId, ExecutionStatus, StepJournal, StepRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

// Executions keyed by id, steps keyed by "{execution_id}/{step}"
const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
const STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");

/// redb-backed step journal
pub struct RedbJournal {
    db: Database,
}

fn step_key(id: ExecutionId, step: &str) -> String {
    format!("{}/{}", id, step)
}

fn step_prefix(id: ExecutionId) -> String {
    format!("{}/", id)
}

impl RedbJournal {
    /// Open or create a redb database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path).context("Failed to create redb database")?;

        let write_txn = db.begin_write()?;
        {
            let _executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            let _steps = write_txn.open_table(STEPS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).context("Failed to serialize journal entry")
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).context("Failed to deserialize journal entry")
    }
}

#[async_trait]
impl StepJournal for RedbJournal {
    async fn create_execution(&self, key: &str) -> Result<ExecutionId> {
        let execution = Execution::new(key);
        let id_key = execution.id.to_string();
        let bytes = Self::serialize(&execution)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXECUTIONS_TABLE)?;
            table.insert(id_key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        Ok(execution.id)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXECUTIONS_TABLE)?;
        let id_key = id.to_string();

        match table.get(id_key.as_str())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn set_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id_key = id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXECUTIONS_TABLE)?;

            // Read in separate scope to drop the borrow before inserting
            let current: Option<Execution> = {
                let guard = table.get(id_key.as_str())?;
                guard.map(|b| Self::deserialize(b.value())).transpose()?
            };

            let mut execution =
                current.ok_or_else(|| anyhow::anyhow!("Execution not found: {}", id))?;
            execution.status = status;
            execution.error = error;
            execution.updated_at = Utc::now();

            let bytes = Self::serialize(&execution)?;
            table.insert(id_key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        Ok(())
    }

    async fn load_step(&self, id: ExecutionId, step: &str) -> Result<Option<StepRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STEPS_TABLE)?;
        let key = step_key(id, step);

        match table.get(key.as_str())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn record_step(&self, id: ExecutionId, step: &str, output: &str) -> Result<()> {
        let id_key = id.to_string();
        let key = step_key(id, step);

        let write_txn = self.db.begin_write()?;
        {
            let executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            if executions.get(id_key.as_str())?.is_none() {
                return Err(anyhow::anyhow!("Execution not found: {}", id));
            }

            let mut steps = write_txn.open_table(STEPS_TABLE)?;
            let exists = steps.get(key.as_str())?.is_some();
            if !exists {
                let bytes = Self::serialize(&StepRecord::new(id, step, output))?;
                steps.insert(key.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;

        Ok(())
    }

    async fn list_steps(&self, id: ExecutionId) -> Result<Vec<StepRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STEPS_TABLE)?;
        let prefix = step_prefix(id);

        let mut records = Vec::new();
        for item in table.range(prefix.as_str()..)? {
            let (key, bytes) = item?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            records.push(Self::deserialize(bytes.value())?);
        }

        Ok(records)
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        let id_key = id.to_string();
        let prefix = step_prefix(id);

        let write_txn = self.db.begin_write()?;
        {
            let mut steps = write_txn.open_table(STEPS_TABLE)?;

            // Collect first, the range borrows the table
            let mut keys = Vec::new();
            for item in steps.range(prefix.as_str()..)? {
                let (key, _) = item?;
                let key = key.value().to_string();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                keys.push(key);
            }
            for key in keys {
                steps.remove(key.as_str())?;
            }

            let mut executions = write_txn.open_table(EXECUTIONS_TABLE)?;
            executions.remove(id_key.as_str())?;
        }
        write_txn.commit()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_redb_basic_flow() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = RedbJournal::open(dir.path().join("ferry.redb"))?;

        let id = journal.create_execution("k").await?;
        journal
            .set_status(id, ExecutionStatus::Running, None)
            .await?;
        journal.record_step(id, "initiate", "\"u\"").await?;
        journal.record_step(id, "initiate", "\"other\"").await?;

        let record = journal.load_step(id, "initiate").await?.unwrap();
        assert_eq!(record.output, "\"u\"");

        let execution = journal.get_execution(id).await?.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_redb_delete_scoped_to_execution() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = RedbJournal::open(dir.path().join("ferry.redb"))?;

        let a = journal.create_execution("a").await?;
        let b = journal.create_execution("b").await?;
        journal.record_step(a, "upload-part-00001", "{}").await?;
        journal.record_step(a, "upload-part-00002", "{}").await?;
        journal.record_step(b, "upload-part-00001", "{}").await?;

        assert_eq!(journal.list_steps(a).await?.len(), 2);

        journal.delete_execution(a).await?;
        assert!(journal.get_execution(a).await?.is_none());
        assert!(journal.list_steps(a).await?.is_empty());
        assert_eq!(journal.list_steps(b).await?.len(), 1);
        Ok(())
    }
}
