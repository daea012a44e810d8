//! Integration tests for ferry-journal
//!
//! Runs the same scenarios against every compiled backend.

use anyhow::Result;
use ferry_journal::{ExecutionStatus, MemoryJournal, StepJournal};

async fn resume_scenario(journal: &dyn StepJournal) -> Result<()> {
    let id = journal.create_execution("archive/2024.tar").await?;
    journal
        .set_status(id, ExecutionStatus::Running, None)
        .await?;

    journal.record_step(id, "probe-size", "262144").await?;
    journal.record_step(id, "initiate", "\"upload-1\"").await?;
    journal
        .record_step(
            id,
            "upload-part-00001",
            r#"{"part_number":1,"etag":"e1","size":102400}"#,
        )
        .await?;

    // A restarted run sees exactly what was recorded
    let steps = journal.list_steps(id).await?;
    let names: Vec<&str> = steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(names, vec!["initiate", "probe-size", "upload-part-00001"]);

    assert!(journal.load_step(id, "upload-part-00002").await?.is_none());
    assert_eq!(
        journal.load_step(id, "initiate").await?.unwrap().output,
        "\"upload-1\""
    );

    journal
        .set_status(id, ExecutionStatus::Completed, None)
        .await?;
    let execution = journal.get_execution(id).await?.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.updated_at >= execution.created_at);

    Ok(())
}

async fn terminate_scenario(journal: &dyn StepJournal) -> Result<()> {
    let live = journal.create_execution("live").await?;
    let done = journal.create_execution("done").await?;
    journal
        .set_status(done, ExecutionStatus::Completed, None)
        .await?;

    assert!(journal.terminate(live).await?);
    assert!(!journal.terminate(done).await?);
    assert!(journal.terminate(uuid::Uuid::new_v4()).await.is_err());

    assert_eq!(
        journal.get_execution(live).await?.unwrap().status,
        ExecutionStatus::Terminated
    );
    assert_eq!(
        journal.get_execution(done).await?.unwrap().status,
        ExecutionStatus::Completed
    );
    Ok(())
}

#[tokio::test]
async fn test_memory_resume_scenario() -> Result<()> {
    resume_scenario(&MemoryJournal::new()).await
}

#[tokio::test]
async fn test_memory_terminate_scenario() -> Result<()> {
    terminate_scenario(&MemoryJournal::new()).await
}

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use super::*;
    use ferry_journal::SqliteJournal;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_sqlite_resume_scenario() -> Result<()> {
        let tmp = NamedTempFile::new()?;
        let journal = SqliteJournal::open(tmp.path().to_str().unwrap()).await?;
        resume_scenario(&journal).await
    }

    #[tokio::test]
    async fn test_sqlite_terminate_scenario() -> Result<()> {
        let tmp = NamedTempFile::new()?;
        let journal = SqliteJournal::open(tmp.path().to_str().unwrap()).await?;
        terminate_scenario(&journal).await
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() -> Result<()> {
        let tmp = NamedTempFile::new()?;
        let path = tmp.path().to_str().unwrap().to_string();

        let id = {
            let journal = SqliteJournal::open(&path).await?;
            let id = journal.create_execution("k").await?;
            journal.record_step(id, "initiate", "\"u\"").await?;
            journal.pool().close().await;
            id
        };

        let journal = SqliteJournal::open(&path).await?;
        let record = journal.load_step(id, "initiate").await?.unwrap();
        assert_eq!(record.output, "\"u\"");
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_records() -> Result<()> {
        let tmp = NamedTempFile::new()?;
        let journal =
            std::sync::Arc::new(SqliteJournal::open(tmp.path().to_str().unwrap()).await?);
        let id = journal.create_execution("k").await?;

        let mut handles = Vec::new();
        for n in 1..=8u32 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal
                    .record_step(id, &format!("upload-part-{:05}", n), "{}")
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        assert_eq!(journal.list_steps(id).await?.len(), 8);
        Ok(())
    }
}

#[cfg(feature = "redb")]
mod redb_tests {
    use super::*;
    use ferry_journal::RedbJournal;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_redb_resume_scenario() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = RedbJournal::open(dir.path().join("ferry.redb"))?;
        resume_scenario(&journal).await
    }

    #[tokio::test]
    async fn test_redb_terminate_scenario() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = RedbJournal::open(dir.path().join("ferry.redb"))?;
        terminate_scenario(&journal).await
    }
}
