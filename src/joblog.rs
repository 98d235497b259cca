//! Audit trail of job processing. Writing it is advisory: failures are
//! logged for operators and never change a delivery's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::errors::{LogError, TransitionError};
use crate::JobStatus;

pub const PROCESS_TYPE_REPORT: &str = "REPORT";
pub const PROCESS_TYPE_TEST: &str = "TEST";
pub const PROCESS_RESULT_FILE: &str = "FILE";
pub const PROCESS_RESULT_NONE: &str = "NONE";

/// One row of the job log table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueLog {
    /// Set once the row was inserted.
    pub id: Option<i64>,
    pub process_name: String,
    /// Raw payload at first, later the error text or the artifact name.
    pub process_payload: String,
    pub process_status: JobStatus,
    pub process_type: String,
    pub process_result: String,
    pub issued_by: i64,
}

impl JobQueueLog {
    pub fn new(
        process_name: impl Into<String>,
        process_type: impl Into<String>,
        process_result: impl Into<String>,
        process_payload: impl Into<String>,
        issued_by: i64,
    ) -> Self {
        JobQueueLog {
            id: None,
            process_name: process_name.into(),
            process_payload: process_payload.into(),
            process_status: JobStatus::Created,
            process_type: process_type.into(),
            process_result: process_result.into(),
            issued_by,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.process_status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.process_status,
                to: next,
            });
        }
        self.process_status = next;
        Ok(())
    }
}

/// Storage of job log rows.
#[async_trait]
pub trait JobLog: Send + Sync {
    /// Inserts `entry` and returns the new row id.
    async fn create(&self, entry: &JobQueueLog) -> Result<i64, LogError>;

    /// Updates the row identified by `entry.id`.
    async fn update(&self, entry: &JobQueueLog) -> Result<(), LogError>;
}

/// Drives one log row through its states for a single delivery.
pub struct Lifecycle {
    log: Arc<dyn JobLog>,
    entry: JobQueueLog,
}

impl Lifecycle {
    /// Inserts the CREATED row. A failed insert is logged and the lifecycle
    /// carries on without a row id.
    pub async fn register(log: Arc<dyn JobLog>, mut entry: JobQueueLog) -> Self {
        match log.create(&entry).await {
            Ok(id) => entry.id = Some(id),
            Err(err) => error!(
                message = "Failed to create job log",
                process = %entry.process_name,
                error = %err
            ),
        }
        Lifecycle { log, entry }
    }

    pub fn entry(&self) -> &JobQueueLog {
        &self.entry
    }

    pub async fn processing(&mut self) {
        self.advance(JobStatus::Processing, None).await
    }

    pub async fn succeeded(&mut self, payload: String) {
        self.advance(JobStatus::Success, Some(payload)).await
    }

    pub async fn failed(&mut self, error: String) {
        self.advance(JobStatus::Failed, Some(error)).await
    }

    async fn advance(&mut self, next: JobStatus, payload: Option<String>) {
        if let Err(err) = self.entry.transition(next) {
            error!(message = "Refusing job log update", job_id = ?self.entry.id, error = %err);
            return;
        }
        if let Some(payload) = payload {
            self.entry.process_payload = payload;
        }

        if self.entry.id.is_none() {
            warn!(
                message = "Skipping job log update, row was never created",
                status = %next
            );
            return;
        }
        if let Err(err) = self.log.update(&self.entry).await {
            error!(
                message = "Failed to update job log",
                job_id = ?self.entry.id,
                status = %next,
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLog {
        fail_create: bool,
        fail_update: bool,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl JobLog for CountingLog {
        async fn create(&self, _entry: &JobQueueLog) -> Result<i64, LogError> {
            if self.fail_create {
                return Err(LogError::Store(sqlx::Error::PoolTimedOut));
            }
            Ok(42)
        }

        async fn update(&self, entry: &JobQueueLog) -> Result<(), LogError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_update {
                return Err(LogError::NotUpdated(entry.id.unwrap_or_default()));
            }
            Ok(())
        }
    }

    fn entry() -> JobQueueLog {
        JobQueueLog::new("Test", PROCESS_TYPE_TEST, PROCESS_RESULT_NONE, "{}", 0)
    }

    #[test]
    fn terminal_rows_never_transition_again() {
        let mut row = entry();
        assert_eq!(
            row.transition(JobStatus::Success),
            Err(TransitionError {
                from: JobStatus::Created,
                to: JobStatus::Success
            })
        );
        row.transition(JobStatus::Processing).unwrap();
        row.transition(JobStatus::Failed).unwrap();
        assert!(row.transition(JobStatus::Success).is_err());
        assert_eq!(row.process_status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn lifecycle_records_the_id_and_final_payload() {
        let log = Arc::new(CountingLog::default());
        let mut lifecycle = Lifecycle::register(log.clone(), entry()).await;
        lifecycle.processing().await;
        lifecycle.succeeded("report.xlsx".into()).await;

        assert_eq!(lifecycle.entry().id, Some(42));
        assert_eq!(lifecycle.entry().process_status, JobStatus::Success);
        assert_eq!(lifecycle.entry().process_payload, "report.xlsx");
        assert_eq!(log.updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_create_skips_updates_without_panicking() {
        let log = Arc::new(CountingLog {
            fail_create: true,
            ..Default::default()
        });
        let mut lifecycle = Lifecycle::register(log.clone(), entry()).await;
        lifecycle.processing().await;
        lifecycle.failed("boom".into()).await;

        assert_eq!(lifecycle.entry().id, None);
        assert_eq!(lifecycle.entry().process_status, JobStatus::Failed);
        assert_eq!(log.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_update_is_swallowed_and_state_still_advances() {
        let log = Arc::new(CountingLog {
            fail_update: true,
            ..Default::default()
        });
        let mut lifecycle = Lifecycle::register(log.clone(), entry()).await;
        lifecycle.processing().await;
        lifecycle.succeeded("done".into()).await;
        lifecycle.failed("late".into()).await;

        assert_eq!(lifecycle.entry().process_status, JobStatus::Success);
        assert_eq!(lifecycle.entry().process_payload, "done");
        assert_eq!(log.updates.load(Ordering::SeqCst), 2);
    }
}
