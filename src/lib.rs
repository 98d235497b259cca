use std::fmt;

pub mod broker;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod jobs;
pub mod joblog;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
mod worker;

/// Processing state of a job log row.
///
/// Rows only move forward: `Created -> Processing -> {Success | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Processing,
    Success,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Success)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Created => "CREATED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus;

    #[test]
    fn status_only_moves_forward() {
        use JobStatus::*;
        assert!(Created.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Created.can_transition_to(Success));
        assert!(!Created.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Created));
        for terminal in [Success, Failed] {
            for next in [Created, Processing, Success, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_binds_as_text() {
        use sqlx::{Postgres, Type, TypeInfo};

        assert_eq!(<JobStatus as Type<Postgres>>::type_info().name(), "TEXT");
        assert_eq!(JobStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(JobStatus::Failed.to_string(), "FAILED");
    }
}
