use std::path::PathBuf;

use thiserror::Error;

use crate::JobStatus;

/// Failures returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue `{0}` is already consuming")]
    AlreadyConsuming(String),

    #[error("queue `{0}` is not consuming, call start_consuming first")]
    NotConsuming(String),

    #[error("queue `{0}` has been stopped")]
    Stopped(String),

    #[error("prefetch limit must be greater than zero")]
    InvalidPrefetch,

    #[error("delivery not found in unacked list of queue `{0}`")]
    DeliveryNotFound(String),

    #[error("broker backend error: {0}")]
    Backend(String),
}

/// Asynchronous broker faults collected by the error sink.
///
/// These never belong to a single job outcome; they are logged centrally.
#[derive(Debug, Error)]
pub enum BrokerFault {
    #[error("heartbeat error ({count} consecutive): {reason}")]
    Heartbeat {
        count: u32,
        limit_reached: bool,
        reason: String,
    },

    #[error("consume error on queue `{queue}`: {reason}")]
    Consume { queue: String, reason: String },

    #[error("delivery error on queue `{queue}` for payload {payload:?}: {reason}")]
    Delivery {
        queue: String,
        payload: String,
        reason: String,
    },

    #[error("broker error: {0}")]
    Other(String),
}

/// Failures of the job log store. Callers observe these, they never abort a job.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("job log store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("job log row {0} was not updated (missing or already terminal)")]
    NotUpdated(i64),

    #[error("job log entry has not been created")]
    MissingId,

    #[error("invalid log table name `{0}`")]
    InvalidTable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal job status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Per-delivery failures of the report pipeline.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid report payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("report query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("failed to render spreadsheet: {0}")]
    Render(#[from] rust_xlsxwriter::XlsxError),

    #[error("spreadsheet render task panicked: {0}")]
    RenderTask(#[from] tokio::task::JoinError),

    #[error("failed to write report {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
