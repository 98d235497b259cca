use std::future::Future;

use tracing::error;

use crate::errors::BrokerError;

pub mod noop;
pub mod report;

pub use noop::TestJob;
pub use report::ReportSmallTalk;

/// Awaits an ack or reject. The fault already went to the error sink, here it
/// is only logged against the job.
pub(crate) async fn settle(result: impl Future<Output = Result<(), BrokerError>>) {
    if let Err(err) = result.await {
        error!(message = "Failed to settle delivery", error = %err);
    }
}
