//! Central intake for broker-level faults.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::errors::BrokerFault;

/// Cloneable sending side of the broker fault channel. Reporting never blocks.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    sender: UnboundedSender<BrokerFault>,
}

impl ErrorSink {
    pub fn channel() -> (Self, UnboundedReceiver<BrokerFault>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ErrorSink { sender }, receiver)
    }

    pub fn report(&self, fault: BrokerFault) {
        if let Err(err) = self.sender.send(fault) {
            warn!(message = "Error sink closed, dropping broker fault", fault = %err.0);
        }
    }
}

/// Spawns the single task that logs every broker fault. It ends once all
/// [`ErrorSink`] clones are dropped.
pub fn spawn_error_logger(mut faults: UnboundedReceiver<BrokerFault>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut seen = 0;
        while let Some(fault) = faults.recv().await {
            log_fault(&fault);
            seen += 1;
        }
        seen
    })
}

fn log_fault(fault: &BrokerFault) {
    match fault {
        BrokerFault::Heartbeat {
            count,
            limit_reached: true,
            reason,
        } => error!(message = "heartbeat error (limit)", count, reason = %reason),
        BrokerFault::Heartbeat { count, reason, .. } => {
            error!(message = "heartbeat error", count, reason = %reason)
        }
        BrokerFault::Consume { queue, reason } => {
            error!(message = "consume error", queue = %queue, reason = %reason)
        }
        BrokerFault::Delivery {
            queue,
            payload,
            reason,
        } => error!(message = "delivery error", queue = %queue, payload = %payload, reason = %reason),
        BrokerFault::Other(reason) => error!(message = "other error", reason = %reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logger_drains_every_fault_and_exits_when_senders_drop() {
        let (sink, faults) = ErrorSink::channel();
        let logger = spawn_error_logger(faults);

        let other = sink.clone();
        sink.report(BrokerFault::Heartbeat {
            count: 3,
            limit_reached: false,
            reason: "timeout".into(),
        });
        sink.report(BrokerFault::Consume {
            queue: "test".into(),
            reason: "connection refused".into(),
        });
        other.report(BrokerFault::Delivery {
            queue: "test".into(),
            payload: "{}".into(),
            reason: "not found".into(),
        });
        other.report(BrokerFault::Other("boom".into()));
        drop(sink);
        drop(other);

        assert_eq!(logger.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn reporting_after_logger_is_gone_does_not_panic() {
        let (sink, faults) = ErrorSink::channel();
        drop(faults);
        sink.report(BrokerFault::Other("lost".into()));
    }
}
