use std::fmt;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use super::connection::QueueInner;
use crate::errors::{BrokerError, BrokerFault};

/// One fetched payload. `ack` and `reject` consume the delivery, so it can be
/// settled only once. It holds one prefetch slot of its queue until settled.
pub struct Delivery {
    queue: Arc<QueueInner>,
    payload: String,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl Delivery {
    pub(crate) fn new(queue: Arc<QueueInner>, payload: String, permit: OwnedSemaphorePermit) -> Self {
        Delivery {
            queue,
            payload,
            permit: Some(permit),
            settled: false,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.settled = true;
        let result = self
            .queue
            .broker
            .ack(&self.queue.connection, &self.queue.name, &self.payload)
            .await;
        self.observe(result)
    }

    pub async fn reject(mut self) -> Result<(), BrokerError> {
        self.settled = true;
        let result = self
            .queue
            .broker
            .reject(&self.queue.connection, &self.queue.name, &self.payload)
            .await;
        self.observe(result)
    }

    /// Hands a buffered, never-consumed delivery back to the ready list.
    pub(crate) async fn return_to_ready(mut self) -> Result<(), BrokerError> {
        self.settled = true;
        let result = self
            .queue
            .broker
            .return_to_ready(&self.queue.connection, &self.queue.name, &self.payload)
            .await;
        self.observe(result)
    }

    fn observe(&self, result: Result<(), BrokerError>) -> Result<(), BrokerError> {
        if let Err(err) = &result {
            self.queue.sink.report(BrokerFault::Delivery {
                queue: self.queue.name.clone(),
                payload: self.payload.clone(),
                reason: err.to_string(),
            });
        }
        result
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue.name)
            .field("payload", &self.payload)
            .field("settled", &self.settled)
            .finish()
    }
}

/// A delivery dropped unsettled stays in the broker's unacked list, so its
/// prefetch slot is kept as well. The unacked count never exceeds the limit.
impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                message = "Delivery dropped without ack or reject, it stays unacked",
                queue = %self.queue.name,
                payload = %self.payload
            );
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}
