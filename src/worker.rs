use async_channel::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::broker::{Consumer, Delivery};

/// Runs one consumer until the queue stops. A delivery that was already
/// handed to the consumer always runs to completion.
pub(crate) async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Delivery>,
    consumer: Box<dyn Consumer>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Worker cancelled");
                break;
            },
            delivery = recv_from_queue.recv() => {
                match delivery {
                    Err(err) => {
                        error!(message = "Delivery buffer closed, exiting", error = ?err);
                        break;
                    },
                    Ok(delivery) => {
                        trace!(payload = delivery.payload(), "Consuming delivery");
                        consumer.consume(delivery).await;
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}
