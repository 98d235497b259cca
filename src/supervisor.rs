use std::time::Duration;

use anyhow::{anyhow, Context, Error};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::broker::{Connection, Queue};
use crate::dispatcher::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub prefetch_limit: usize,
    pub poll_interval: Duration,
}

/// Opens every registered queue, then starts consuming each, then attaches
/// the workers. The first failure is returned.
pub async fn start(
    connection: &Connection,
    registry: &Registry,
    options: ConsumeOptions,
) -> Result<Vec<Queue>, Error> {
    let mut queues = Vec::with_capacity(registry.bindings().len());
    for binding in registry.bindings() {
        let queue = connection
            .open_queue(&binding.queue)
            .await
            .with_context(|| format!("opening queue {}", binding.queue))?;
        queues.push(queue);
    }

    for queue in &queues {
        queue
            .start_consuming(options.prefetch_limit, options.poll_interval)
            .with_context(|| format!("start consuming queue {}", queue.name()))?;
    }

    for (binding, queue) in registry.bindings().iter().zip(&queues) {
        for index in 0..binding.workers {
            let name = format!("worker {} consumer {index}", binding.queue);
            let tag = queue
                .add_consumer(&name, binding.build(index))
                .with_context(|| format!("adding consumer to queue {}", binding.queue))?;
            debug!(queue = %binding.queue, consumer = %tag, "Consumer attached");
        }
        info!(queue = %binding.queue, workers = binding.workers, "Queue ready");
    }

    Ok(queues)
}

/// Runs until `cancel_token` fires, then drains every consumer. Losing the
/// broker heartbeat also stops consuming and is reported as an error.
pub async fn serve(
    cancel_token: CancellationToken,
    connection: Connection,
    registry: &Registry,
    options: ConsumeOptions,
) -> Result<(), Error> {
    if let Err(err) = start(&connection, registry, options).await {
        connection.stop_all_consuming().await;
        return Err(err);
    }

    let outcome = tokio::select! {
        _ = cancel_token.cancelled() => {
            debug!("Supervisor cancelled");
            Ok(())
        },
        _ = connection.consuming_stopped() => {
            Err(anyhow!("broker connection {} stopped consuming", connection.name()))
        }
    };

    info!("Closing connection");
    connection.stop_all_consuming().await;
    info!("Supervisor stopped.");

    outcome
}
