use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{Broker, Consumer, Delivery};
use crate::errors::{BrokerError, BrokerFault};
use crate::sink::ErrorSink;
use crate::worker;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const HEARTBEAT_ERROR_LIMIT: u32 = 45;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures after which all consuming stops.
    pub heartbeat_error_limit: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_error_limit: HEARTBEAT_ERROR_LIMIT,
        }
    }
}

/// A registered broker connection shared by every queue and consumer of the
/// process.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: String,
    broker: Arc<dyn Broker>,
    sink: ErrorSink,
    options: ConnectionOptions,
    /// Cancelled to stop every queue of this connection.
    stop: CancellationToken,
    heartbeat_stop: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Connection {
    pub async fn open(
        tag: &str,
        broker: Arc<dyn Broker>,
        sink: ErrorSink,
    ) -> Result<Self, BrokerError> {
        Self::open_with(tag, broker, sink, ConnectionOptions::default()).await
    }

    /// Pings the broker and registers a uniquely named connection. Any
    /// failure here is returned to the caller, nothing is retried.
    pub async fn open_with(
        tag: &str,
        broker: Arc<dyn Broker>,
        sink: ErrorSink,
        options: ConnectionOptions,
    ) -> Result<Self, BrokerError> {
        let name = format!("{tag}-{}", Uuid::new_v4().simple());
        broker.ping().await?;
        broker.register_connection(&name).await?;
        broker.heartbeat(&name).await?;
        info!(connection = %name, "Broker connection opened");

        let inner = Arc::new(ConnectionInner {
            name,
            broker,
            sink,
            options,
            stop: CancellationToken::new(),
            heartbeat_stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        tokio::spawn(heartbeat(inner.clone()).instrument(info_span!("heartbeat")));

        Ok(Connection { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn open_queue(&self, name: &str) -> Result<Queue, BrokerError> {
        if self.inner.stop.is_cancelled() {
            return Err(BrokerError::Stopped(name.to_string()));
        }
        self.inner.broker.open_queue(name).await?;
        debug!(queue = name, "Queue opened");

        Ok(Queue {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                connection: self.inner.name.clone(),
                broker: self.inner.broker.clone(),
                sink: self.inner.sink.clone(),
                stop: self.inner.stop.child_token(),
                drained: CancellationToken::new(),
                workers: TaskTracker::new(),
                all_tasks: self.inner.tracker.clone(),
                buffer: OnceLock::new(),
            }),
        })
    }

    /// Resolves once consuming stopped, either through
    /// [`Connection::stop_all_consuming`] or because the heartbeat limit was hit.
    pub async fn consuming_stopped(&self) {
        self.inner.stop.cancelled().await
    }

    /// Stops fetching on every queue, waits for in-flight deliveries to be
    /// settled and for buffered ones to be returned, then unregisters.
    pub async fn stop_all_consuming(&self) {
        self.inner.stop.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.heartbeat_stop.cancel();

        if let Err(err) = self.inner.broker.unregister_connection(&self.inner.name).await {
            self.inner.sink.report(BrokerFault::Other(format!(
                "failed to unregister connection {}: {err}",
                self.inner.name
            )));
        }
        info!(connection = %self.inner.name, "All consumers stopped");
    }
}

async fn heartbeat(inner: Arc<ConnectionInner>) {
    let mut ticker = interval(inner.options.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = inner.heartbeat_stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.broker.heartbeat(&inner.name).await {
            Ok(()) => failures = 0,
            Err(err) => {
                failures += 1;
                let limit_reached = failures >= inner.options.heartbeat_error_limit;
                inner.sink.report(BrokerFault::Heartbeat {
                    count: failures,
                    limit_reached,
                    reason: err.to_string(),
                });
                if limit_reached {
                    warn!(connection = %inner.name, "Heartbeat limit reached, stopping all consuming");
                    inner.stop.cancel();
                    break;
                }
            }
        }
    }
    debug!("Heartbeat stopped");
}

/// A named queue opened on a [`Connection`].
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    pub(crate) name: String,
    pub(crate) connection: String,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) sink: ErrorSink,
    stop: CancellationToken,
    /// Cancelled once this queue's workers exited and its buffer was returned.
    drained: CancellationToken,
    workers: TaskTracker,
    all_tasks: TaskTracker,
    buffer: OnceLock<Receiver<Delivery>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("connection", &self.inner.connection)
            .field("consuming", &self.inner.buffer.get().is_some())
            .finish()
    }
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Starts the fetch task. At most `prefetch_limit` deliveries are fetched
    /// and not yet settled at any time; an empty queue is polled again after
    /// `poll_interval`.
    pub fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> Result<(), BrokerError> {
        if prefetch_limit == 0 {
            return Err(BrokerError::InvalidPrefetch);
        }
        if self.inner.stop.is_cancelled() {
            return Err(BrokerError::Stopped(self.inner.name.clone()));
        }

        let (sender, receiver) = async_channel::bounded(prefetch_limit);
        self.inner
            .buffer
            .set(receiver.clone())
            .map_err(|_| BrokerError::AlreadyConsuming(self.inner.name.clone()))?;

        let permits = Arc::new(Semaphore::new(prefetch_limit));
        let span = info_span!("fetch", queue = %self.inner.name);
        self.track(fetch(self.inner.clone(), sender, permits, poll_interval).instrument(span));
        self.inner
            .all_tasks
            .spawn(drain(self.inner.clone(), receiver));

        info!(queue = %self.inner.name, prefetch_limit, ?poll_interval, "Started consuming");
        Ok(())
    }

    /// Spawns a worker that hands deliveries to `consumer` one at a time.
    /// Returns the unique consumer tag.
    pub fn add_consumer(
        &self,
        tag: &str,
        consumer: Box<dyn Consumer>,
    ) -> Result<String, BrokerError> {
        let receiver = self
            .inner
            .buffer
            .get()
            .ok_or_else(|| BrokerError::NotConsuming(self.inner.name.clone()))?
            .clone();
        if self.inner.stop.is_cancelled() {
            return Err(BrokerError::Stopped(self.inner.name.clone()));
        }

        let consumer_tag = format!("{tag}-{}", Uuid::new_v4().simple());
        let span = info_span!("worker", queue = %self.inner.name, consumer = %consumer_tag);
        self.track(worker::start(self.inner.stop.clone(), receiver, consumer).instrument(span));

        debug!(queue = %self.inner.name, consumer = %consumer_tag, "Consumer added");
        Ok(consumer_tag)
    }

    /// Stops this queue only and waits until it is drained.
    pub async fn stop_consuming(&self) {
        self.inner.stop.cancel();
        if self.inner.buffer.get().is_some() {
            self.inner.drained.cancelled().await;
        }
    }

    fn track<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner
            .all_tasks
            .spawn(self.inner.workers.track_future(task));
    }
}

async fn fetch(
    queue: Arc<QueueInner>,
    sender: Sender<Delivery>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = queue.stop.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let wait = match queue.broker.fetch(&queue.connection, &queue.name).await {
            Ok(Some(payload)) => {
                let delivery = Delivery::new(queue.clone(), payload, permit);
                // Capacity equals the prefetch limit and every buffered
                // delivery holds a permit, so this never waits. The queue
                // keeps a receiver, so the channel stays open.
                if sender.send(delivery).await.is_err() {
                    warn!(queue = %queue.name, "Local buffer closed, stopping fetch");
                    break;
                }
                false
            }
            Ok(None) => true,
            Err(err) => {
                queue.sink.report(BrokerFault::Consume {
                    queue: queue.name.clone(),
                    reason: err.to_string(),
                });
                true
            }
        };

        if wait {
            tokio::select! {
                biased;
                _ = queue.stop.cancelled() => break,
                _ = sleep(poll_interval) => {}
            }
        }
    }
    debug!("Fetch stopped");
}

async fn drain(queue: Arc<QueueInner>, receiver: Receiver<Delivery>) {
    queue.stop.cancelled().await;
    queue.workers.close();
    queue.workers.wait().await;

    let mut returned = 0;
    while let Ok(delivery) = receiver.try_recv() {
        if delivery.return_to_ready().await.is_ok() {
            returned += 1;
        }
    }
    if returned > 0 {
        info!(queue = %queue.name, returned, "Returned buffered deliveries to ready");
    }
    queue.drained.cancel();
}
