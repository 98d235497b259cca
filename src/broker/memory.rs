//! In-process broker with the same list semantics as the Redis backend.
//! Used by tests and for running the worker without Redis.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::Broker;
use crate::errors::BrokerError;

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    fail_fetch: AtomicBool,
    fail_heartbeat: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    connections: HashSet<String>,
    queues: HashMap<String, QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    opened: bool,
    /// Front is the newest payload, fetch takes from the back.
    ready: VecDeque<String>,
    unacked: HashMap<String, Vec<String>>,
    acked: Vec<String>,
    rejected: Vec<String>,
    max_unacked: usize,
}

impl QueueState {
    fn unacked_len(&self) -> usize {
        self.unacked.values().map(Vec::len).sum()
    }

    fn take_unacked(&mut self, connection: &str, queue: &str, payload: &str) -> Result<String, BrokerError> {
        let list = self
            .unacked
            .get_mut(connection)
            .ok_or_else(|| BrokerError::DeliveryNotFound(queue.to_string()))?;
        let pos = list
            .iter()
            .position(|p| p == payload)
            .ok_or_else(|| BrokerError::DeliveryNotFound(queue.to_string()))?;
        Ok(list.remove(pos))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> Option<T> {
        self.state().queues.get(queue).map(f)
    }

    /// Makes every following fetch fail until reset.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes every following heartbeat fail until reset.
    pub fn set_fail_heartbeat(&self, fail: bool) {
        self.fail_heartbeat.store(fail, Ordering::SeqCst);
    }

    pub fn is_registered(&self, connection: &str) -> bool {
        self.state().connections.contains(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn is_open(&self, queue: &str) -> bool {
        self.read(queue, |q| q.opened).unwrap_or(false)
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.read(queue, |q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_len(&self, queue: &str) -> usize {
        self.read(queue, QueueState::unacked_len).unwrap_or(0)
    }

    /// Highest number of simultaneously unacked payloads seen on `queue`.
    pub fn max_unacked(&self, queue: &str) -> usize {
        self.read(queue, |q| q.max_unacked).unwrap_or(0)
    }

    pub fn acked(&self, queue: &str) -> Vec<String> {
        self.read(queue, |q| q.acked.clone()).unwrap_or_default()
    }

    pub fn rejected(&self, queue: &str) -> Vec<String> {
        self.read(queue, |q| q.rejected.clone()).unwrap_or_default()
    }

    /// Number of payloads that were acked or rejected.
    pub fn settled(&self, queue: &str) -> usize {
        self.read(queue, |q| q.acked.len() + q.rejected.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn register_connection(&self, connection: &str) -> Result<(), BrokerError> {
        self.state().connections.insert(connection.to_string());
        Ok(())
    }

    async fn heartbeat(&self, connection: &str) -> Result<(), BrokerError> {
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(BrokerError::Backend(format!(
                "heartbeat for {connection} refused"
            )));
        }
        Ok(())
    }

    async fn unregister_connection(&self, connection: &str) -> Result<(), BrokerError> {
        self.state().connections.remove(connection);
        Ok(())
    }

    async fn open_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.state().queues.entry(queue.to_string()).or_default().opened = true;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_front(payload.to_string());
        Ok(())
    }

    async fn fetch(&self, connection: &str, queue: &str) -> Result<Option<String>, BrokerError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BrokerError::Backend(format!("fetch from {queue} refused")));
        }
        let mut state = self.state();
        let q = state.queues.entry(queue.to_string()).or_default();
        let Some(payload) = q.ready.pop_back() else {
            return Ok(None);
        };
        q.unacked
            .entry(connection.to_string())
            .or_default()
            .push(payload.clone());
        q.max_unacked = q.max_unacked.max(q.unacked_len());
        Ok(Some(payload))
    }

    async fn ack(&self, connection: &str, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        let q = state.queues.entry(queue.to_string()).or_default();
        let payload = q.take_unacked(connection, queue, payload)?;
        q.acked.push(payload);
        Ok(())
    }

    async fn reject(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        let q = state.queues.entry(queue.to_string()).or_default();
        let payload = q.take_unacked(connection, queue, payload)?;
        q.rejected.push(payload);
        Ok(())
    }

    async fn return_to_ready(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        let q = state.queues.entry(queue.to_string()).or_default();
        let payload = q.take_unacked(connection, queue, payload)?;
        q.ready.push_front(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_is_fifo_and_tracks_unacked() {
        let broker = MemoryBroker::new();
        broker.publish("q", "a").await.unwrap();
        broker.publish("q", "b").await.unwrap();

        assert_eq!(broker.fetch("c1", "q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(broker.fetch("c1", "q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(broker.fetch("c1", "q").await.unwrap(), None);
        assert_eq!(broker.unacked_len("q"), 2);
        assert_eq!(broker.max_unacked("q"), 2);

        broker.ack("c1", "q", "a").await.unwrap();
        broker.reject("c1", "q", "b").await.unwrap();
        assert_eq!(broker.acked("q"), vec!["a"]);
        assert_eq!(broker.rejected("q"), vec!["b"]);
        assert_eq!(broker.unacked_len("q"), 0);
        assert_eq!(broker.settled("q"), 2);
    }

    #[tokio::test]
    async fn settling_an_unknown_payload_fails() {
        let broker = MemoryBroker::new();
        broker.publish("q", "a").await.unwrap();
        broker.fetch("c1", "q").await.unwrap();

        assert!(matches!(
            broker.ack("c2", "q", "a").await,
            Err(BrokerError::DeliveryNotFound(_))
        ));
        broker.ack("c1", "q", "a").await.unwrap();
        assert!(matches!(
            broker.ack("c1", "q", "a").await,
            Err(BrokerError::DeliveryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn returned_payload_goes_to_the_back_of_the_line() {
        let broker = MemoryBroker::new();
        broker.publish("q", "a").await.unwrap();
        broker.publish("q", "b").await.unwrap();
        broker.fetch("c1", "q").await.unwrap();
        broker.return_to_ready("c1", "q", "a").await.unwrap();

        assert_eq!(broker.ready_len("q"), 2);
        assert_eq!(broker.fetch("c1", "q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(broker.fetch("c1", "q").await.unwrap().as_deref(), Some("a"));
    }
}
