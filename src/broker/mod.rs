//! Queue consumption on top of a reliable-queue broker.
//!
//! Payloads move `ready -> unacked` when fetched and leave the unacked list
//! exactly once, through [`Delivery::ack`] or [`Delivery::reject`].

use async_trait::async_trait;

use crate::errors::BrokerError;

mod connection;
mod delivery;
pub mod memory;
mod redis_broker;

pub use connection::{Connection, ConnectionOptions, Queue};
pub use delivery::Delivery;
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

/// Backend operations a [`Connection`] needs from the queue store.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), BrokerError>;

    async fn register_connection(&self, connection: &str) -> Result<(), BrokerError>;

    async fn heartbeat(&self, connection: &str) -> Result<(), BrokerError>;

    async fn unregister_connection(&self, connection: &str) -> Result<(), BrokerError>;

    async fn open_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError>;

    /// Moves the oldest ready payload into this connection's unacked list.
    async fn fetch(&self, connection: &str, queue: &str) -> Result<Option<String>, BrokerError>;

    async fn ack(&self, connection: &str, queue: &str, payload: &str) -> Result<(), BrokerError>;

    async fn reject(&self, connection: &str, queue: &str, payload: &str)
        -> Result<(), BrokerError>;

    async fn return_to_ready(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
    ) -> Result<(), BrokerError>;
}

/// A job handler bound to one worker. Each worker awaits `consume` before
/// taking its next delivery, so calls on one instance never overlap.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Delivery);
}
