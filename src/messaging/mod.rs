//! # Messaging Module
//!
//! The broker capability every stage is built on, plus two implementations:
//! - [`RabbitChannel`] over a live RabbitMQ connection
//! - [`InMemoryBroker`] for tests and local runs without a broker

pub mod memory;
pub mod rabbit_client;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerResult;
use crate::types::{CorrelationId, Delivery};

pub use memory::{InMemoryBroker, InMemoryChannel};
pub use rabbit_client::{RabbitChannel, RabbitConfig};

/// Stream of deliveries from a consumer; ends when the broker cancels it.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Exchange routing modes used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// Outcome of a confirmed publish. There is no fourth outcome: transport
/// failures surface as errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker took responsibility for the message.
    Confirmed,
    /// The broker declined to confirm the message.
    Nacked,
    /// No queue was bound to receive the message.
    Unroutable,
}

impl PublishOutcome {
    pub fn is_confirmed(self) -> bool {
        matches!(self, PublishOutcome::Confirmed)
    }
}

/// A single logical connection to the broker.
///
/// All operations may block on network I/O. Delivery tags are scoped to the
/// channel that handed them out, so a delivery must be settled on the same
/// channel it came from.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue and return its name. An empty `name` asks the broker
    /// to generate one.
    async fn declare_queue(&self, name: &str, durable: bool, exclusive: bool) -> BrokerResult<String>;

    /// Declare a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;

    /// Bind a queue to an exchange with an empty routing key.
    async fn bind(&self, queue: &str, exchange: &str) -> BrokerResult<()>;

    /// Publish a persistent message and wait for the broker's confirmation.
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        correlation_id: CorrelationId,
        payload: &[u8],
    ) -> BrokerResult<PublishOutcome>;

    /// Start a prefetch-one consumer on `queue`.
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Negative acknowledgement with requeue.
    async fn nack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Negative acknowledgement without requeue.
    async fn reject(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Number of ready messages in `queue`, without consuming any.
    async fn queue_depth(&self, queue: &str) -> BrokerResult<u32>;

    /// Pull a single message, if one is ready.
    async fn get_one(&self, queue: &str) -> BrokerResult<Option<Delivery>>;
}
