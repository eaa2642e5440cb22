//! Error types for the pipeline stages.

use thiserror::Error;

use crate::matching::BufferSnapshot;
use crate::types::CorrelationId;

/// Result type alias for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// The broker could not be reached or refused an operation.
///
/// Every variant is fatal to the stage: there is no in-process reconnect,
/// recovery is a process restart plus broker redelivery.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// AMQP protocol or connection error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Could not obtain a connection from the pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_lapin::PoolError),

    /// The connection pool could not be built from the configuration.
    #[error("Connection pool setup error: {0}")]
    CreatePool(#[from] deadpool_lapin::CreatePoolError),

    /// The broker went away or the channel was closed.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A passive declare or a pull referenced a queue that does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Ack or nack for a delivery this channel does not hold.
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
}

/// A processing function could not handle its input.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The OCR engine failed or produced unreadable output.
    #[error("OCR engine error: {0}")]
    Ocr(String),

    /// I/O error while talking to an external engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload was not the expected JSON shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The blocking task running the function panicked.
    #[error("Processing task failed: {0}")]
    Task(String),
}

/// Fatal stage failures.
#[derive(Error, Debug)]
pub enum StageError {
    /// Broker connectivity loss or protocol failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The unresolved broadcast buffer filled up before the wanted id arrived.
    #[error("Unresolved broadcast buffer exhausted while matching {target}: {snapshot}")]
    CapacityExhausted {
        target: CorrelationId,
        snapshot: BufferSnapshot,
    },

    /// A processing function failed and the failure policy is fatal.
    #[error("Processing failed for {correlation_id}: {source}")]
    Processing {
        correlation_id: CorrelationId,
        #[source]
        source: ProcessingError,
    },

    /// The broker closed the consumer stream.
    #[error("Consumer on queue {0} was cancelled")]
    ConsumerCancelled(String),
}

/// Failures of the operator commands that submit work and watch results.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker kept declining to confirm a publish.
    #[error("Publish to exchange {exchange:?} not confirmed after {attempts} attempts")]
    NotConfirmed { exchange: String, attempts: u32 },

    /// Nothing is bound to receive the message.
    #[error("Publish to exchange {exchange:?} with routing key {routing_key:?} was unroutable")]
    Unroutable { exchange: String, routing_key: String },

    /// The broker closed the result consumer.
    #[error("Consumer on queue {0} was cancelled")]
    ConsumerCancelled(String),
}
