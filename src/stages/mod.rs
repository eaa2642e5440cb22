//! # Pipeline Stages
//!
//! Long-running consume → process → publish loops. Each stage owns one
//! broker channel and handles one delivery at a time:
//! - [`ReliableStage`]: one input message in, one output message out
//! - [`CorrelatingStage`]: joins each input with a broadcast payload

pub mod correlating;
pub mod reliable;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{BrokerResult, ProcessingError, Result, StageError};
use crate::messaging::{BrokerChannel, ExchangeKind, PublishOutcome};
use crate::shutdown::Shutdown;
use crate::types::{CorrelationId, FailurePolicy};

pub use correlating::{CorrelatingStage, CorrelatingStageConfig};
pub use reliable::{ReliableStage, ReliableStageConfig};

/// A stage loop that runs until shutdown or a fatal error.
#[async_trait]
pub trait PipelineStage: Send {
    /// Get the name of this stage.
    fn name(&self) -> &str;

    /// Consume and process deliveries until `shutdown` fires.
    ///
    /// Returns `Ok(())` after a graceful stop. Any error is fatal.
    async fn run(&mut self, shutdown: Shutdown) -> Result<()>;
}

/// Where a stage publishes its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// A durable queue, addressed through the default exchange.
    Queue(String),
    /// A fanout exchange; every bound queue gets a copy.
    Fanout(String),
}

impl StageOutput {
    /// Pick the output from an exchange/queue pair. An empty exchange means
    /// the default exchange routing straight to `queue`.
    pub fn from_parts(exchange: &str, queue: &str) -> Self {
        if exchange.is_empty() {
            StageOutput::Queue(queue.to_string())
        } else {
            StageOutput::Fanout(exchange.to_string())
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            StageOutput::Queue(_) => "",
            StageOutput::Fanout(exchange) => exchange,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            StageOutput::Queue(queue) => queue,
            StageOutput::Fanout(_) => "",
        }
    }

    pub(crate) async fn declare<B>(&self, broker: &B) -> BrokerResult<()>
    where
        B: BrokerChannel + ?Sized,
    {
        match self {
            StageOutput::Queue(queue) => {
                broker.declare_queue(queue, true, false).await?;
            }
            StageOutput::Fanout(exchange) => {
                broker.declare_exchange(exchange, ExchangeKind::Fanout).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for StageOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutput::Queue(queue) => write!(f, "queue {queue}"),
            StageOutput::Fanout(exchange) => write!(f, "exchange {exchange}"),
        }
    }
}

/// Ack a delivery whose result was confirmed, nack it otherwise.
pub(crate) async fn settle<B>(
    broker: &B,
    delivery_tag: u64,
    correlation_id: CorrelationId,
    outcome: PublishOutcome,
) -> BrokerResult<()>
where
    B: BrokerChannel + ?Sized,
{
    match outcome {
        PublishOutcome::Confirmed => {
            broker.ack(delivery_tag).await?;
            info!(correlation_id = %correlation_id, "Published result and acknowledged input");
        }
        PublishOutcome::Nacked | PublishOutcome::Unroutable => {
            broker.nack(delivery_tag).await?;
            warn!(correlation_id = %correlation_id, ?outcome, "Publish not confirmed, input requeued");
        }
    }
    Ok(())
}

/// Settle a delivery whose processing function failed.
///
/// Returns the error back when the policy is fatal; the delivery is
/// requeued first so it is not lost.
pub(crate) async fn settle_failure<B>(
    broker: &B,
    policy: FailurePolicy,
    delivery_tag: u64,
    correlation_id: CorrelationId,
    error: ProcessingError,
) -> Result<()>
where
    B: BrokerChannel + ?Sized,
{
    match policy {
        FailurePolicy::Reject => {
            warn!(correlation_id = %correlation_id, error = %error, "Processing failed, input rejected");
            broker.reject(delivery_tag).await?;
            Ok(())
        }
        FailurePolicy::Requeue => {
            warn!(correlation_id = %correlation_id, error = %error, "Processing failed, input requeued");
            broker.nack(delivery_tag).await?;
            Ok(())
        }
        FailurePolicy::Fatal => {
            broker.nack(delivery_tag).await?;
            Err(StageError::Processing {
                correlation_id,
                source: error,
            })
        }
    }
}

/// Run a synchronous processing function off the async executor.
pub(crate) async fn run_blocking<F>(f: F) -> std::result::Result<Vec<u8>, ProcessingError>
where
    F: FnOnce() -> std::result::Result<Vec<u8>, ProcessingError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProcessingError::Task(e.to_string()))?
}
