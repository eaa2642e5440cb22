//! Stage that joins each primary message with a broadcast payload.
//!
//! For every primary delivery the stage looks up the broadcast payload with
//! the same correlation id, runs the join function, publishes the result to
//! a fanout exchange and then announces the consumption with a tombstone so
//! sibling replicas drop their copies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{run_blocking, settle, settle_failure, PipelineStage, StageOutput};
use crate::error::{Result, StageError};
use crate::matching::{BroadcastMatcher, MatcherConfig};
use crate::messaging::BrokerChannel;
use crate::processing::JoinProcessor;
use crate::shutdown::Shutdown;
use crate::types::{Delivery, FailurePolicy, Settings};

/// Queues, exchanges and limits for a [`CorrelatingStage`].
#[derive(Debug, Clone)]
pub struct CorrelatingStageConfig {
    pub input_queue: String,
    /// Fanout exchange receiving the joined results
    pub output_exchange: String,
    pub matcher: MatcherConfig,
    pub failure_policy: FailurePolicy,
}

impl CorrelatingStageConfig {
    /// PII filter stage wiring.
    pub fn pii_filter(settings: &Settings) -> Self {
        let pii = &settings.pii_filter;
        Self {
            input_queue: pii.input_queue.clone(),
            output_exchange: pii.output_exchange.clone(),
            matcher: MatcherConfig {
                broadcast_exchange: pii.broadcast_exchange.clone(),
                tombstone_exchange: pii.tombstone_exchange.clone(),
                capacity: pii.unresolved_buffer,
                poll_interval: Duration::from_millis(pii.poll_interval_ms),
            },
            failure_policy: settings.failure_policy,
        }
    }
}

/// How handling one primary delivery ended.
enum Handled {
    Done,
    Interrupted,
}

pub struct CorrelatingStage<B, J> {
    broker: B,
    processor: Arc<J>,
    input_queue: String,
    output: StageOutput,
    failure_policy: FailurePolicy,
    matcher: BroadcastMatcher,
    processed: u64,
}

impl<B, J> CorrelatingStage<B, J>
where
    B: BrokerChannel,
    J: JoinProcessor,
{
    /// Declare the primary queue, the output exchange and this replica's
    /// broadcast and tombstone queues.
    ///
    /// Broadcasts published before this returns are not seen by the replica.
    pub async fn declare(broker: B, processor: J, config: CorrelatingStageConfig) -> Result<Self> {
        broker.declare_queue(&config.input_queue, true, false).await?;
        let output = StageOutput::Fanout(config.output_exchange);
        output.declare(&broker).await?;
        let matcher = BroadcastMatcher::declare(&broker, config.matcher).await?;

        info!(
            stage = processor.name(),
            input = %config.input_queue,
            output = %output,
            "Declared stage topology"
        );

        Ok(Self {
            broker,
            processor: Arc::new(processor),
            input_queue: config.input_queue,
            output,
            failure_policy: config.failure_policy,
            matcher,
            processed: 0,
        })
    }

    pub fn matcher(&self) -> &BroadcastMatcher {
        &self.matcher
    }

    /// Number of primary deliveries settled so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    async fn handle(&mut self, delivery: Delivery, shutdown: &mut Shutdown) -> Result<Handled> {
        let Delivery {
            delivery_tag,
            correlation_id,
            payload: primary,
        } = delivery;
        info!(correlation_id = %correlation_id, bytes = primary.len(), "Consumed primary message");

        let Some(matched) = self
            .matcher
            .find(&self.broker, correlation_id, shutdown)
            .await?
        else {
            self.broker.nack(delivery_tag).await?;
            info!(correlation_id = %correlation_id, "Stopped while waiting for broadcast, primary requeued");
            return Ok(Handled::Interrupted);
        };

        let retained = matched.clone();
        let processor = Arc::clone(&self.processor);
        let result = run_blocking(move || processor.process(&primary, &matched)).await;
        self.processed += 1;

        match result {
            Ok(output) => {
                let outcome = self
                    .broker
                    .publish_confirmed(
                        self.output.exchange(),
                        self.output.routing_key(),
                        correlation_id,
                        &output,
                    )
                    .await?;
                // The nacked primary comes back to a replica that still
                // needs its payload. Siblings drop theirs on the tombstone.
                if !outcome.is_confirmed() {
                    self.matcher.restore(correlation_id, retained);
                }
                settle(&self.broker, delivery_tag, correlation_id, outcome).await?;
            }
            Err(error) => {
                // A requeued primary needs its payload again; without room
                // for it the delivery is rejected instead.
                let policy = match self.failure_policy {
                    FailurePolicy::Requeue => {
                        if self.matcher.restore(correlation_id, retained) {
                            FailurePolicy::Requeue
                        } else {
                            FailurePolicy::Reject
                        }
                    }
                    policy => policy,
                };
                settle_failure(&self.broker, policy, delivery_tag, correlation_id, error).await?;
                if policy == FailurePolicy::Requeue {
                    return Ok(Handled::Done);
                }
            }
        }

        self.matcher
            .announce_consumed(&self.broker, correlation_id)
            .await?;
        let evicted = self.matcher.drain_tombstones(&self.broker).await?;
        debug!(
            correlation_id = %correlation_id,
            evicted,
            unresolved = self.matcher.buffer().len(),
            tombstoned = self.matcher.buffer().tombstone_count(),
            "Tombstones drained"
        );

        Ok(Handled::Done)
    }
}

#[async_trait]
impl<B, J> PipelineStage for CorrelatingStage<B, J>
where
    B: BrokerChannel,
    J: JoinProcessor,
{
    fn name(&self) -> &str {
        self.processor.name()
    }

    async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let mut deliveries = self.broker.consume(&self.input_queue).await?;
        info!(stage = self.name(), queue = %self.input_queue, "Waiting for messages");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(delivery) => {
                    if let Handled::Interrupted = self.handle(delivery?, &mut shutdown).await? {
                        break;
                    }
                }
                None if shutdown.is_triggered() => break,
                None => {
                    warn!(queue = %self.input_queue, "Consumer stream ended");
                    return Err(StageError::ConsumerCancelled(self.input_queue.clone()));
                }
            }
        }

        // Drop copies that siblings joined while this replica was idle.
        let evicted = self.matcher.drain_tombstones(&self.broker).await?;

        info!(
            stage = self.name(),
            processed = self.processed,
            evicted,
            unresolved = self.matcher.buffer().len(),
            "Stage stopped"
        );
        Ok(())
    }
}
