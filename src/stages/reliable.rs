//! Single-input, single-output stage with publisher confirms.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use super::{run_blocking, settle, settle_failure, PipelineStage, StageOutput};
use crate::error::{Result, StageError};
use crate::messaging::BrokerChannel;
use crate::processing::Processor;
use crate::shutdown::Shutdown;
use crate::types::{Delivery, FailurePolicy, Settings};

/// Queues and policy for a [`ReliableStage`].
#[derive(Debug, Clone)]
pub struct ReliableStageConfig {
    pub input_queue: String,
    pub output: StageOutput,
    pub failure_policy: FailurePolicy,
}

impl ReliableStageConfig {
    /// OCR stage wiring.
    pub fn ocr(settings: &Settings) -> Self {
        Self {
            input_queue: settings.ocr.input_queue.clone(),
            output: StageOutput::from_parts(&settings.ocr.output_exchange, &settings.ocr.output_queue),
            failure_policy: settings.failure_policy,
        }
    }
}

/// Consumes one message, processes it, publishes exactly one result and
/// settles the input according to the publish outcome.
pub struct ReliableStage<B, P> {
    broker: B,
    processor: Arc<P>,
    config: ReliableStageConfig,
    processed: u64,
}

impl<B, P> ReliableStage<B, P>
where
    B: BrokerChannel,
    P: Processor,
{
    /// Declare the input queue and the output, then build the stage.
    pub async fn declare(broker: B, processor: P, config: ReliableStageConfig) -> Result<Self> {
        broker.declare_queue(&config.input_queue, true, false).await?;
        config.output.declare(&broker).await?;

        info!(
            stage = processor.name(),
            input = %config.input_queue,
            output = %config.output,
            "Declared stage topology"
        );

        Ok(Self {
            broker,
            processor: Arc::new(processor),
            config,
            processed: 0,
        })
    }

    /// Number of deliveries settled so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    async fn handle(&mut self, delivery: Delivery) -> Result<()> {
        let Delivery {
            delivery_tag,
            correlation_id,
            payload,
        } = delivery;
        info!(correlation_id = %correlation_id, bytes = payload.len(), "Consumed message");

        let processor = Arc::clone(&self.processor);
        let output = match run_blocking(move || processor.process(&payload)).await {
            Ok(output) => output,
            Err(error) => {
                self.processed += 1;
                return settle_failure(
                    &self.broker,
                    self.config.failure_policy,
                    delivery_tag,
                    correlation_id,
                    error,
                )
                .await;
            }
        };

        let outcome = self
            .broker
            .publish_confirmed(
                self.config.output.exchange(),
                self.config.output.routing_key(),
                correlation_id,
                &output,
            )
            .await?;
        settle(&self.broker, delivery_tag, correlation_id, outcome).await?;

        self.processed += 1;
        Ok(())
    }
}

#[async_trait]
impl<B, P> PipelineStage for ReliableStage<B, P>
where
    B: BrokerChannel,
    P: Processor,
{
    fn name(&self) -> &str {
        self.processor.name()
    }

    async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let mut deliveries = self.broker.consume(&self.config.input_queue).await?;
        info!(stage = self.name(), queue = %self.config.input_queue, "Waiting for messages");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(delivery) => self.handle(delivery?).await?,
                None if shutdown.is_triggered() => break,
                None => {
                    warn!(queue = %self.config.input_queue, "Consumer stream ended");
                    return Err(StageError::ConsumerCancelled(self.config.input_queue.clone()));
                }
            }
        }

        info!(stage = self.name(), processed = self.processed, "Stage stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, ProcessingError};
    use crate::messaging::memory::Settlement;
    use crate::messaging::{InMemoryBroker, PublishOutcome};
    use crate::types::CorrelationId;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Upper;

    impl Processor for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn process(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, ProcessingError> {
            if payload == b"fail" {
                return Err(ProcessingError::Ocr("unreadable".to_string()));
            }
            Ok(payload.to_ascii_uppercase())
        }
    }

    fn config(policy: FailurePolicy) -> ReliableStageConfig {
        ReliableStageConfig {
            input_queue: "in".to_string(),
            output: StageOutput::Queue("out".to_string()),
            failure_policy: policy,
        }
    }

    async fn stage(broker: &InMemoryBroker, policy: FailurePolicy) -> ReliableStage<crate::messaging::InMemoryChannel, Upper> {
        ReliableStage::declare(broker.channel(), Upper, config(policy))
            .await
            .unwrap()
    }

    async fn send(broker: &InMemoryBroker, payload: &[u8]) -> CorrelationId {
        let id = CorrelationId::new();
        broker
            .channel()
            .publish_confirmed("", "in", id, payload)
            .await
            .unwrap();
        id
    }

    /// Run the stage until `done` holds, then stop it gracefully.
    async fn run_until<F>(mut stage: ReliableStage<crate::messaging::InMemoryChannel, Upper>, done: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        let (trigger, shutdown) = Shutdown::channel();
        let handle = tokio::spawn(async move { stage.run(shutdown).await });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        trigger.trigger();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_one_output_per_input_with_same_id() {
        let broker = InMemoryBroker::new();
        let stage = stage(&broker, FailurePolicy::Reject).await;
        let a = send(&broker, b"abc").await;
        let b = send(&broker, b"def").await;

        let watch = broker.clone();
        run_until(stage, move || watch.queue_len("out") == Some(2)).await.unwrap();

        let out = broker.queued("out");
        assert_eq!(out[0].correlation_id, a);
        assert_eq!(out[0].payload, b"ABC".to_vec());
        assert_eq!(out[1].correlation_id, b);
        assert_eq!(broker.settlements_of(a), vec![Settlement::Ack]);
        assert_eq!(broker.settlements_of(b), vec![Settlement::Ack]);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_publish_requeues_input() {
        let broker = InMemoryBroker::new();
        let stage = stage(&broker, FailurePolicy::Reject).await;
        let id = send(&broker, b"abc").await;
        broker.script_outcomes([PublishOutcome::Nacked, PublishOutcome::Unroutable]);

        let watch = broker.clone();
        run_until(stage, move || watch.queue_len("out") == Some(1)).await.unwrap();

        // Two rejected attempts, then the redelivery goes through.
        assert_eq!(
            broker.settlements_of(id),
            vec![Settlement::Nack, Settlement::Nack, Settlement::Ack]
        );
        let outcomes: Vec<_> = broker.publishes_to("").iter().skip(1).map(|p| p.outcome).collect();
        assert_eq!(
            outcomes,
            vec![PublishOutcome::Nacked, PublishOutcome::Unroutable, PublishOutcome::Confirmed]
        );
    }

    #[tokio::test]
    async fn test_processing_failure_is_rejected() {
        let broker = InMemoryBroker::new();
        let stage = stage(&broker, FailurePolicy::Reject).await;
        let bad = send(&broker, b"fail").await;
        let good = send(&broker, b"ok").await;

        let watch = broker.clone();
        run_until(stage, move || watch.queue_len("out") == Some(1)).await.unwrap();

        assert_eq!(broker.settlements_of(bad), vec![Settlement::Reject]);
        assert_eq!(broker.settlements_of(good), vec![Settlement::Ack]);
        assert_eq!(broker.queue_len("in"), Some(0));
    }

    #[tokio::test]
    async fn test_fatal_policy_stops_the_stage() {
        let broker = InMemoryBroker::new();
        let mut stage = stage(&broker, FailurePolicy::Fatal).await;
        let bad = send(&broker, b"fail").await;

        let err = stage.run(Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, StageError::Processing { correlation_id, .. } if correlation_id == bad));
        assert_eq!(broker.queue_len("in"), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_before_any_message() {
        let broker = InMemoryBroker::new();
        let mut stage = stage(&broker, FailurePolicy::Reject).await;
        let (trigger, shutdown) = Shutdown::channel();
        trigger.trigger();

        stage.run(shutdown).await.unwrap();
        assert_eq!(stage.processed(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_is_fatal() {
        let broker = InMemoryBroker::new();
        let mut stage = stage(&broker, FailurePolicy::Reject).await;
        broker.disconnect();

        let err = stage.run(Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, StageError::Broker(BrokerError::Unavailable(_))));
    }
}
