//! Operator side of the pipeline: submitting images with their forbidden
//! terms, and watching redacted results arrive.

use std::time::Duration;

use futures::StreamExt;
use tracing::{info, warn};

use crate::error::{BrokerResult, ClientError};
use crate::messaging::{BrokerChannel, ExchangeKind, PublishOutcome};
use crate::shutdown::Shutdown;
use crate::types::{decode_boxes, CorrelationId, Settings, TextBoundingBox};

/// Where submissions go and how hard to retry them.
#[derive(Debug, Clone)]
pub struct SubmitConfig {
    pub broadcast_exchange: String,
    pub input_queue: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl SubmitConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            broadcast_exchange: settings.pii_filter.broadcast_exchange.clone(),
            input_queue: settings.ocr.input_queue.clone(),
            max_attempts: settings.submit.max_attempts,
            retry_delay: Duration::from_millis(settings.submit.retry_delay_ms),
        }
    }
}

/// Publishes an image and its forbidden-term list under a fresh
/// correlation id.
pub struct Submitter<B> {
    broker: B,
    config: SubmitConfig,
}

impl<B: BrokerChannel> Submitter<B> {
    pub async fn declare(broker: B, config: SubmitConfig) -> BrokerResult<Self> {
        broker
            .declare_exchange(&config.broadcast_exchange, ExchangeKind::Fanout)
            .await?;
        broker.declare_queue(&config.input_queue, true, false).await?;
        Ok(Self { broker, config })
    }

    /// Broadcast the lower-cased `terms`, then queue `image` for OCR.
    ///
    /// The terms go out first so a filter replica already holds them when
    /// the OCR result arrives.
    pub async fn submit(&self, image: &[u8], terms: &[String]) -> Result<CorrelationId, ClientError> {
        let id = CorrelationId::new();
        let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let payload = serde_json::to_vec(&terms)?;

        self.publish_with_retry(&self.config.broadcast_exchange, "", id, &payload)
            .await?;
        self.publish_with_retry("", &self.config.input_queue, id, image)
            .await?;

        info!(correlation_id = %id, terms = terms.len(), image_bytes = image.len(), "Submitted image");
        Ok(id)
    }

    async fn publish_with_retry(
        &self,
        exchange: &str,
        routing_key: &str,
        id: CorrelationId,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        for attempt in 1..=self.config.max_attempts {
            match self
                .broker
                .publish_confirmed(exchange, routing_key, id, payload)
                .await?
            {
                PublishOutcome::Confirmed => return Ok(()),
                PublishOutcome::Unroutable => {
                    return Err(ClientError::Unroutable {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    });
                }
                PublishOutcome::Nacked => {
                    warn!(correlation_id = %id, exchange = %exchange, attempt, "Publish nacked");
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(ClientError::NotConfirmed {
            exchange: exchange.to_string(),
            attempts: self.config.max_attempts,
        })
    }
}

/// A redacted result as read from the output exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactedResult {
    pub correlation_id: CorrelationId,
    pub boxes: Vec<TextBoundingBox>,
}

/// Private subscription to the output exchange.
pub struct ResultWatcher<B> {
    broker: B,
    queue: String,
}

impl<B: BrokerChannel> ResultWatcher<B> {
    /// Bind an exclusive, server-named queue to `output_exchange`.
    pub async fn declare(broker: B, output_exchange: &str) -> BrokerResult<Self> {
        broker
            .declare_exchange(output_exchange, ExchangeKind::Fanout)
            .await?;
        let queue = broker.declare_queue("", true, true).await?;
        broker.bind(&queue, output_exchange).await?;
        Ok(Self { broker, queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Hand every result to `on_result` until shutdown. Returns how many
    /// results were delivered.
    ///
    /// Results that are not a box list are logged and acknowledged.
    pub async fn run<F>(&self, mut shutdown: Shutdown, mut on_result: F) -> Result<usize, ClientError>
    where
        F: FnMut(RedactedResult),
    {
        let mut deliveries = self.broker.consume(&self.queue).await?;
        let mut seen = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = deliveries.next() => next,
            };
            let Some(delivery) = next else {
                if shutdown.is_triggered() {
                    break;
                }
                return Err(ClientError::ConsumerCancelled(self.queue.clone()));
            };
            let delivery = delivery?;

            match decode_boxes(&delivery.payload) {
                Ok(boxes) => {
                    seen += 1;
                    on_result(RedactedResult {
                        correlation_id: delivery.correlation_id,
                        boxes,
                    });
                }
                Err(error) => {
                    warn!(correlation_id = %delivery.correlation_id, error = %error, "Result is not a box list");
                }
            }
            self.broker.ack(delivery.delivery_tag).await?;
        }

        Ok(seen)
    }
}
