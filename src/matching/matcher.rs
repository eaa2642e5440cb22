//! Joins primary messages with their broadcast counterparts.
//!
//! Every replica of the correlating stage binds its own queue to the
//! broadcast exchange, so each one sees every broadcast payload. Only the
//! replica that joins a payload should keep it; the others learn about the
//! join through tombstones on a second fanout exchange and drop their copy.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buffer::{BroadcastDisposition, MatchBuffer, TombstoneDisposition};
use crate::error::{BrokerResult, Result};
use crate::messaging::{BrokerChannel, ExchangeKind, PublishOutcome};
use crate::shutdown::Shutdown;
use crate::types::CorrelationId;

/// Exchanges and limits for a [`BroadcastMatcher`].
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub broadcast_exchange: String,
    pub tombstone_exchange: String,
    /// Maximum number of unmatched broadcast payloads kept locally
    pub capacity: usize,
    /// How often to re-check an empty broadcast queue
    pub poll_interval: Duration,
}

/// Matching strategy owned by a single correlating stage loop.
#[derive(Debug)]
pub struct BroadcastMatcher {
    buffer: MatchBuffer,
    broadcast_queue: String,
    tombstone_queue: String,
    tombstone_exchange: String,
    poll_interval: Duration,
    /// Tombstone payload identifying this replica
    origin: Vec<u8>,
}

impl BroadcastMatcher {
    /// Declare both fanout exchanges and this replica's private queues.
    pub async fn declare<B>(broker: &B, config: MatcherConfig) -> BrokerResult<Self>
    where
        B: BrokerChannel + ?Sized,
    {
        broker
            .declare_exchange(&config.broadcast_exchange, ExchangeKind::Fanout)
            .await?;
        let broadcast_queue = broker.declare_queue("", true, true).await?;
        broker
            .bind(&broadcast_queue, &config.broadcast_exchange)
            .await?;

        broker
            .declare_exchange(&config.tombstone_exchange, ExchangeKind::Fanout)
            .await?;
        let tombstone_queue = broker.declare_queue("", true, true).await?;
        broker
            .bind(&tombstone_queue, &config.tombstone_exchange)
            .await?;

        let replica_id = Uuid::new_v4();
        info!(
            replica_id = %replica_id,
            broadcast_queue = %broadcast_queue,
            tombstone_queue = %tombstone_queue,
            capacity = config.capacity,
            "Broadcast matcher ready"
        );

        Ok(Self {
            buffer: MatchBuffer::new(config.capacity),
            broadcast_queue,
            tombstone_queue,
            tombstone_exchange: config.tombstone_exchange,
            poll_interval: config.poll_interval,
            origin: replica_id.to_string().into_bytes(),
        })
    }

    pub fn buffer(&self) -> &MatchBuffer {
        &self.buffer
    }

    pub fn broadcast_queue(&self) -> &str {
        &self.broadcast_queue
    }

    pub fn tombstone_queue(&self) -> &str {
        &self.tombstone_queue
    }

    /// Find the broadcast payload for `target`.
    ///
    /// Returns `Ok(None)` if shutdown was requested while waiting for
    /// broadcast messages. Broadcast deliveries are acknowledged once they
    /// are matched, buffered or discarded; one that does not fit in the
    /// buffer is requeued before the capacity error is returned.
    pub async fn find<B>(
        &mut self,
        broker: &B,
        target: CorrelationId,
        shutdown: &mut Shutdown,
    ) -> Result<Option<Vec<u8>>>
    where
        B: BrokerChannel + ?Sized,
    {
        if let Some(payload) = self.buffer.take(target) {
            debug!(correlation_id = %target, "Matched from buffer");
            return Ok(Some(payload));
        }

        loop {
            if !self.wait_for_broadcast(broker, shutdown).await? {
                return Ok(None);
            }

            let Some(delivery) = broker.get_one(&self.broadcast_queue).await? else {
                continue;
            };
            info!(correlation_id = %delivery.correlation_id, "Consumed broadcast message");

            let disposition = match self.buffer.offer(target, delivery.correlation_id, delivery.payload) {
                Ok(disposition) => disposition,
                Err(error) => {
                    broker.nack(delivery.delivery_tag).await?;
                    return Err(error);
                }
            };
            broker.ack(delivery.delivery_tag).await?;

            match disposition {
                BroadcastDisposition::Matched(payload) => return Ok(Some(payload)),
                BroadcastDisposition::Discarded => {
                    debug!(correlation_id = %delivery.correlation_id, "Broadcast already consumed elsewhere, discarded");
                }
                BroadcastDisposition::Buffered | BroadcastDisposition::Replaced => {
                    debug!(
                        correlation_id = %delivery.correlation_id,
                        unresolved = self.buffer.len(),
                        capacity = self.buffer.capacity(),
                        "Buffered unmatched broadcast"
                    );
                }
            }
        }
    }

    /// Return a joined payload to the buffer so a redelivered primary can
    /// find it again. Returns `false` if the buffer had no room.
    pub fn restore(&mut self, id: CorrelationId, payload: Vec<u8>) -> bool {
        let kept = self.buffer.restore(id, payload);
        if !kept {
            warn!(correlation_id = %id, capacity = self.buffer.capacity(), "No room to restore broadcast payload");
        }
        kept
    }

    /// Poll the broadcast queue depth until a message is ready.
    async fn wait_for_broadcast<B>(&self, broker: &B, shutdown: &mut Shutdown) -> Result<bool>
    where
        B: BrokerChannel + ?Sized,
    {
        loop {
            if broker.queue_depth(&self.broadcast_queue).await? > 0 {
                return Ok(true);
            }
            tokio::select! {
                _ = shutdown.wait() => return Ok(false),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Tell sibling replicas that the payload for `id` has been consumed.
    pub async fn announce_consumed<B>(&self, broker: &B, id: CorrelationId) -> BrokerResult<PublishOutcome>
    where
        B: BrokerChannel + ?Sized,
    {
        let outcome = broker
            .publish_confirmed(&self.tombstone_exchange, "", id, &self.origin)
            .await?;
        if !outcome.is_confirmed() {
            warn!(correlation_id = %id, ?outcome, "Tombstone was not confirmed");
        }
        Ok(outcome)
    }

    /// Apply every tombstone currently queued for this replica.
    ///
    /// Our own tombstones are skipped: the join already removed our copy.
    pub async fn drain_tombstones<B>(&mut self, broker: &B) -> BrokerResult<usize>
    where
        B: BrokerChannel + ?Sized,
    {
        let mut applied = 0;
        while broker.queue_depth(&self.tombstone_queue).await? > 0 {
            let Some(delivery) = broker.get_one(&self.tombstone_queue).await? else {
                break;
            };

            if delivery.payload != self.origin {
                let disposition = self.buffer.apply_tombstone(delivery.correlation_id);
                debug!(correlation_id = %delivery.correlation_id, ?disposition, "Applied tombstone");
                if disposition == TombstoneDisposition::Evicted {
                    applied += 1;
                }
            }
            broker.ack(delivery.delivery_tag).await?;
        }
        Ok(applied)
    }
}
