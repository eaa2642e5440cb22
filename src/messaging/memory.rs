//! In-process broker with RabbitMQ-like semantics.
//!
//! Supports durable work queues, fanout and direct exchanges, server-named
//! queues, prefetch-one consumers, publisher outcomes that can be scripted
//! for failure tests, and requeue on nack. Every [`InMemoryChannel`] opened
//! from the same [`InMemoryBroker`] sees the same queues, so several stage
//! replicas can run against one broker inside a single test.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::debug;

use super::{BrokerChannel, DeliveryStream, ExchangeKind, PublishOutcome};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{CorrelationId, Delivery};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
}

/// A publish attempt as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub outcome: PublishOutcome,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
    Reject,
}

#[derive(Debug)]
struct SettlementRecord {
    queue: String,
    correlation_id: CorrelationId,
    settlement: Settlement,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<String>,
}

#[derive(Debug)]
struct Unacked {
    channel: u64,
    queue: String,
    from_consumer: bool,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    exchanges: HashMap<String, Exchange>,
    unacked: HashMap<u64, Unacked>,
    scripted_outcomes: VecDeque<PublishOutcome>,
    publishes: Vec<PublishRecord>,
    settlements: Vec<SettlementRecord>,
    next_channel: u64,
    next_tag: u64,
    next_queue: u64,
    closed: bool,
}

impl BrokerState {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed {
            return Err(BrokerError::Unavailable("connection closed".to_string()));
        }
        Ok(())
    }

    /// Queues a publish would land in.
    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let target = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Unavailable(format!("exchange {exchange} not declared")))?;

        Ok(match target.kind {
            ExchangeKind::Fanout => target.bindings.clone(),
            ExchangeKind::Direct => target
                .bindings
                .iter()
                .filter(|queue| queue.as_str() == routing_key)
                .cloned()
                .collect(),
        })
    }

    fn take(&mut self, channel: u64, queue: &str, from_consumer: bool) -> BrokerResult<Option<Delivery>> {
        self.ensure_open()?;

        // Prefetch one: a consumer holding an unsettled delivery gets nothing more.
        if from_consumer
            && self
                .unacked
                .values()
                .any(|u| u.channel == channel && u.from_consumer && u.queue == queue)
        {
            return Ok(None);
        }

        let messages = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let Some(message) = messages.pop_front() else {
            return Ok(None);
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery::new(tag, message.correlation_id, message.payload.clone());
        self.unacked.insert(
            tag,
            Unacked {
                channel,
                queue: queue.to_string(),
                from_consumer,
                message,
            },
        );
        Ok(Some(delivery))
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64, settlement: Settlement) -> BrokerResult<()> {
        self.ensure_open()?;
        match self.unacked.get(&delivery_tag) {
            Some(u) if u.channel == channel => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(delivery_tag)),
        }
        let Some(entry) = self.unacked.remove(&delivery_tag) else {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        };

        self.settlements.push(SettlementRecord {
            queue: entry.queue.clone(),
            correlation_id: entry.message.correlation_id,
            settlement,
        });
        if settlement == Settlement::Nack {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.push_front(entry.message);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to an in-process broker. Cloning shares the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel; delivery tags are settled per channel.
    pub fn channel(&self) -> InMemoryChannel {
        let id = {
            let mut state = self.shared.lock();
            state.next_channel += 1;
            state.next_channel
        };
        InMemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Force the outcomes of the next publishes, in order.
    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = PublishOutcome>) {
        self.shared.lock().scripted_outcomes.extend(outcomes);
    }

    /// Simulate connection loss: every pending and future operation fails.
    pub fn disconnect(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Ready messages in `queue`, or `None` if it was never declared.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(VecDeque::len)
    }

    /// Ready messages in `queue`, oldest first.
    pub fn queued(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every publish attempt on `exchange`, including rejected ones.
    pub fn publishes_to(&self, exchange: &str) -> Vec<PublishRecord> {
        self.shared
            .lock()
            .publishes
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    /// How deliveries of `correlation_id` were settled, in order, across
    /// every queue.
    pub fn settlements_of(&self, correlation_id: CorrelationId) -> Vec<Settlement> {
        self.shared
            .lock()
            .settlements
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .map(|r| r.settlement)
            .collect()
    }

    /// Like [`settlements_of`](Self::settlements_of), limited to deliveries
    /// taken from `queue`.
    pub fn settlements_in(&self, queue: &str, correlation_id: CorrelationId) -> Vec<Settlement> {
        self.shared
            .lock()
            .settlements
            .iter()
            .filter(|r| r.queue == queue && r.correlation_id == correlation_id)
            .map(|r| r.settlement)
            .collect()
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }
}

/// One logical connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, _durable: bool, _exclusive: bool) -> BrokerResult<String> {
        let mut state = self.shared.lock();
        state.ensure_open()?;
        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            name.to_string()
        };
        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.ensure_open()?;
        state.exchanges.entry(name.to_string()).or_insert(Exchange {
            kind,
            bindings: Vec::new(),
        });
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.ensure_open()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Unavailable(format!("exchange {exchange} not declared")))?;
        if !target.bindings.iter().any(|q| q == queue) {
            target.bindings.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        correlation_id: CorrelationId,
        payload: &[u8],
    ) -> BrokerResult<PublishOutcome> {
        let outcome = {
            let mut state = self.shared.lock();
            state.ensure_open()?;
            let targets = state.route(exchange, routing_key)?;

            let outcome = match state.scripted_outcomes.pop_front() {
                Some(forced) => forced,
                None if targets.is_empty() => PublishOutcome::Unroutable,
                None => PublishOutcome::Confirmed,
            };

            if outcome.is_confirmed() {
                for queue in &targets {
                    if let Some(messages) = state.queues.get_mut(queue) {
                        messages.push_back(StoredMessage {
                            correlation_id,
                            payload: payload.to_vec(),
                        });
                    }
                }
            }

            state.publishes.push(PublishRecord {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                correlation_id,
                payload: payload.to_vec(),
                outcome,
            });
            outcome
        };

        debug!(exchange = %exchange, routing_key = %routing_key, correlation_id = %correlation_id, ?outcome, "In-memory publish");
        self.shared.notify.notify_waiters();
        Ok(outcome)
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        {
            let state = self.shared.lock();
            state.ensure_open()?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
        }

        let seed = (Arc::clone(&self.shared), self.id, queue.to_string());
        let stream = futures::stream::unfold(seed, |(shared, channel, queue)| async move {
            loop {
                // Registered before checking so a publish in between is not missed.
                let notified = shared.notify.notified();
                let next = shared.lock().take(channel, &queue, true);
                match next {
                    Ok(Some(delivery)) => {
                        drop(notified);
                        return Some((Ok(delivery), (shared, channel, queue)));
                    }
                    Ok(None) => notified.await,
                    Err(_) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.shared.lock().settle(self.id, delivery_tag, Settlement::Ack)?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.shared.lock().settle(self.id, delivery_tag, Settlement::Nack)?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.shared.lock().settle(self.id, delivery_tag, Settlement::Reject)?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> BrokerResult<u32> {
        let state = self.shared.lock();
        state.ensure_open()?;
        state
            .queues
            .get(queue)
            .map(|q| q.len() as u32)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn get_one(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        self.shared.lock().take(self.id, queue, false)
    }
}
