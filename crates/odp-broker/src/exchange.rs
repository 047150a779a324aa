//! In-process topic exchange with durable named queues
//!
//! Queues are bound with a topic pattern; published messages are copied
//! into every matching queue. A consumer takes one delivery at a time and
//! must settle it (ack or nack) before the next one, which is the
//! prefetch-1 backpressure the pipeline relies on: a slow handler
//! throttles its own queue without starving others.
//!
//! Settlement is terminal. Ack removes the message permanently; nack
//! never requeues: the message is republished to the queue's configured
//! dead-letter routing key, or discarded if there is none. Messages that
//! outlive the queue's TTL are dead-lettered the same way at delivery
//! time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::topic::TopicPattern;
use crate::{BrokerError, Result};

/// Per-queue declaration arguments
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Declared durable (kept for broker-contract parity; the in-process
    /// exchange does not survive a restart either way)
    pub durable: bool,
    /// Routing key that nacked or expired messages are republished to
    pub dead_letter_routing_key: Option<String>,
    /// Time a message may sit in the queue before it is dead-lettered
    pub message_ttl: Option<Duration>,
    /// Consumer instances the dispatcher starts for this queue
    pub consumers: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            dead_letter_routing_key: None,
            message_ttl: None,
            consumers: 1,
        }
    }
}

/// A message as it sits in a queue
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub routing_key: String,
    /// UTF-8 JSON body
    pub payload: Vec<u8>,
    enqueued_at: Instant,
}

impl Envelope {
    fn new(routing_key: &str, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.to_string(),
            payload,
            enqueued_at: Instant::now(),
        }
    }
}

/// An unsettled delivery handed to a consumer
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    queue: String,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting for delivery
    pub ready: usize,
    /// Delivered but not yet settled
    pub unacked: usize,
}

impl QueueDepth {
    pub fn is_drained(&self) -> bool {
        self.ready == 0 && self.unacked == 0
    }
}

struct QueueState {
    binding_key: String,
    binding: TopicPattern,
    opts: QueueOptions,
    ready: VecDeque<Envelope>,
    unacked: usize,
}

/// Process-local topic exchange
pub struct TopicExchange {
    name: String,
    inner: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
}

/// How long an idle consumer sleeps before re-checking its queue
const CONSUMER_POLL: Duration = Duration::from_millis(25);

impl TopicExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a queue bound to this exchange
    ///
    /// Redeclaring an existing queue with the same binding key is a
    /// no-op; a different binding key is a conflict.
    pub fn declare_queue(&self, queue: &str, binding_key: &str, opts: QueueOptions) -> Result<()> {
        let binding = TopicPattern::parse(binding_key)?;
        let mut inner = self.inner.lock().expect("exchange lock poisoned");

        if let Some(existing) = inner.get(queue) {
            if existing.binding_key != binding_key {
                return Err(BrokerError::BindingConflict(queue.to_string()));
            }
            return Ok(());
        }

        debug!(
            exchange = %self.name,
            queue,
            binding_key,
            durable = opts.durable,
            "Declared queue"
        );

        inner.insert(
            queue.to_string(),
            QueueState {
                binding_key: binding_key.to_string(),
                binding,
                opts,
                ready: VecDeque::new(),
                unacked: 0,
            },
        );

        Ok(())
    }

    /// Publish a message to every queue whose binding matches
    ///
    /// Returns the number of queues the message was routed to. An
    /// unroutable message is dropped, as a topic exchange does.
    pub fn publish(&self, routing_key: &str, payload: &[u8]) -> usize {
        let mut routed = 0;
        {
            let mut inner = self.inner.lock().expect("exchange lock poisoned");
            for (queue, state) in inner.iter_mut() {
                if state.binding.matches(routing_key) {
                    state.ready.push_back(Envelope::new(routing_key, payload.to_vec()));
                    routed += 1;
                    trace!(queue, routing_key, "Routed message");
                }
            }
        }

        if routed == 0 {
            warn!(exchange = %self.name, routing_key, "Unroutable message dropped");
        } else {
            self.notify.notify_waiters();
        }

        routed
    }

    /// Current depth of a queue
    pub fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let inner = self.inner.lock().expect("exchange lock poisoned");
        let state = inner
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        Ok(QueueDepth {
            ready: state.ready.len(),
            unacked: state.unacked,
        })
    }

    /// Create a consumer for a declared queue
    pub fn consumer(self: &Arc<Self>, queue: &str) -> Result<Consumer> {
        {
            let inner = self.inner.lock().expect("exchange lock poisoned");
            if !inner.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
        }
        Ok(Consumer {
            exchange: Arc::clone(self),
            queue: queue.to_string(),
        })
    }

    /// Pop the next live message, dead-lettering any expired ones
    fn take_ready(&self, queue: &str) -> Result<Option<Envelope>> {
        let mut expired: Vec<(String, Envelope)> = Vec::new();
        let taken;
        {
            let mut inner = self.inner.lock().expect("exchange lock poisoned");
            let state = inner
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

            loop {
                match state.ready.pop_front() {
                    Some(env)
                        if state
                            .opts
                            .message_ttl
                            .is_some_and(|ttl| env.enqueued_at.elapsed() > ttl) =>
                    {
                        if let Some(key) = state.opts.dead_letter_routing_key.clone() {
                            expired.push((key, env));
                        }
                        // No dead-letter target: the expired message is discarded.
                    }
                    Some(env) => {
                        state.unacked += 1;
                        taken = Some(env);
                        break;
                    }
                    None => {
                        taken = None;
                        break;
                    }
                }
            }
        }

        // Republish outside the lock; publish() takes it again.
        for (key, env) in expired {
            warn!(queue, message_id = %env.id, "Message TTL exceeded, dead-lettering");
            self.publish(&key, &env.payload);
        }

        Ok(taken)
    }

    fn settle(&self, queue: &str, dead_letter: bool, envelope: &Envelope) -> Result<()> {
        let dl_key = {
            let mut inner = self.inner.lock().expect("exchange lock poisoned");
            let state = inner
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            state.unacked = state.unacked.saturating_sub(1);
            if dead_letter {
                state.opts.dead_letter_routing_key.clone()
            } else {
                None
            }
        };

        if dead_letter {
            match dl_key {
                Some(key) => {
                    warn!(queue, message_id = %envelope.id, "Rejected message dead-lettered");
                    self.publish(&key, &envelope.payload);
                }
                None => {
                    warn!(queue, message_id = %envelope.id, "Rejected message discarded");
                }
            }
        }

        Ok(())
    }
}

/// A prefetch-1 consumer of one queue
///
/// `next` hands out one delivery at a time; the caller must settle it
/// with [`Consumer::ack`] or [`Consumer::nack`] before asking for the
/// next one.
pub struct Consumer {
    exchange: Arc<TopicExchange>,
    queue: String,
}

impl Consumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery
    pub async fn next(&mut self) -> Result<Delivery> {
        loop {
            if let Some(envelope) = self.exchange.take_ready(&self.queue)? {
                return Ok(Delivery {
                    envelope,
                    queue: self.queue.clone(),
                });
            }
            // Re-check on wakeup or after the poll interval; a wakeup
            // racing the lock release only costs one interval.
            let _ = tokio::time::timeout(CONSUMER_POLL, self.exchange.notify.notified()).await;
        }
    }

    /// Non-blocking variant of [`Consumer::next`]
    pub fn try_next(&mut self) -> Result<Option<Delivery>> {
        Ok(self.exchange.take_ready(&self.queue)?.map(|envelope| Delivery {
            envelope,
            queue: self.queue.clone(),
        }))
    }

    /// Acknowledge: the message is removed permanently
    pub fn ack(&self, delivery: Delivery) -> Result<()> {
        self.exchange.settle(&delivery.queue, false, &delivery.envelope)
    }

    /// Negatively acknowledge without requeue: dead-letter or discard
    pub fn nack(&self, delivery: Delivery) -> Result<()> {
        self.exchange.settle(&delivery.queue, true, &delivery.envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> Arc<TopicExchange> {
        Arc::new(TopicExchange::new("test"))
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_queues_only() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        ex.declare_queue("transform", "*.odp.transform_data", QueueOptions::default())
            .unwrap();

        assert_eq!(ex.publish("gtfs.odp.save_data", b"{}"), 1);
        assert_eq!(ex.depth("save").unwrap().ready, 1);
        assert_eq!(ex.depth("transform").unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        assert_eq!(ex.publish("gtfs.odp.nowhere", b"{}"), 0);
    }

    #[tokio::test]
    async fn test_ack_removes_permanently() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        ex.publish("gtfs.odp.save_data", b"{}");

        let mut consumer = ex.consumer("save").unwrap();
        let delivery = consumer.next().await.unwrap();
        assert_eq!(ex.depth("save").unwrap(), QueueDepth { ready: 0, unacked: 1 });

        consumer.ack(delivery).unwrap();
        assert!(ex.depth("save").unwrap().is_drained());
    }

    #[tokio::test]
    async fn test_nack_goes_to_dead_letter_queue() {
        let ex = exchange();
        ex.declare_queue(
            "save",
            "*.odp.save_data",
            QueueOptions {
                dead_letter_routing_key: Some("dead.odp.save_data".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        ex.declare_queue("dead_letter", "dead.odp.#", QueueOptions::default())
            .unwrap();

        ex.publish("gtfs.odp.save_data", b"{\"n\":1}");
        let mut consumer = ex.consumer("save").unwrap();
        let delivery = consumer.next().await.unwrap();
        consumer.nack(delivery).unwrap();

        assert!(ex.depth("save").unwrap().is_drained());
        assert_eq!(ex.depth("dead_letter").unwrap().ready, 1);

        let mut dead = ex.consumer("dead_letter").unwrap();
        let delivery = dead.next().await.unwrap();
        assert_eq!(delivery.envelope.payload, b"{\"n\":1}");
        dead.ack(delivery).unwrap();
    }

    #[tokio::test]
    async fn test_nack_without_dead_letter_discards() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        ex.publish("gtfs.odp.save_data", b"{}");

        let mut consumer = ex.consumer("save").unwrap();
        let delivery = consumer.next().await.unwrap();
        consumer.nack(delivery).unwrap();
        assert!(ex.depth("save").unwrap().is_drained());
    }

    #[tokio::test]
    async fn test_expired_message_is_dead_lettered_at_delivery() {
        let ex = exchange();
        ex.declare_queue(
            "save",
            "*.odp.save_data",
            QueueOptions {
                message_ttl: Some(Duration::from_millis(0)),
                dead_letter_routing_key: Some("dead.odp.save_data".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        ex.declare_queue("dead_letter", "dead.odp.#", QueueOptions::default())
            .unwrap();

        ex.publish("gtfs.odp.save_data", b"{}");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut consumer = ex.consumer("save").unwrap();
        assert!(consumer.try_next().unwrap().is_none());
        assert_eq!(ex.depth("dead_letter").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_fifo_within_single_consumer() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        for n in 0..5u8 {
            ex.publish("gtfs.odp.save_data", &[n]);
        }

        let mut consumer = ex.consumer("save").unwrap();
        for n in 0..5u8 {
            let delivery = consumer.next().await.unwrap();
            assert_eq!(delivery.envelope.payload, vec![n]);
            consumer.ack(delivery).unwrap();
        }
    }

    #[tokio::test]
    async fn test_redeclare_same_binding_is_noop() {
        let ex = exchange();
        ex.declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .unwrap();
        assert!(ex
            .declare_queue("save", "*.odp.save_data", QueueOptions::default())
            .is_ok());
        assert!(matches!(
            ex.declare_queue("save", "*.odp.other", QueueOptions::default()),
            Err(BrokerError::BindingConflict(_))
        ));
    }
}
