//! Handler registration and the consume loop
//!
//! `Dispatcher::register_queue` declares a durable queue bound as
//! `*.<prefix>.<name>` and attaches a handler. `start` runs one consume
//! loop per configured consumer; every delivery is wrapped with the
//! default settlement policy: acknowledge on handler success, negatively
//! acknowledge (dead-letter, never requeue) on handler failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::exchange::{Envelope, QueueOptions, TopicExchange};
use crate::Result;

impl Envelope {
    /// Decode the JSON body into a typed message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A unit of work bound to one queue
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    /// Process one delivery
    ///
    /// Returning `Ok` acknowledges the message; returning `Err` rejects
    /// it to the queue's dead-letter target. Handlers must be safe to
    /// run against duplicate deliveries.
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Publishing half of the dispatch framework
///
/// Routing keys follow `<dataset>.<prefix>.<queue>`; dead letters go to
/// `dead.<prefix>.<queue>`.
#[derive(Clone)]
pub struct Publisher {
    exchange: Arc<TopicExchange>,
    prefix: String,
}

impl Publisher {
    pub fn new(exchange: Arc<TopicExchange>, prefix: impl Into<String>) -> Self {
        Self {
            exchange,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn routing_key(&self, dataset: &str, queue: &str) -> String {
        format!("{}.{}.{}", dataset, self.prefix, queue)
    }

    pub fn dead_letter_key(&self, queue: &str) -> String {
        format!("dead.{}.{}", self.prefix, queue)
    }

    /// Serialize a message and publish it for a dataset's stage queue
    pub fn publish<T: Serialize>(&self, dataset: &str, queue: &str, message: &T) -> Result<usize> {
        let payload = serde_json::to_vec(message)?;
        Ok(self
            .exchange
            .publish(&self.routing_key(dataset, queue), &payload))
    }

    /// Publish after a delay, used by the self-requeuing completion poll
    pub fn publish_after<T: Serialize>(
        &self,
        delay: Duration,
        dataset: &str,
        queue: &str,
        message: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let routing_key = self.routing_key(dataset, queue);
        let exchange = Arc::clone(&self.exchange);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            exchange.publish(&routing_key, &payload);
        });
        Ok(())
    }
}

struct Registration {
    queue: String,
    handler: Arc<dyn QueueHandler>,
    consumers: usize,
}

/// Binds named work queues to the topic exchange and runs their consumers
pub struct Dispatcher {
    exchange: Arc<TopicExchange>,
    prefix: String,
    registrations: Vec<Registration>,
}

impl Dispatcher {
    pub fn new(exchange: Arc<TopicExchange>, prefix: impl Into<String>) -> Self {
        Self {
            exchange,
            prefix: prefix.into(),
            registrations: Vec::new(),
        }
    }

    pub fn exchange(&self) -> &Arc<TopicExchange> {
        &self.exchange
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.exchange), self.prefix.clone())
    }

    /// Declare `<name>` bound as `*.<prefix>.<name>` and attach a handler
    pub fn register_queue(
        &mut self,
        name: &str,
        handler: Arc<dyn QueueHandler>,
        options: QueueOptions,
    ) -> Result<()> {
        let binding_key = format!("*.{}.{}", self.prefix, name);
        self.register_queue_with_binding(name, &binding_key, handler, options)
    }

    /// Declare a queue with an explicit binding key
    ///
    /// Used for queues outside the stage naming scheme, such as the
    /// dead-letter sink bound to `dead.<prefix>.#`.
    pub fn register_queue_with_binding(
        &mut self,
        name: &str,
        binding_key: &str,
        handler: Arc<dyn QueueHandler>,
        options: QueueOptions,
    ) -> Result<()> {
        let consumers = options.consumers.max(1);
        self.exchange.declare_queue(name, binding_key, options)?;
        self.registrations.push(Registration {
            queue: name.to_string(),
            handler,
            consumers,
        });
        Ok(())
    }

    /// Start every registered consumer
    ///
    /// Consume loops run until their task is aborted; the caller owns the
    /// returned handles.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for registration in &self.registrations {
            for instance in 0..registration.consumers {
                let mut consumer = self.exchange.consumer(&registration.queue)?;
                let handler = Arc::clone(&registration.handler);
                let queue = registration.queue.clone();

                handles.push(tokio::spawn(async move {
                    info!(queue, instance, "Consumer started");
                    loop {
                        let delivery = match consumer.next().await {
                            Ok(delivery) => delivery,
                            Err(e) => {
                                error!(queue, error = %e, "Consumer stopped");
                                break;
                            }
                        };

                        let message_id = delivery.envelope.id;
                        let settled = match handler.handle(&delivery.envelope).await {
                            Ok(()) => consumer.ack(delivery),
                            Err(e) => {
                                warn!(
                                    queue,
                                    %message_id,
                                    error = %e,
                                    "Handler failed, rejecting message"
                                );
                                consumer.nack(delivery)
                            }
                        };

                        if let Err(e) = settled {
                            error!(queue, %message_id, error = %e, "Failed to settle delivery");
                        }
                    }
                }));
            }
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl QueueHandler for Counting {
        async fn handle(&self, _envelope: &Envelope) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated handler failure");
            }
            Ok(())
        }
    }

    async fn drained(exchange: &TopicExchange, queue: &str) {
        for _ in 0..200 {
            if exchange.depth(queue).unwrap().is_drained() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue {queue} did not drain");
    }

    #[tokio::test]
    async fn test_successful_handler_acks() {
        let exchange = Arc::new(TopicExchange::new("test"));
        let mut dispatcher = Dispatcher::new(Arc::clone(&exchange), "odp");
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        dispatcher
            .register_queue("save_data", handler.clone(), QueueOptions::default())
            .unwrap();

        let handles = dispatcher.start().unwrap();
        let publisher = dispatcher.publisher();
        for _ in 0..3 {
            publisher.publish("gtfs", "save_data", &serde_json::json!({})).unwrap();
        }

        drained(&exchange, "save_data").await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters() {
        let exchange = Arc::new(TopicExchange::new("test"));
        let mut dispatcher = Dispatcher::new(Arc::clone(&exchange), "odp");
        let publisher = dispatcher.publisher();

        let failing = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: true,
        });
        dispatcher
            .register_queue(
                "save_data",
                failing.clone(),
                QueueOptions {
                    dead_letter_routing_key: Some(publisher.dead_letter_key("save_data")),
                    ..Default::default()
                },
            )
            .unwrap();

        let sink = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        let dead_binding = format!("dead.{}.#", publisher.prefix());
        dispatcher
            .register_queue_with_binding(
                "dead_letter",
                &dead_binding,
                sink.clone(),
                QueueOptions::default(),
            )
            .unwrap();

        let handles = dispatcher.start().unwrap();
        publisher.publish("gtfs", "save_data", &serde_json::json!({"n": 1})).unwrap();

        drained(&exchange, "save_data").await;
        drained(&exchange, "dead_letter").await;
        assert_eq!(failing.seen.load(Ordering::SeqCst), 1);
        assert_eq!(sink.seen.load(Ordering::SeqCst), 1);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_publish_after_delays_delivery() {
        let exchange = Arc::new(TopicExchange::new("test"));
        exchange
            .declare_queue("check_done", "*.odp.check_done", QueueOptions::default())
            .unwrap();
        let publisher = Publisher::new(Arc::clone(&exchange), "odp");

        publisher
            .publish_after(
                Duration::from_millis(30),
                "gtfs",
                "check_done",
                &serde_json::json!({"attempt": 1}),
            )
            .unwrap();

        assert_eq!(exchange.depth("check_done").unwrap().ready, 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(exchange.depth("check_done").unwrap().ready, 1);
    }
}
