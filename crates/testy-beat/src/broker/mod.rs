//! In-process AMQP-style broker.
//!
//! Supports the subset tests lean on: a default exchange routing by queue
//! name, direct and fanout exchanges, exclusive/auto-delete queues and
//! round-robin consumers. Everything lives in memory and disappears when
//! the broker stops.

mod connection;
mod exchange;
mod queue;

pub use connection::{Channel, Connection};
pub use exchange::ExchangeKind;
pub use queue::QueueOptions;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use testy_core::{BrokerConfig, Result, TestyError};

use crate::channel::Consumer;
use crate::message::{Delivery, OutboundMessage};
use connection::ConnectionInner;
use exchange::Exchange;
use queue::{ConsumerSlot, EnqueueError, Queue};

/// Name of the default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// In-process broker handle.
///
/// # Example
///
/// ```ignore
/// let broker = EmbeddedBroker::new();
/// broker.start();
/// let connection = broker.new_connection()?;
/// let channel = connection.create_channel()?;
/// channel.queue_declare("orders", QueueOptions::default())?;
/// channel.basic_publish(OutboundMessage::new("", "orders", "hello"))?;
/// broker.stop();
/// ```
#[derive(Clone)]
pub struct EmbeddedBroker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    config: BrokerConfig,
    running: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl EmbeddedBroker {
    /// Create a stopped broker with default configuration.
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a stopped broker.
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                state: Mutex::new(BrokerState::default()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start accepting connections. Starting a running broker is a no-op.
    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!(
                virtual_host = %self.inner.config.virtual_host,
                "Embedded broker started"
            );
        }
    }

    /// Close every connection and drop all exchanges and queues.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<_> = self.inner.connections.lock().unwrap().drain(..).collect();
        for connection in connections.iter().filter_map(Weak::upgrade) {
            connection.close();
        }

        let mut state = self.inner.state.lock().unwrap();
        state.exchanges.clear();
        state.queues.clear();

        tracing::info!("Embedded broker stopped");
    }

    /// Check if the broker is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Open a new connection.
    pub fn new_connection(&self) -> Result<Connection> {
        if !self.is_running() {
            return Err(TestyError::InvalidState(
                "Embedded broker is not running".to_string(),
            ));
        }

        let connection = Connection::open(self.inner.clone());
        self.inner
            .connections
            .lock()
            .unwrap()
            .push(connection.downgrade());
        Ok(connection)
    }
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn virtual_host(&self) -> &str {
        &self.config.virtual_host
    }

    pub(crate) fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name.is_empty() {
            return Err(TestyError::InvalidArgument(
                "The default exchange cannot be redeclared".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind() != kind => Err(TestyError::InvalidState(format!(
                "Exchange '{}' already declared as {}",
                name,
                existing.kind().as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), Exchange::new(kind));
                tracing::debug!(exchange = %name, kind = kind.as_str(), "Exchange declared");
                Ok(())
            }
        }
    }

    pub(crate) fn queue_declare(
        &self,
        channel_id: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(TestyError::InvalidArgument(
                "Queue name must not be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.queues.get(name) {
            return match existing.owner() {
                Some(owner) if owner != channel_id => Err(TestyError::InvalidState(format!(
                    "Queue '{}' is exclusive to another channel",
                    name
                ))),
                _ => Ok(()),
            };
        }

        let owner = options.exclusive.then_some(channel_id);
        state
            .queues
            .insert(name.to_string(), Queue::new(options, owner));
        tracing::debug!(queue = %name, ?options, "Queue declared");
        Ok(())
    }

    pub(crate) fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(TestyError::NotFound(format!("Queue '{}'", queue)));
        }
        let exchange_entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TestyError::NotFound(format!("Exchange '{}'", exchange)))?;
        exchange_entry.bind(queue, routing_key);
        Ok(())
    }

    pub(crate) fn queue_message_count(&self, queue: &str) -> Result<usize> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(Queue::message_count)
            .ok_or_else(|| TestyError::NotFound(format!("Queue '{}'", queue)))
    }

    pub(crate) fn queue_consumer_count(&self, queue: &str) -> Result<usize> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(Queue::consumer_count)
            .ok_or_else(|| TestyError::NotFound(format!("Queue '{}'", queue)))
    }

    pub(crate) fn basic_consume(&self, channel_id: u64, queue: &str) -> Result<Consumer> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TestyError::NotFound(format!("Queue '{}'", queue)))?;

        let tag = format!("amq.ctag-{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        entry.add_consumer(ConsumerSlot {
            tag: tag.clone(),
            channel_id,
            tx,
        });

        tracing::debug!(queue = %queue, consumer_tag = %tag, "Consumer registered");
        Ok(Consumer::new(tag, queue, rx))
    }

    pub(crate) fn basic_cancel(&self, consumer_tag: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(queue_name) = state
            .queues
            .iter_mut()
            .find_map(|(name, queue)| queue.remove_consumer(consumer_tag).then(|| name.clone()))
        else {
            return false;
        };

        tracing::debug!(queue = %queue_name, consumer_tag = %consumer_tag, "Consumer cancelled");
        state.delete_if_unused(&queue_name);
        true
    }

    pub(crate) fn basic_publish(&self, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let targets = if message.exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(&message.exchange)
                .ok_or_else(|| TestyError::NotFound(format!("Exchange '{}'", message.exchange)))?
                .route(&message.routing_key)
        };

        if targets.is_empty() {
            tracing::debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Dropping unroutable message"
            );
            return Ok(());
        }

        let capacity = self.config.queue_capacity;
        for target in targets {
            let Some(queue) = state.queues.get_mut(&target) else {
                continue;
            };
            let delivery = Delivery {
                delivery_tag: self.next_id(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            queue.enqueue(delivery, capacity).map_err(|e| match e {
                EnqueueError::Full(limit) => TestyError::Broker(format!(
                    "Queue '{}' is full ({} messages)",
                    target, limit
                )),
            })?;
        }
        Ok(())
    }

    /// Cancel a closing channel's consumers and delete its exclusive queues.
    pub(crate) fn release_channel(&self, channel_id: u64) {
        let mut state = self.state.lock().unwrap();

        let mut touched = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if queue.remove_channel_consumers(channel_id) > 0 {
                touched.push(name.clone());
            }
        }
        for name in touched {
            state.delete_if_unused(&name);
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner() == Some(channel_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.delete_queue(&name);
        }
    }
}

impl BrokerState {
    /// Delete an auto-delete queue that has lost its last consumer.
    fn delete_if_unused(&mut self, name: &str) {
        let unused = self
            .queues
            .get(name)
            .is_some_and(|q| q.options().auto_delete && q.consumer_count() == 0);
        if unused {
            self.delete_queue(name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.unbind_queue(name);
            }
            tracing::debug!(queue = %name, "Queue deleted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testy_core::assert_err_variant;
    use crate::channel::MessageChannel;

    fn running_broker() -> EmbeddedBroker {
        let broker = EmbeddedBroker::new();
        broker.start();
        broker
    }

    #[test]
    fn test_connection_requires_running_broker() {
        let broker = EmbeddedBroker::new();
        assert_err_variant!(broker.new_connection(), TestyError::InvalidState(_));

        broker.start();
        assert!(broker.new_connection().is_ok());
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = running_broker();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();
        channel
            .queue_declare("orders", QueueOptions::default())
            .unwrap();

        channel
            .basic_publish(OutboundMessage::new("", "orders", "first"))
            .unwrap();
        assert_eq!(channel.queue_message_count("orders").unwrap(), 1);

        let mut consumer = channel.basic_consume("orders").unwrap();
        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.body, b"first".to_vec());
        assert_eq!(delivery.routing_key, "orders");
        assert_eq!(channel.queue_message_count("orders").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_direct_exchange_binding() {
        let broker = running_broker();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();
        channel
            .exchange_declare("test-exchange", ExchangeKind::Direct)
            .unwrap();
        channel
            .queue_declare("test-queue", QueueOptions::default())
            .unwrap();
        channel
            .queue_bind("test-queue", "test-exchange", "")
            .unwrap();

        let mut consumer = channel.basic_consume("test-queue").unwrap();
        channel
            .basic_publish(OutboundMessage::new("test-exchange", "", "hello"))
            .unwrap();
        channel
            .basic_publish(OutboundMessage::new("test-exchange", "other", "dropped"))
            .unwrap();

        assert_eq!(consumer.recv().await.unwrap().body, b"hello".to_vec());
        assert_eq!(channel.queue_message_count("test-queue").unwrap(), 0);
    }

    #[test]
    fn test_publish_to_unknown_exchange() {
        let broker = running_broker();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();

        let result = channel.basic_publish(OutboundMessage::new("missing", "", "x"));
        assert_err_variant!(result, TestyError::NotFound(_));
    }

    #[test]
    fn test_redeclare_exchange_with_other_kind() {
        let broker = running_broker();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();
        channel.exchange_declare("x", ExchangeKind::Direct).unwrap();
        channel.exchange_declare("x", ExchangeKind::Direct).unwrap();

        assert_err_variant!(
            channel.exchange_declare("x", ExchangeKind::Fanout),
            TestyError::InvalidState(_)
        );
    }

    #[test]
    fn test_queue_capacity() {
        let broker = EmbeddedBroker::with_config(BrokerConfig {
            queue_capacity: 2,
            ..Default::default()
        });
        broker.start();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();
        channel.queue_declare("q", QueueOptions::default()).unwrap();

        channel.emit("", "q", b"1".to_vec()).unwrap();
        channel.emit("", "q", b"2".to_vec()).unwrap();
        assert_err_variant!(channel.emit("", "q", b"3".to_vec()), TestyError::Broker(_));
    }

    #[tokio::test]
    async fn test_cancel_ends_consumer_stream() {
        let broker = running_broker();
        let channel = broker.new_connection().unwrap().create_channel().unwrap();
        channel.queue_declare("q", QueueOptions::default()).unwrap();

        let mut consumer = channel.basic_consume("q").unwrap();
        assert!(channel.basic_cancel(consumer.tag()).unwrap());
        assert!(!channel.basic_cancel(consumer.tag()).unwrap());
        assert!(consumer.recv().await.is_none());

        channel.emit("", "q", b"kept".to_vec()).unwrap();
        assert_eq!(channel.queue_message_count("q").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let broker = running_broker();
        let connection = broker.new_connection().unwrap();
        let channel = connection.create_channel().unwrap();
        channel.queue_declare("q", QueueOptions::default()).unwrap();
        let mut consumer = channel.basic_consume("q").unwrap();

        broker.stop();

        assert!(!broker.is_running());
        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert!(consumer.recv().await.is_none());
        assert_err_variant!(channel.emit("", "q", b"x".to_vec()), TestyError::ChannelClosed(_));
    }
}
