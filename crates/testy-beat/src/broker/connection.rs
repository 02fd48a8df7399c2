use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use testy_core::{Result, TestyError};

use super::{BrokerInner, ExchangeKind, QueueOptions};
use crate::channel::{Consumer, MessageChannel};
use crate::message::OutboundMessage;

pub(crate) struct ConnectionInner {
    id: u64,
    broker: Arc<BrokerInner>,
    open: AtomicBool,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
}

impl ConnectionInner {
    pub(crate) fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<_> = self.channels.lock().unwrap().drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close();
        }
        tracing::debug!(connection_id = self.id, "Connection closed");
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection to the embedded broker.
///
/// Closing the connection closes every channel created from it. Channels
/// hold on to their connection, so it closes on its own only once the last
/// connection handle and the last of its channels are gone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn open(broker: Arc<BrokerInner>) -> Self {
        let id = broker.next_id();
        tracing::debug!(connection_id = id, "Connection opened");
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                broker,
                open: AtomicBool::new(true),
                channels: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Virtual host this connection is attached to.
    pub fn virtual_host(&self) -> &str {
        self.inner.broker.virtual_host()
    }

    /// Check if the connection is open.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Open a new channel.
    pub fn create_channel(&self) -> Result<Channel> {
        if !self.is_open() {
            return Err(TestyError::ChannelClosed(format!(
                "Connection {} is closed",
                self.inner.id
            )));
        }

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id: self.inner.broker.next_id(),
                broker: self.inner.broker.clone(),
                connection: self.inner.clone(),
                open: AtomicBool::new(true),
            }),
        };
        self.inner
            .channels
            .lock()
            .unwrap()
            .push(Arc::downgrade(&channel.inner));
        Ok(channel)
    }

    /// Close the connection and its channels. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

struct ChannelInner {
    id: u64,
    broker: Arc<BrokerInner>,
    // Keeps the connection alive for as long as any of its channels is.
    connection: Arc<ConnectionInner>,
    open: AtomicBool,
}

impl ChannelInner {
    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.release_channel(self.id);
            tracing::debug!(channel_id = self.id, "Channel closed");
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A channel on an embedded broker connection.
///
/// Cheap to clone; clones share the same channel. Closing it cancels every
/// consumer registered through it and deletes the exclusive queues it
/// declared.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Channel identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Check if the connection this channel belongs to is open.
    pub fn connection_is_open(&self) -> bool {
        self.inner.connection.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TestyError::ChannelClosed(format!(
                "Channel {} is closed",
                self.inner.id
            )))
        }
    }

    /// Declare an exchange.
    pub fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        self.inner.broker.exchange_declare(name, kind)
    }

    /// Declare a queue; redeclaring an existing queue is a no-op.
    pub fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        self.inner.broker.queue_declare(self.inner.id, name, options)?;
        Ok(name.to_string())
    }

    /// Declare an exclusive, auto-delete queue with a generated name.
    pub fn queue_declare_server_named(&self) -> Result<String> {
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        self.queue_declare(&name, QueueOptions::exclusive())
    }

    /// Bind a queue to an exchange.
    pub fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.broker.queue_bind(queue, exchange, routing_key)
    }

    /// Messages waiting in a queue.
    pub fn queue_message_count(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;
        self.inner.broker.queue_message_count(queue)
    }

    /// Consumers attached to a queue.
    pub fn queue_consumer_count(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;
        self.inner.broker.queue_consumer_count(queue)
    }
}

impl MessageChannel for Channel {
    fn basic_consume(&self, queue: &str) -> Result<Consumer> {
        self.ensure_open()?;
        self.inner.broker.basic_consume(self.inner.id, queue)
    }

    fn basic_cancel(&self, consumer_tag: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.inner.broker.basic_cancel(consumer_tag))
    }

    fn basic_publish(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        self.inner.broker.basic_publish(message)
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}
