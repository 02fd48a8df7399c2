//! Request/reply client for driving mocked responders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use testy_core::{Result, TestyError};

use crate::broker::Channel;
use crate::channel::{Consumer, MessageChannel};
use crate::message::{Delivery, HeaderValue, Headers, OutboundMessage, Properties};

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Delivery>>>>;

/// An RPC request body plus optional headers.
#[derive(Debug, Clone, Default)]
pub struct RpcRequest {
    body: Vec<u8>,
    headers: Headers,
}

impl RpcRequest {
    /// Create a request with the given body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Publishes requests with a fresh correlation id and waits for the
/// matching reply on a private reply queue.
///
/// # Example
///
/// ```ignore
/// let client = RpcClient::new(&channel, "test-exchange", "")?;
/// let reply = client.rpc_within(RpcRequest::new(body), Duration::from_millis(500)).await?;
/// ```
pub struct RpcClient {
    channel: Channel,
    exchange: String,
    routing_key: String,
    reply_queue: String,
    consumer_tag: String,
    pending: PendingReplies,
    dispatcher: JoinHandle<()>,
}

impl RpcClient {
    /// Declare a reply queue on `channel` and start listening for replies.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        channel: &Channel,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TestyError::InvalidState("RPC clients must be created inside a Tokio runtime".into())
        })?;

        let reply_queue = channel.queue_declare_server_named()?;
        let consumer = channel.basic_consume(&reply_queue)?;
        let consumer_tag = consumer.tag().to_string();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = runtime.spawn(dispatch_replies(consumer, pending.clone()));

        Ok(Self {
            channel: channel.clone(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            reply_queue,
            consumer_tag,
            pending,
            dispatcher,
        })
    }

    /// Private queue replies arrive on.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Send a request and wait for its reply.
    ///
    /// There is no built-in wait bound; see [`rpc_within`](Self::rpc_within).
    pub async fn rpc(&self, request: RpcRequest) -> Result<Delivery> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), tx);
        // Removes the entry however the wait ends, including cancellation.
        let _registration = PendingRegistration {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        let properties = Properties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(self.reply_queue.clone()),
            headers: request.headers,
            ..Default::default()
        };
        let message = OutboundMessage::new(&self.exchange, &self.routing_key, request.body)
            .with_properties(properties);
        self.channel.basic_publish(message)?;

        tracing::debug!(
            exchange = %self.exchange,
            correlation_id = %correlation_id,
            "RPC request sent"
        );

        rx.await.map_err(|_| {
            TestyError::ChannelClosed(format!(
                "Reply queue '{}' closed before a reply to {} arrived",
                self.reply_queue, correlation_id
            ))
        })
    }

    /// Send a request and wait at most `timeout` for its reply.
    pub async fn rpc_within(&self, request: RpcRequest, timeout: Duration) -> Result<Delivery> {
        match tokio::time::timeout(timeout, self.rpc(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(TestyError::timeout(
                timeout,
                format!("no reply on '{}'", self.reply_queue),
            )),
        }
    }

    /// Stop listening for replies; waiting requests fail with `ChannelClosed`.
    pub fn close(&self) {
        if let Err(e) = self.channel.basic_cancel(&self.consumer_tag) {
            tracing::debug!(
                consumer_tag = %self.consumer_tag,
                "Reply consumer cancel skipped: {}",
                e
            );
        }
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
        self.dispatcher.abort();
    }
}

struct PendingRegistration<'a> {
    pending: &'a PendingReplies,
    correlation_id: &'a str,
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(self.correlation_id);
    }
}

async fn dispatch_replies(mut consumer: Consumer, pending: PendingReplies) {
    while let Some(reply) = consumer.recv().await {
        let waiter = reply
            .properties
            .correlation_id
            .as_ref()
            .and_then(|id| pending.lock().unwrap().remove(id));

        match waiter {
            Some(waiter) => {
                if waiter.send(reply).is_err() {
                    tracing::debug!("Reply arrived after its request stopped waiting");
                }
            }
            None => tracing::warn!(
                correlation_id = ?reply.properties.correlation_id,
                "Dropping reply with no pending request"
            ),
        }
    }

    pending.lock().unwrap().clear();
}
