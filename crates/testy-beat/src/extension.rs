//! Rabbit fixture.
//!
//! `WithRabbitMock` owns the broker lifecycle. `setup()` starts a broker and
//! opens a connection once for a group of tests; `RabbitContext::open_scope()`
//! gives each test its own channel with the configured queues and exchanges
//! already declared.

use std::collections::HashMap;
use std::time::Duration;

use testy_core::{Fixture, JsonMapper, Result, TestyConfig, TestyError, WithJsonMapper};

use crate::broker::{Channel, Connection, EmbeddedBroker, ExchangeKind, QueueOptions};
use crate::receivers::{MockedReceiverFactory, QueueReceiver};
use crate::rpc::RpcClient;

/// A queue bound to a direct exchange with the empty routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueBinding {
    queue: String,
    exchange: String,
}

/// Fixture starting an embedded broker for a group of tests.
///
/// # Example
///
/// ```ignore
/// let fixture = WithRabbitMock::builder()
///     .with_json_mapper(WithJsonMapper::builder().build())
///     .declare_queue_and_exchange("test-queue", "test-exchange")
///     .build();
///
/// let context = fixture.setup()?;
/// let scope = context.open_scope()?;
/// let receiver = scope.receiver_factory().consume_one().on("test-queue")?.start()?;
/// scope.channel().emit("test-exchange", "", b"hello".to_vec())?;
/// scope.close();
/// fixture.teardown(context)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct WithRabbitMock {
    config: TestyConfig,
    bindings: Vec<QueueBinding>,
    json: Option<WithJsonMapper>,
}

impl WithRabbitMock {
    /// Create a builder.
    pub fn builder() -> WithRabbitMockBuilder {
        WithRabbitMockBuilder::default()
    }
}

impl Fixture for WithRabbitMock {
    type Handle = RabbitContext;

    fn setup(&self) -> Result<RabbitContext> {
        let broker = EmbeddedBroker::with_config(self.config.broker.clone());
        broker.start();
        let connection = broker.new_connection()?;

        let json = match &self.json {
            Some(fixture) => fixture.setup()?,
            None => JsonMapper::default(),
        };

        Ok(RabbitContext {
            broker,
            connection,
            json,
            bindings: self.bindings.clone(),
            default_timeout: self.config.receiver.default_timeout(),
        })
    }

    fn teardown(&self, context: RabbitContext) -> Result<()> {
        context.connection.close();
        context.broker.stop();
        Ok(())
    }
}

/// Builder for WithRabbitMock.
#[derive(Debug, Default)]
pub struct WithRabbitMockBuilder {
    config: Option<TestyConfig>,
    bindings: Vec<QueueBinding>,
    json: Option<WithJsonMapper>,
}

impl WithRabbitMockBuilder {
    /// Use `config` for the broker and receivers instead of the defaults.
    pub fn with_config(mut self, config: TestyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Declare `queue` and a direct `exchange` in every scope, bound with
    /// the empty routing key.
    pub fn declare_queue_and_exchange(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        let binding = QueueBinding {
            queue: queue.into(),
            exchange: exchange.into(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Hand out the mapper produced by `fixture` from every scope.
    pub fn with_json_mapper(mut self, fixture: WithJsonMapper) -> Self {
        self.json = Some(fixture);
        self
    }

    /// Build the fixture.
    pub fn build(self) -> WithRabbitMock {
        WithRabbitMock {
            config: self.config.unwrap_or_default(),
            bindings: self.bindings,
            json: self.json,
        }
    }
}

/// A running broker and its connection, shared by a group of tests.
pub struct RabbitContext {
    broker: EmbeddedBroker,
    connection: Connection,
    json: JsonMapper,
    bindings: Vec<QueueBinding>,
    default_timeout: Duration,
}

impl RabbitContext {
    /// The running broker.
    pub fn broker(&self) -> &EmbeddedBroker {
        &self.broker
    }

    /// The shared connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Open a channel for one test and declare the configured topology on it.
    pub fn open_scope(&self) -> Result<RabbitScope> {
        let channel = self.connection.create_channel()?;

        let factory =
            MockedReceiverFactory::new(channel.clone()).with_default_timeout(self.default_timeout);

        let mut receivers = HashMap::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            declare_binding(&channel, binding)?;
            let receiver = QueueReceiver::new(
                factory.clone(),
                &binding.queue,
                &binding.exchange,
                self.json.clone(),
            );
            receivers.insert(binding.queue.clone(), receiver);
        }

        let reply_queue = channel.queue_declare_server_named().map_err(|e| {
            TestyError::InvalidState(format!("Error when declaring reply queue: {}", e))
        })?;

        Ok(RabbitScope {
            connection: self.connection.clone(),
            channel,
            json: self.json.clone(),
            factory,
            receivers,
            reply_queue,
        })
    }
}

impl Drop for RabbitContext {
    fn drop(&mut self) {
        self.broker.stop();
    }
}

fn declare_binding(channel: &Channel, binding: &QueueBinding) -> Result<()> {
    channel
        .queue_declare(&binding.queue, QueueOptions::default())
        .map_err(|e| {
            TestyError::InvalidState(format!(
                "Error when declaring queue {}: {}",
                binding.queue, e
            ))
        })?;
    channel
        .exchange_declare(&binding.exchange, ExchangeKind::Direct)
        .map_err(|e| {
            TestyError::InvalidState(format!(
                "Error when declaring exchange {}: {}",
                binding.exchange, e
            ))
        })?;
    channel
        .queue_bind(&binding.queue, &binding.exchange, "")
        .map_err(|e| {
            TestyError::InvalidState(format!(
                "Error when binding queue {} to {}: {}",
                binding.queue, binding.exchange, e
            ))
        })?;

    tracing::debug!(
        queue = %binding.queue,
        exchange = %binding.exchange,
        "Declared queue and exchange"
    );
    Ok(())
}

/// Per-test handles: a dedicated channel plus everything built on it.
///
/// Dropping the scope closes its channel, which stops every receiver
/// started from it.
pub struct RabbitScope {
    connection: Connection,
    channel: Channel,
    json: JsonMapper,
    factory: MockedReceiverFactory,
    receivers: HashMap<String, QueueReceiver>,
    reply_queue: String,
}

impl RabbitScope {
    /// The test's channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The shared connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The configured JSON mapper.
    pub fn json(&self) -> &JsonMapper {
        &self.json
    }

    /// Ready-made receiver for a queue declared on the fixture.
    pub fn receiver(&self, queue: &str) -> Result<&QueueReceiver> {
        self.receivers.get(queue).ok_or_else(|| {
            TestyError::NotFound(format!("No queue '{}' declared on this fixture", queue))
        })
    }

    /// Exclusive queue declared for replies; deleted with the channel.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Receiver factory consuming through this scope's channel.
    pub fn receiver_factory(&self) -> MockedReceiverFactory {
        self.factory.clone()
    }

    /// RPC client publishing to `exchange` with `routing_key`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn rpc_client(&self, exchange: &str, routing_key: &str) -> Result<RpcClient> {
        RpcClient::new(&self.channel, exchange, routing_key)
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.channel.close();
    }
}

impl Drop for RabbitScope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testy_core::{assert_err_variant, with_fixture};

    use crate::channel::MessageChannel;
    use crate::receivers::ReceiverState;

    const QUEUE: &str = "test-queue";
    const EXCHANGE: &str = "test-exchange";

    fn rabbit() -> WithRabbitMock {
        WithRabbitMock::builder()
            .declare_queue_and_exchange(QUEUE, EXCHANGE)
            .build()
    }

    #[test]
    fn test_scope_declares_queue_and_exchange() {
        let queued = with_fixture(&rabbit(), |context| {
            let scope = context.open_scope()?;
            scope.channel().emit(EXCHANGE, "", b"one".to_vec())?;
            scope.channel().emit("", QUEUE, b"two".to_vec())?;
            let queued = scope.channel().queue_message_count(QUEUE)?;
            Ok(queued)
        })
        .unwrap();

        assert_eq!(queued, 2);
    }

    #[test]
    fn test_scope_reply_queue_lives_with_channel() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();
        let observer = context.connection().create_channel().unwrap();
        let reply_queue = scope.reply_queue().to_string();

        assert!(reply_queue.starts_with("amq.gen-"));
        assert_eq!(observer.queue_message_count(&reply_queue).unwrap(), 0);

        drop(scope);
        assert_err_variant!(
            observer.queue_message_count(&reply_queue),
            TestyError::NotFound(_)
        );
    }

    #[tokio::test]
    async fn test_scopes_get_their_own_channels() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let first = context.open_scope().unwrap();
        let second = context.open_scope().unwrap();

        assert_ne!(first.channel().id(), second.channel().id());

        first.close();
        assert!(!first.channel().is_open());
        assert!(second.channel().is_open());
        assert!(second.connection().is_open());
    }

    #[tokio::test]
    async fn test_closing_scope_stops_its_receivers() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();

        let receiver = scope
            .receiver_factory()
            .consume(3)
            .unwrap()
            .on(QUEUE)
            .unwrap()
            .start()
            .unwrap();
        assert!(receiver.is_active());

        scope.close();
        tokio::time::timeout(Duration::from_millis(500), async {
            while receiver.is_active() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(receiver.state(), ReceiverState::Stopped(_)));
    }

    #[tokio::test]
    async fn test_teardown_stops_broker() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let broker = context.broker().clone();
        let connection = context.connection().clone();
        assert!(broker.is_running());

        fixture.teardown(context).unwrap();

        assert!(!broker.is_running());
        assert!(!connection.is_open());
        assert_err_variant!(broker.new_connection(), TestyError::InvalidState(_));
    }

    #[tokio::test]
    async fn test_json_mapper_defaults_and_override() {
        let plain = rabbit().setup().unwrap();
        assert!(!plain.open_scope().unwrap().json().is_pretty());

        let pretty = WithRabbitMock::builder()
            .with_json_mapper(WithJsonMapper::builder().pretty(true).build())
            .build()
            .setup()
            .unwrap();
        assert!(pretty.open_scope().unwrap().json().is_pretty());
    }

    #[tokio::test]
    async fn test_conflicting_exchange_is_reported() {
        let fixture = WithRabbitMock::builder()
            .declare_queue_and_exchange(QUEUE, EXCHANGE)
            .build();
        let context = fixture.setup().unwrap();
        let channel = context.connection().create_channel().unwrap();
        channel
            .exchange_declare("clash", ExchangeKind::Fanout)
            .unwrap();

        let clashing = WithRabbitMock::builder()
            .declare_queue_and_exchange(QUEUE, "clash")
            .build();
        let result = declare_binding(&channel, &clashing.bindings[0]);

        assert_err_variant!(
            result,
            TestyError::InvalidState(_),
            "Error when declaring exchange clash"
        );
    }

    #[test]
    fn test_builder_deduplicates_bindings() {
        let fixture = WithRabbitMock::builder()
            .declare_queue_and_exchange(QUEUE, EXCHANGE)
            .declare_queue_and_exchange(QUEUE, EXCHANGE)
            .declare_queue_and_exchange("other", EXCHANGE)
            .build();

        assert_eq!(fixture.bindings.len(), 2);
    }

    #[test]
    fn test_builder_uses_config() {
        let mut config = TestyConfig::default();
        config.broker.virtual_host = "/tests".to_string();
        config.receiver.default_timeout_ms = 50;

        let context = WithRabbitMock::builder()
            .with_config(config)
            .build()
            .setup()
            .unwrap();

        assert_eq!(context.connection().virtual_host(), "/tests");
        assert_eq!(context.default_timeout, Duration::from_millis(50));
    }
}
