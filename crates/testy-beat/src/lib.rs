//! In-process messaging fixtures for tests.
//!
//! An embedded AMQP-style broker, mocked receivers that consume and answer
//! messages on a queue, an RPC client for request/reply round trips, and the
//! `WithRabbitMock` fixture tying their lifecycles together.

pub mod broker;
pub mod channel;
pub mod extension;
pub mod message;
pub mod receivers;
pub mod rpc;

pub use broker::{
    Channel, Connection, EmbeddedBroker, ExchangeKind, QueueOptions, DEFAULT_EXCHANGE,
};
pub use channel::{Consumer, MessageChannel};
pub use extension::{RabbitContext, RabbitScope, WithRabbitMock, WithRabbitMockBuilder};
pub use message::{Delivery, HeaderValue, Headers, OutboundMessage, Properties};
pub use receivers::{
    ConsumptionSpec, DeliveryFailure, ExpectedCount, MockedReceiver, MockedReceiverBuilder,
    MockedReceiverFactory, MockedResponse, MockedResponseBuilder, QueueReceiver, ReceivedMessage,
    ReceiverState, StopReason,
};
pub use rpc::{RpcClient, RpcRequest};
