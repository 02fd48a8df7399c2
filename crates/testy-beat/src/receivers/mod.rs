//! Mocked receivers: consume a fixed (or open) number of messages from a
//! queue, optionally answer each one, and expose what arrived.

mod factory;
mod queue_receiver;
mod receiver;
mod response;

pub use factory::{MockedReceiverBuilder, MockedReceiverFactory};
pub use queue_receiver::QueueReceiver;
pub use receiver::{
    ConsumptionSpec, DeliveryFailure, ExpectedCount, MockedReceiver, ReceivedMessage,
    ReceiverState, StopReason,
};
pub use response::{MockedResponse, MockedResponseBuilder};
