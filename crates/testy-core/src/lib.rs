//! Shared plumbing for testy fixtures: errors, configuration, logging,
//! the fixture lifecycle and the JSON mapper.

pub mod assertions;
pub mod config;
pub mod error;
pub mod fixture;
pub mod json;
pub mod logging;

pub use config::{BrokerConfig, LoggingConfig, ReceiverConfig, TestyConfig};
pub use error::{Result, TestyError};
pub use fixture::{with_fixture, Fixture};
pub use json::{JsonMapper, WithJsonMapper, WithJsonMapperBuilder};
pub use logging::init_test_logging;
