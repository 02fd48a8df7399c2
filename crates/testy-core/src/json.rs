//! JSON mapper fixture.
//!
//! Gives tests one configured place to turn message bodies into values and
//! back, so request/response payloads are encoded the same way on both
//! sides of a mocked exchange.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TestyError};
use crate::fixture::Fixture;

/// Configured JSON encoder/decoder.
#[derive(Debug, Clone, Default)]
pub struct JsonMapper {
    pretty: bool,
}

impl JsonMapper {
    /// Create a mapper with compact output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether output is pretty-printed.
    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    /// Encode a value to bytes.
    pub fn to_vec<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        bytes.map_err(|e| TestyError::Serialization(e.to_string()))
    }

    /// Decode bytes into a value.
    pub fn from_slice<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| TestyError::Deserialization(e.to_string()))
    }
}

/// Fixture producing a [`JsonMapper`].
///
/// # Example
///
/// ```ignore
/// let fixture = WithJsonMapper::builder().pretty(true).build();
/// let mapper = fixture.setup()?;
/// let bytes = mapper.to_vec(&"hello")?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct WithJsonMapper {
    pretty: bool,
}

impl WithJsonMapper {
    /// Create a builder.
    pub fn builder() -> WithJsonMapperBuilder {
        WithJsonMapperBuilder::default()
    }

    /// The mapper this fixture hands out.
    pub fn mapper(&self) -> JsonMapper {
        JsonMapper {
            pretty: self.pretty,
        }
    }
}

impl Fixture for WithJsonMapper {
    type Handle = JsonMapper;

    fn setup(&self) -> Result<JsonMapper> {
        Ok(self.mapper())
    }

    fn teardown(&self, _handle: JsonMapper) -> Result<()> {
        Ok(())
    }
}

/// Builder for WithJsonMapper.
#[derive(Debug, Default)]
pub struct WithJsonMapperBuilder {
    pretty: bool,
}

impl WithJsonMapperBuilder {
    /// Pretty-print encoded output.
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Build the fixture.
    pub fn build(self) -> WithJsonMapper {
        WithJsonMapper {
            pretty: self.pretty,
        }
    }
}
