//! Message model shared by the broker, the receivers and the RPC client.

use std::collections::HashMap;

/// Message headers. Key order carries no meaning.
pub type Headers = HashMap<String, HeaderValue>;

/// Scalar header value, the subset of AMQP field values tests exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<u16> for HeaderValue {
    fn from(v: u16) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::String(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::String(v)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(v: Vec<u8>) -> Self {
        HeaderValue::Bytes(v)
    }
}

/// Message properties carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// Request/reply correlation identifier.
    pub correlation_id: Option<String>,
    /// Queue replies should be sent to.
    pub reply_to: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Application headers.
    pub headers: Headers,
}

impl Properties {
    /// Set the correlation identifier.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned tag, unique per broker.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publish time.
    pub routing_key: String,
    /// Message properties.
    pub properties: Properties,
    /// Message body.
    pub body: Vec<u8>,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target exchange; `""` is the default exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message properties.
    pub properties: Properties,
    /// Message body.
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Create a message with default properties.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties: Properties::default(),
            body: body.into(),
        }
    }

    /// Replace the properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}
