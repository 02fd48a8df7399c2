use crate::message::{HeaderValue, Headers};

/// Canned reply sent back for every message a mocked receiver consumes.
///
/// # Example
///
/// ```ignore
/// let response = MockedResponse::builder()
///     .body(mapper.to_vec(&OBIWAN)?)
///     .header("status", 200)
///     .build();
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockedResponse {
    body: Vec<u8>,
    headers: Headers,
}

impl MockedResponse {
    /// Create a builder.
    pub fn builder() -> MockedResponseBuilder {
        MockedResponseBuilder::default()
    }

    /// A reply with no body and no headers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reply body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Reply headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Builder for MockedResponse.
#[derive(Debug, Default)]
pub struct MockedResponseBuilder {
    body: Vec<u8>,
    headers: Headers,
}

impl MockedResponseBuilder {
    /// Set the reply body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a reply header; a repeated key keeps the last value.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Build the response.
    pub fn build(self) -> MockedResponse {
        MockedResponse {
            body: self.body,
            headers: self.headers,
        }
    }
}
