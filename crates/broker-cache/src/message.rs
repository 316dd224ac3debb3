//! Outbound message envelope.

use uuid::Uuid;

/// A message handed to a cached sender.
///
/// Immutable once built: fields are set through the `with_*` builders and
/// read through accessors. The cache does not keep it after the send returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    content_type: String,
    body: Vec<u8>,
    message_id: Option<String>,
    correlation_id: Option<String>,
    subject: Option<String>,
    properties: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Create a message from a content type and body.
    pub fn new(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
            message_id: None,
            correlation_id: None,
            subject: None,
            properties: Vec::new(),
        }
    }

    /// Set an explicit message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Assign a random (v4) message id.
    pub fn with_generated_id(self) -> Self {
        self.with_message_id(Uuid::new_v4().to_string())
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Add an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// MIME content type of the body (e.g. `application/json`).
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Raw message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Broker message id, if one was set.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Correlation id for request/reply flows.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Application-defined label.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Application properties carried alongside the body, in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Body as a string, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
