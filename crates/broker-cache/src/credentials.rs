//! Credentials used to open a broker session.
//!
//! The cache does not inspect or validate credentials; they are handed to the
//! [`BrokerClient`](crate::transport::BrokerClient) unchanged.

use std::fmt;

/// Credentials sufficient to open a session to one broker namespace.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A broker connection string (endpoint and shared key in one value)
    ConnectionString(String),
    /// Explicit endpoint plus a named shared access key
    Endpoint {
        /// Broker endpoint, e.g. `sb://namespace.example.net/`
        endpoint: String,
        /// Name of the shared access policy
        key_name: String,
        /// Shared access key
        key: String,
    },
}

impl Credentials {
    /// Credentials from a connection string.
    pub fn connection_string(value: impl Into<String>) -> Self {
        Self::ConnectionString(value.into())
    }

    /// Credentials from an endpoint and shared access key.
    pub fn endpoint(
        endpoint: impl Into<String>,
        key_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::Endpoint {
            endpoint: endpoint.into(),
            key_name: key_name.into(),
            key: key.into(),
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(_) => f
                .debug_tuple("ConnectionString")
                .field(&"<redacted>")
                .finish(),
            Self::Endpoint {
                endpoint, key_name, ..
            } => f
                .debug_struct("Endpoint")
                .field("endpoint", endpoint)
                .field("key_name", key_name)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}
