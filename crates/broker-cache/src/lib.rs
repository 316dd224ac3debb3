//! # broker-cache
//!
//! Connection and sender cache for a messaging-broker client.
//!
//! Given a broker namespace and a destination (queue or topic) name, the
//! cache lazily opens and reuses one broker connection per namespace and,
//! within it, one sender per destination. Outbound messages are routed
//! through the cached sender for a (namespace, destination) pair.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionRegistry ── namespace ──▶ Connection ── destination ──▶ Sender
//!        │                                │                           │
//!        └──────── BrokerClient ─────────▶ BrokerSession ───────────▶ BrokerSender
//! ```
//!
//! - **Registry** ([`ConnectionRegistry`]): namespace -> [`Connection`]
//! - **Sender group** ([`Connection`]): destination -> [`Sender`]
//! - **Transport** ([`transport`]): traits wrapping the real broker SDK
//!
//! Ownership is a two-level tree. Teardown flows top-down: the registry
//! disposes each connection, which disposes each sender before closing its
//! session.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = Arc::new(ConnectionRegistry::new(Arc::new(broker_client)));
//!
//! registry.get_or_create_connection("sgsldspcx", &credentials).await?;
//! registry.get_or_create_sender("sgsldspcx", "playground").await?;
//!
//! let msg = OutboundMessage::new("application/json", body);
//! registry.send("sgsldspcx", "playground", &msg).await?;
//!
//! registry.teardown().await?;
//! ```

pub mod config;
pub mod connection;
pub mod memory;
pub mod registry;
pub mod sender;
pub mod transport;

mod credentials;
mod deadline;
mod error;
mod message;

pub use config::{CacheConfig, ConfigError};
pub use connection::{Connection, ConnectionState};
pub use credentials::Credentials;
pub use error::{CacheError, MissingKey, TeardownFailure, TransportError};
pub use memory::{FaultPlan, InMemoryBroker};
pub use message::OutboundMessage;
pub use registry::ConnectionRegistry;
pub use sender::Sender;

use std::sync::Arc;

use async_trait::async_trait;

/// The operations request handlers need from the cache.
///
/// Handlers hold an injected `Arc<dyn SenderCache>` rather than reaching for
/// a process-wide global, which keeps them testable against a registry
/// backed by [`InMemoryBroker`].
#[async_trait]
pub trait SenderCache: Send + Sync {
    /// Get or open the connection for `namespace`.
    async fn get_or_create_connection(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError>;

    /// Get or create the sender for (`namespace`, `destination`).
    async fn get_or_create_sender(
        &self,
        namespace: &str,
        destination: &str,
    ) -> Result<Arc<Sender>, CacheError>;

    /// Send through an already created sender.
    async fn send(
        &self,
        namespace: &str,
        destination: &str,
        message: &OutboundMessage,
    ) -> Result<(), CacheError>;
}

#[async_trait]
impl SenderCache for ConnectionRegistry {
    async fn get_or_create_connection(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError> {
        ConnectionRegistry::get_or_create_connection(self, namespace, credentials).await
    }

    async fn get_or_create_sender(
        &self,
        namespace: &str,
        destination: &str,
    ) -> Result<Arc<Sender>, CacheError> {
        ConnectionRegistry::get_or_create_sender(self, namespace, destination).await
    }

    async fn send(
        &self,
        namespace: &str,
        destination: &str,
        message: &OutboundMessage,
    ) -> Result<(), CacheError> {
        ConnectionRegistry::send(self, namespace, destination, message).await
    }
}
