//! Broker client abstraction.
//!
//! The cache does no wire-level work itself. It drives a broker client
//! through these three traits:
//!
//! ```text
//! BrokerClient ──connect()──▶ BrokerSession ──create_sender()──▶ BrokerSender
//!                                  │                                  │
//!                               close()                        send() / close()
//! ```
//!
//! Implementations wrap a real broker SDK; [`InMemoryBroker`](crate::memory::InMemoryBroker)
//! is the in-process implementation used by tests.

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::TransportError;
use crate::message::OutboundMessage;

/// Opens sessions to broker namespaces.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open a session to `namespace` using `credentials`.
    async fn connect(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// A live session to one broker namespace.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Create a sender bound to `destination` (queue or topic name).
    async fn create_sender(
        &self,
        destination: &str,
    ) -> Result<Box<dyn BrokerSender>, TransportError>;

    /// Close the session and release its network resources.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A destination-bound send path.
#[async_trait]
pub trait BrokerSender: Send + Sync {
    /// Send one message and wait for the broker to acknowledge it.
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Close the sender.
    async fn close(&self) -> Result<(), TransportError>;
}
