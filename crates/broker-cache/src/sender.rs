//! Cached destination-bound sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::deadline::{close_within, with_deadline};
use crate::error::{CacheError, TransportError};
use crate::message::OutboundMessage;
use crate::transport::BrokerSender;

/// A sender bound to one destination on one cached connection.
///
/// Exactly one exists per (namespace, destination) for the lifetime of its
/// [`Connection`](crate::Connection). Once the connection is torn down the
/// sender is disposed and every further send fails with `InvalidState`.
pub struct Sender {
    namespace: String,
    destination: String,
    handle: Box<dyn BrokerSender>,
    /// Sends hold the read side; disposal takes the write side so it waits
    /// for in-flight sends.
    gate: RwLock<()>,
    disposed: AtomicBool,
}

impl Sender {
    pub(crate) fn new(
        namespace: &str,
        destination: &str,
        handle: Box<dyn BrokerSender>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            destination: destination.to_string(),
            handle,
            gate: RwLock::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Namespace of the owning connection.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Destination (queue or topic) this sender is bound to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the sender has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Send a message and wait for the broker to acknowledge it.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), CacheError> {
        self.send_with_deadline(message, None).await
    }

    /// Send a message, giving up with `Timeout` if `deadline` elapses first.
    #[instrument(
        skip(self, message),
        name = "cache.sender.send",
        fields(namespace = %self.namespace, destination = %self.destination, body_len = message.len())
    )]
    pub async fn send_with_deadline(
        &self,
        message: &OutboundMessage,
        deadline: Option<Duration>,
    ) -> Result<(), CacheError> {
        let _in_flight = self.gate.read().await;
        if self.is_disposed() {
            return Err(CacheError::invalid_state(format!(
                "sender for '{}' in namespace '{}' is disposed",
                self.destination, self.namespace
            )));
        }

        match with_deadline(deadline, "send", self.handle.send(message)).await {
            Ok(()) => {
                debug!("Message acknowledged by broker");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Send failed");
                Err(e)
            }
        }
    }

    /// Close the broker-side sender. Later calls are no-ops.
    pub(crate) async fn dispose(
        &self,
        close_timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let _exclusive = self.gate.write().await;
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let what = format!("sender {}/{}", self.namespace, self.destination);
        let result = close_within(close_timeout, &what, self.handle.close()).await;
        match &result {
            Ok(()) => debug!(
                namespace = %self.namespace,
                destination = %self.destination,
                "Sender disposed"
            ),
            Err(e) => warn!(
                namespace = %self.namespace,
                destination = %self.destination,
                error = %e,
                "Failed to dispose sender"
            ),
        }
        result
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("namespace", &self.namespace)
            .field("destination", &self.destination)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
