//! Per-namespace connection and its sender group.
//!
//! A [`Connection`] owns one broker session and the [`Sender`]s created on
//! it, keyed by destination name. Senders are created lazily on first request
//! and reused afterwards.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──open──▶ Live ──teardown──▶ Disposed
//! ```
//!
//! `Uninitialized` is the registry slot whose session is still being opened.
//! Only `Live` permits sender creation and sends; `Disposed` is terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::deadline::close_within;
use crate::error::{CacheError, DisposalTally};
use crate::message::OutboundMessage;
use crate::sender::Sender;
use crate::transport::BrokerSession;

/// Lifecycle state of a cached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registry slot reserved, session still being opened
    Uninitialized,
    /// Session open; senders may be created and used
    Live,
    /// Torn down; every operation fails with `InvalidState`
    Disposed,
}

type SenderSlot = Arc<OnceCell<Arc<Sender>>>;

/// A live session to one broker namespace plus its cached senders.
pub struct Connection {
    namespace: String,
    session: Box<dyn BrokerSession>,
    senders: DashMap<String, SenderSlot>,
    /// Normal operations hold the read side; teardown takes the write side.
    gate: RwLock<()>,
    disposed: AtomicBool,
    close_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        namespace: &str,
        session: Box<dyn BrokerSession>,
        close_timeout: Option<Duration>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            session,
            senders: DashMap::new(),
            gate: RwLock::new(()),
            disposed: AtomicBool::new(false),
            close_timeout,
        }
    }

    /// Namespace this connection is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.disposed.load(Ordering::Acquire) {
            ConnectionState::Disposed
        } else {
            ConnectionState::Live
        }
    }

    /// Whether the connection is still live.
    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Live
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(CacheError::invalid_state(format!(
                "connection for namespace '{}' is disposed",
                self.namespace
            )))
        }
    }

    /// Get the sender for `destination`, creating it on first use.
    ///
    /// Concurrent callers for the same destination share one creation; all of
    /// them receive the same `Arc`. A failed creation leaves nothing cached.
    #[instrument(skip(self), name = "cache.connection.get_or_create_sender", fields(namespace = %self.namespace))]
    pub async fn get_or_create_sender(&self, destination: &str) -> Result<Arc<Sender>, CacheError> {
        let _live = self.gate.read().await;
        self.ensure_live()?;

        let slot = self
            .senders
            .entry(destination.to_string())
            .or_default()
            .clone();

        if let Some(sender) = slot.get() {
            debug!("Reusing cached sender");
            return Ok(Arc::clone(sender));
        }

        let sender = slot
            .get_or_try_init(|| async {
                let handle = self.session.create_sender(destination).await?;
                info!(destination = %destination, "Sender created");
                Ok::<_, CacheError>(Arc::new(Sender::new(&self.namespace, destination, handle)))
            })
            .await
            .inspect_err(|e| {
                warn!(destination = %destination, error = %e, "Failed to create sender");
            })?;

        Ok(Arc::clone(sender))
    }

    /// Look up a cached sender without creating one.
    pub fn sender(&self, destination: &str) -> Option<Arc<Sender>> {
        self.senders
            .get(destination)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Number of senders created on this connection.
    pub fn sender_count(&self) -> usize {
        self.senders
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    /// Destinations with a cached sender.
    pub fn destinations(&self) -> Vec<String> {
        self.senders
            .iter()
            .filter(|slot| slot.value().initialized())
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Send through the cached sender for `destination`.
    ///
    /// Fails with `NotFound` if no sender was created for `destination`; this
    /// never creates one.
    pub async fn send(
        &self,
        destination: &str,
        message: &OutboundMessage,
    ) -> Result<(), CacheError> {
        self.send_with_deadline(destination, message, None).await
    }

    /// As [`send`](Self::send), failing with `Timeout` once `deadline` elapses.
    #[instrument(
        skip(self, message),
        name = "cache.connection.send",
        fields(namespace = %self.namespace)
    )]
    pub async fn send_with_deadline(
        &self,
        destination: &str,
        message: &OutboundMessage,
        deadline: Option<Duration>,
    ) -> Result<(), CacheError> {
        let sender = {
            let _live = self.gate.read().await;
            self.ensure_live()?;
            self.sender(destination).ok_or_else(|| {
                debug!(destination = %destination, "No cached sender for destination");
                CacheError::destination_not_found(&self.namespace, destination)
            })?
        };

        sender.send_with_deadline(message, deadline).await
    }

    /// Dispose every sender, then close the session.
    ///
    /// Every disposal is attempted even if an earlier one fails; the first
    /// failure is returned afterwards. Fails with `InvalidState` if the
    /// connection was already torn down.
    pub async fn teardown(&self) -> Result<(), CacheError> {
        match self.dispose().await {
            Some(tally) => tally.into_result(),
            None => Err(CacheError::invalid_state(format!(
                "connection for namespace '{}' is already disposed",
                self.namespace
            ))),
        }
    }

    /// Disposal pass shared with the registry. `None` if already disposed.
    #[instrument(skip(self), name = "cache.connection.dispose", fields(namespace = %self.namespace))]
    pub(crate) async fn dispose(&self) -> Option<DisposalTally> {
        let _exclusive = self.gate.write().await;
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }

        let senders: Vec<Arc<Sender>> = self
            .senders
            .iter()
            .filter_map(|slot| slot.value().get().cloned())
            .collect();
        self.senders.clear();

        let mut tally = DisposalTally::default();
        for sender in &senders {
            tally.record(sender.dispose(self.close_timeout).await);
        }

        let what = format!("session {}", self.namespace);
        let closed = close_within(self.close_timeout, &what, self.session.close()).await;
        if let Err(e) = &closed {
            warn!(error = %e, "Failed to close broker session");
        }
        tally.record(closed);

        info!(senders = senders.len(), "Connection disposed");
        Some(tally)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .field("senders", &self.sender_count())
            .finish()
    }
}
