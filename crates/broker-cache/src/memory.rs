//! In-memory broker for testing and single-process use.
//!
//! [`InMemoryBroker`] implements the [`transport`](crate::transport) traits
//! without any network. It records every accepted message per
//! (namespace, destination), counts open/create/close calls, and can be told
//! to fail specific calls for a namespace.
//!
//! ```
//! use std::sync::Arc;
//! use broker_cache::{ConnectionRegistry, Credentials, InMemoryBroker, OutboundMessage};
//!
//! # tokio_test_block_on(async {
//! let broker = InMemoryBroker::new();
//! let registry = ConnectionRegistry::new(Arc::new(broker.clone()));
//!
//! registry
//!     .get_or_create_connection("ns1", &Credentials::connection_string("Endpoint=sb://ns1/"))
//!     .await
//!     .unwrap();
//! registry.get_or_create_sender("ns1", "orders").await.unwrap();
//! registry
//!     .send("ns1", "orders", &OutboundMessage::new("text/plain", "hello"))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(broker.delivered("ns1", "orders").len(), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::TransportError;
use crate::message::OutboundMessage;
use crate::transport::{BrokerClient, BrokerSender, BrokerSession};

/// Calls to fail for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail `BrokerClient::connect`
    pub connect: bool,
    /// Reject the credentials on `BrokerClient::connect`
    pub unauthorized: bool,
    /// Fail `BrokerSession::create_sender`
    pub create_sender: bool,
    /// Fail `BrokerSender::send`
    pub send: bool,
    /// Fail `BrokerSender::close`
    pub close_sender: bool,
    /// Fail `BrokerSession::close`
    pub close_session: bool,
}

#[derive(Default)]
struct BrokerState {
    connects: AtomicUsize,
    senders_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    senders_closed: AtomicUsize,
    connect_latency_ms: AtomicU64,
    send_latency_ms: AtomicU64,
    close_latency_ms: AtomicU64,
    delivered: DashMap<(String, String), Vec<OutboundMessage>>,
    credentials: DashMap<String, Credentials>,
    faults: DashMap<String, FaultPlan>,
}

impl BrokerState {
    fn faults_for(&self, namespace: &str) -> FaultPlan {
        self.faults
            .get(namespace)
            .map(|f| *f.value())
            .unwrap_or_default()
    }
}

fn millis(latency: Duration) -> u64 {
    u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)
}

async fn simulate_latency(ms: &AtomicU64) {
    let ms = ms.load(Ordering::Relaxed);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// In-memory broker.
///
/// Cheap to clone; clones share the same recorded state, so a test can hand
/// one clone to the cache and inspect another.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `connect` call.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state
            .connect_latency_ms
            .store(millis(latency), Ordering::Relaxed);
    }

    /// Delay every `send` call.
    pub fn set_send_latency(&self, latency: Duration) {
        self.state
            .send_latency_ms
            .store(millis(latency), Ordering::Relaxed);
    }

    /// Delay every sender and session `close` call.
    pub fn set_close_latency(&self, latency: Duration) {
        self.state
            .close_latency_ms
            .store(millis(latency), Ordering::Relaxed);
    }

    /// Fail the calls in `plan` for `namespace`.
    pub fn inject_faults(&self, namespace: impl Into<String>, plan: FaultPlan) {
        self.state.faults.insert(namespace.into(), plan);
    }

    /// Stop injecting faults for `namespace`.
    pub fn clear_faults(&self, namespace: &str) {
        self.state.faults.remove(namespace);
    }

    /// Number of sessions opened.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of senders created.
    pub fn sender_create_count(&self) -> usize {
        self.state.senders_created.load(Ordering::SeqCst)
    }

    /// Number of sessions closed successfully.
    pub fn closed_session_count(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    /// Number of senders closed successfully.
    pub fn closed_sender_count(&self) -> usize {
        self.state.senders_closed.load(Ordering::SeqCst)
    }

    /// Messages accepted for a (namespace, destination) pair, in order.
    pub fn delivered(&self, namespace: &str, destination: &str) -> Vec<OutboundMessage> {
        self.state
            .delivered
            .get(&(namespace.to_string(), destination.to_string()))
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    /// Credentials used by the most recent successful `connect` for `namespace`.
    pub fn last_credentials(&self, namespace: &str) -> Option<Credentials> {
        self.state
            .credentials
            .get(namespace)
            .map(|c| c.value().clone())
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        simulate_latency(&self.state.connect_latency_ms).await;

        let faults = self.state.faults_for(namespace);
        if faults.connect {
            return Err(TransportError::connect_failed(namespace, "injected fault"));
        }
        if faults.unauthorized {
            return Err(TransportError::Unauthorized {
                namespace: namespace.to_string(),
            });
        }

        self.state
            .credentials
            .insert(namespace.to_string(), credentials.clone());
        debug!(namespace = %namespace, "In-memory session opened");

        Ok(Box::new(MemorySession {
            namespace: namespace.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    namespace: String,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_sender(
        &self,
        destination: &str,
    ) -> Result<Box<dyn BrokerSender>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed(format!("session {}", self.namespace)));
        }
        if self.state.faults_for(&self.namespace).create_sender {
            return Err(TransportError::rejected(format!(
                "sender for {} refused",
                destination
            )));
        }

        self.state.senders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySender {
            namespace: self.namespace.clone(),
            destination: destination.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        simulate_latency(&self.state.close_latency_ms).await;

        if self.state.faults_for(&self.namespace).close_session {
            return Err(TransportError::other(format!(
                "closing session {} failed",
                self.namespace
            )));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemorySender {
    namespace: String,
    destination: String,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSender for MemorySender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        simulate_latency(&self.state.send_latency_ms).await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed(format!("sender {}", self.destination)));
        }
        if self.state.faults_for(&self.namespace).send {
            return Err(TransportError::rejected("injected send fault"));
        }

        self.state
            .delivered
            .entry((self.namespace.clone(), self.destination.clone()))
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        simulate_latency(&self.state.close_latency_ms).await;

        if self.state.faults_for(&self.namespace).close_sender {
            return Err(TransportError::other(format!(
                "closing sender {} failed",
                self.destination
            )));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.senders_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
