//! Connection registry.
//!
//! Maps a broker namespace to one lazily opened [`Connection`]. The registry
//! is an explicitly constructed object: build one at startup, share it as an
//! `Arc` with whatever handles requests, and call
//! [`teardown`](ConnectionRegistry::teardown) on shutdown.
//!
//! ## Concurrency
//!
//! ```text
//!            gate: RwLock<()>
//!   shared ─────────┴───────── exclusive
//!   get_or_create_*, send      teardown, invalidate, refresh
//!            │
//!            ▼
//!   DashMap<namespace, Arc<OnceCell<Arc<Connection>>>>
//! ```
//!
//! Each namespace gets a `OnceCell` slot through an atomic `entry()` insert,
//! so for a given namespace the broker `connect` call runs at most once and
//! every concurrent caller receives the same `Arc<Connection>`.
//!
//! ## Credentials on a cache hit
//!
//! First writer wins: once a namespace has a live connection, credentials
//! passed to later `get_or_create_connection` calls are ignored. Use
//! [`refresh_connection`](ConnectionRegistry::refresh_connection) to rotate
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::connection::{Connection, ConnectionState};
use crate::credentials::Credentials;
use crate::deadline::with_deadline;
use crate::error::{CacheError, DisposalTally};
use crate::message::OutboundMessage;
use crate::sender::Sender;
use crate::transport::BrokerClient;

type ConnectionSlot = Arc<OnceCell<Arc<Connection>>>;

/// Cache of broker connections keyed by namespace.
pub struct ConnectionRegistry {
    client: Arc<dyn BrokerClient>,
    config: CacheConfig,
    connections: DashMap<String, ConnectionSlot>,
    /// Namespaces whose connection was torn down and not reopened since.
    retired: DashSet<String>,
    gate: RwLock<()>,
}

impl ConnectionRegistry {
    /// Create an empty registry with default configuration.
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self::with_config(client, CacheConfig::default())
    }

    /// Create an empty registry.
    pub fn with_config(client: Arc<dyn BrokerClient>, config: CacheConfig) -> Self {
        info!(
            connect_timeout_ms = ?config.connect_timeout_ms,
            send_timeout_ms = ?config.send_timeout_ms,
            close_timeout_ms = ?config.close_timeout_ms,
            "Creating connection registry"
        );
        Self {
            client,
            config,
            connections: DashMap::new(),
            retired: DashSet::new(),
            gate: RwLock::new(()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the connection for `namespace`, opening it with `credentials` if absent.
    ///
    /// On a cache hit the supplied credentials are ignored.
    #[instrument(skip(self, credentials), name = "cache.registry.get_or_create_connection")]
    pub async fn get_or_create_connection(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError> {
        let _shared = self.gate.read().await;
        self.get_or_open(namespace, credentials).await
    }

    /// Callers must hold `gate` (either side).
    async fn get_or_open(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError> {
        loop {
            let slot = self
                .connections
                .entry(namespace.to_string())
                .or_default()
                .clone();

            if let Some(connection) = slot.get() {
                if connection.is_live() {
                    debug!("Reusing cached connection");
                    return Ok(Arc::clone(connection));
                }
                // Torn down directly through a held handle; replace the stale slot.
                debug!("Cached connection is disposed, reopening");
                self.forget_stale(namespace, &slot);
                continue;
            }

            let connection = slot
                .get_or_try_init(|| self.open(namespace, credentials))
                .await
                .inspect_err(|e| {
                    warn!(error = %e, "Failed to open broker connection");
                })?;
            return Ok(Arc::clone(connection));
        }
    }

    async fn open(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError> {
        let session = with_deadline(
            self.config.connect_timeout(),
            "connect",
            self.client.connect(namespace, credentials),
        )
        .await?;

        self.retired.remove(namespace);
        info!(namespace = %namespace, "Broker connection opened");
        Ok(Arc::new(Connection::new(
            namespace,
            session,
            self.config.close_timeout(),
        )))
    }

    fn lookup(&self, namespace: &str) -> Result<Arc<Connection>, CacheError> {
        if let Some(connection) = self.connection(namespace) {
            return Ok(connection);
        }
        if self.retired.contains(namespace) {
            return Err(CacheError::invalid_state(format!(
                "connection for namespace '{}' was torn down",
                namespace
            )));
        }
        Err(CacheError::namespace_not_found(namespace))
    }

    /// Get the sender for (`namespace`, `destination`), creating it if absent.
    ///
    /// Fails with `NotFound` if `namespace` has no connection yet.
    #[instrument(skip(self), name = "cache.registry.get_or_create_sender")]
    pub async fn get_or_create_sender(
        &self,
        namespace: &str,
        destination: &str,
    ) -> Result<Arc<Sender>, CacheError> {
        let _shared = self.gate.read().await;
        self.lookup(namespace)?
            .get_or_create_sender(destination)
            .await
    }

    /// Send `message` through the cached sender for (`namespace`, `destination`).
    ///
    /// Does not create the sender. Waits for the broker acknowledgment, bounded
    /// by the configured default send timeout if one is set.
    pub async fn send(
        &self,
        namespace: &str,
        destination: &str,
        message: &OutboundMessage,
    ) -> Result<(), CacheError> {
        self.send_inner(namespace, destination, message, self.config.send_timeout())
            .await
    }

    /// As [`send`](Self::send) with an explicit deadline.
    pub async fn send_with_deadline(
        &self,
        namespace: &str,
        destination: &str,
        message: &OutboundMessage,
        deadline: Duration,
    ) -> Result<(), CacheError> {
        self.send_inner(namespace, destination, message, Some(deadline))
            .await
    }

    #[instrument(
        skip(self, message),
        name = "cache.registry.send",
        fields(content_type = %message.content_type(), body_len = message.len())
    )]
    async fn send_inner(
        &self,
        namespace: &str,
        destination: &str,
        message: &OutboundMessage,
        deadline: Option<Duration>,
    ) -> Result<(), CacheError> {
        // Held for the whole send so teardown waits for in-flight messages.
        let _shared = self.gate.read().await;
        self.lookup(namespace)?
            .send_with_deadline(destination, message, deadline)
            .await
    }

    /// Tear down one cached connection and forget it.
    ///
    /// Later sends to the namespace fail with `InvalidState` until it is
    /// reopened with [`get_or_create_connection`](Self::get_or_create_connection).
    #[instrument(skip(self), name = "cache.registry.invalidate")]
    pub async fn invalidate(&self, namespace: &str) -> Result<(), CacheError> {
        let _exclusive = self.gate.write().await;
        let connection = self
            .take(namespace)
            .ok_or_else(|| CacheError::namespace_not_found(namespace))?;

        info!("Invalidating cached connection");
        match connection.dispose().await {
            Some(tally) => tally.into_result(),
            None => Ok(()),
        }
    }

    /// Replace the cached connection for `namespace` with one opened using
    /// `credentials`.
    ///
    /// Disposal failures of the old connection are logged; the new
    /// connection is returned regardless.
    #[instrument(skip(self, credentials), name = "cache.registry.refresh_connection")]
    pub async fn refresh_connection(
        &self,
        namespace: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection>, CacheError> {
        let _exclusive = self.gate.write().await;

        if let Some(old) = self.take(namespace) {
            if let Some(Err(e)) = old.dispose().await.map(DisposalTally::into_result) {
                warn!(error = %e, "Old connection did not dispose cleanly");
            }
        }

        let connection = self.get_or_open(namespace, credentials).await?;
        info!("Connection refreshed");
        Ok(connection)
    }

    /// Remove the namespace's slot and mark it retired. Requires the exclusive gate.
    fn take(&self, namespace: &str) -> Option<Arc<Connection>> {
        let (_, slot) = self.connections.remove(namespace)?;
        let connection = slot.get().cloned()?;
        self.retired.insert(namespace.to_string());
        Some(connection)
    }

    /// Dispose every connection and sender, then empty the registry.
    ///
    /// Connections are disposed concurrently. Every disposal is attempted; if
    /// any failed, the first failure is returned once all have finished. The
    /// registry stays usable: later `get_or_create_connection` calls open new
    /// connections, while sends to namespaces torn down here fail with
    /// `InvalidState` until reopened.
    #[instrument(skip(self), name = "cache.registry.teardown")]
    pub async fn teardown(&self) -> Result<(), CacheError> {
        let _exclusive = self.gate.write().await;

        let drained: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter_map(|slot| slot.value().get().cloned())
            .collect();
        self.connections.clear();
        for connection in &drained {
            self.retired.insert(connection.namespace().to_string());
        }

        info!(connections = drained.len(), "Tearing down connection registry");

        let tallies = join_all(drained.iter().map(|connection| connection.dispose())).await;
        let mut total = DisposalTally::default();
        for tally in tallies.into_iter().flatten() {
            total.merge(tally);
        }

        info!(disposals = total.attempted(), "Connection registry torn down");
        total.into_result()
    }

    /// Cached live connection for `namespace`, without creating one.
    ///
    /// A connection torn down through its own handle is dropped from the
    /// registry here and the namespace is treated as retired.
    pub fn connection(&self, namespace: &str) -> Option<Arc<Connection>> {
        let slot = self
            .connections
            .get(namespace)
            .map(|slot| Arc::clone(slot.value()))?;
        let connection = slot.get().cloned()?;
        if connection.is_live() {
            return Some(connection);
        }
        self.forget_stale(namespace, &slot);
        None
    }

    /// Remove `slot` if it is still the one cached for `namespace`.
    fn forget_stale(&self, namespace: &str, slot: &ConnectionSlot) {
        let removed = self
            .connections
            .remove_if(namespace, |_, current| Arc::ptr_eq(current, slot));
        if removed.is_some() {
            debug!(namespace = %namespace, "Dropped connection torn down outside the registry");
            self.retired.insert(namespace.to_string());
        }
    }

    /// Whether `namespace` has a live connection.
    pub fn contains(&self, namespace: &str) -> bool {
        self.connection(namespace).is_some()
    }

    /// Lifecycle state of the connection for `namespace`, if the registry knows it.
    pub fn connection_state(&self, namespace: &str) -> Option<ConnectionState> {
        if let Some(slot) = self.connections.get(namespace) {
            return Some(match slot.value().get() {
                Some(connection) => connection.state(),
                None => ConnectionState::Uninitialized,
            });
        }
        self.retired
            .contains(namespace)
            .then_some(ConnectionState::Disposed)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|slot| is_live_slot(slot.value()))
            .count()
    }

    /// Namespaces with a live connection.
    pub fn namespaces(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|slot| is_live_slot(slot.value()))
            .map(|slot| slot.key().clone())
            .collect()
    }
}

fn is_live_slot(slot: &ConnectionSlot) -> bool {
    slot.get().is_some_and(|connection| connection.is_live())
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let open = self.connection_count();
        if open > 0 {
            warn!(connections = open, "Connection registry dropped without teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::memory::{FaultPlan, InMemoryBroker};

    fn creds(tag: &str) -> Credentials {
        Credentials::connection_string(format!("Endpoint=sb://{}/", tag))
    }

    fn registry() -> (ConnectionRegistry, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        (ConnectionRegistry::new(Arc::new(broker.clone())), broker)
    }

    fn json(body: &str) -> OutboundMessage {
        OutboundMessage::new("application/json", body)
    }

    #[tokio::test]
    async fn test_connection_identity() {
        let (registry, broker) = registry();

        let a = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        let b = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.namespaces(), vec!["ns1"]);
    }

    #[tokio::test]
    async fn test_credentials_ignored_on_hit() {
        let (registry, broker) = registry();

        registry.get_or_create_connection("ns1", &creds("first")).await.unwrap();
        registry.get_or_create_connection("ns1", &creds("second")).await.unwrap();

        assert_eq!(broker.last_credentials("ns1"), Some(creds("first")));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_sender_requires_connection() {
        let (registry, _broker) = registry();

        let err = registry.get_or_create_sender("nope", "queue").await.unwrap_err();
        assert_eq!(err, CacheError::namespace_not_found("nope"));
    }

    #[tokio::test]
    async fn test_sender_identity_through_registry() {
        let (registry, _broker) = registry();
        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();

        let a = registry.get_or_create_sender("ns1", "q1").await.unwrap();
        let b = registry.get_or_create_sender("ns1", "q1").await.unwrap();
        let c = registry.get_or_create_sender("ns1", "q2").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_send_not_found_cases() {
        let (registry, _broker) = registry();

        let err = registry.send("ghost", "q1", &json("{}")).await.unwrap_err();
        assert_eq!(err, CacheError::namespace_not_found("ghost"));

        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        let err = registry.send("ns1", "q1", &json("{}")).await.unwrap_err();
        assert_eq!(err, CacheError::destination_not_found("ns1", "q1"));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let (registry, broker) = registry();
        broker.inject_faults(
            "ns1",
            FaultPlan {
                connect: true,
                ..Default::default()
            },
        );

        let err = registry
            .get_or_create_connection("ns1", &creds("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Transport(TransportError::ConnectFailed { .. })
        ));
        assert!(!registry.contains("ns1"));
        assert_eq!(
            registry.connection_state("ns1"),
            Some(ConnectionState::Uninitialized)
        );

        broker.clear_faults("ns1");
        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        assert_eq!(registry.connection_state("ns1"), Some(ConnectionState::Live));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let broker = InMemoryBroker::new();
        broker.set_connect_latency(Duration::from_secs(60));
        let config = CacheConfig {
            connect_timeout_ms: Some(100),
            ..Default::default()
        };
        let registry = ConnectionRegistry::with_config(Arc::new(broker.clone()), config);

        let err = registry
            .get_or_create_connection("slow", &creds("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout { operation: "connect", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_deadline() {
        let (registry, broker) = registry();
        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        registry.get_or_create_sender("ns1", "q1").await.unwrap();
        broker.set_send_latency(Duration::from_secs(30));

        let err = registry
            .send_with_deadline("ns1", "q1", &json("{}"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::Timeout {
                operation: "send",
                elapsed: Duration::from_millis(200),
            }
        );
        assert!(broker.delivered("ns1", "q1").is_empty());
    }

    #[tokio::test]
    async fn test_teardown_then_invalid_state_and_reuse() {
        let (registry, broker) = registry();
        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        let sender = registry.get_or_create_sender("ns1", "q1").await.unwrap();

        registry.teardown().await.unwrap();

        assert_eq!(registry.connection_count(), 0);
        assert!(sender.is_disposed());
        assert!(registry
            .send("ns1", "q1", &json("{}"))
            .await
            .unwrap_err()
            .is_invalid_state());
        assert!(registry
            .get_or_create_sender("ns1", "q1")
            .await
            .unwrap_err()
            .is_invalid_state());
        assert_eq!(
            registry.connection_state("ns1"),
            Some(ConnectionState::Disposed)
        );

        // A new namespace works as on a fresh registry
        registry.get_or_create_connection("ns2", &creds("b")).await.unwrap();
        registry.get_or_create_sender("ns2", "q1").await.unwrap();
        registry.send("ns2", "q1", &json("{}")).await.unwrap();
        assert_eq!(broker.delivered("ns2", "q1").len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_reopen_after_teardown() {
        let (registry, broker) = registry();
        let old = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        registry.teardown().await.unwrap();

        let new = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.is_live());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_teardown_of_empty_registry() {
        let (registry, _broker) = registry();
        registry.teardown().await.unwrap();
        registry.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (registry, broker) = registry();
        registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        registry.get_or_create_sender("ns1", "q1").await.unwrap();
        registry.get_or_create_connection("ns2", &creds("b")).await.unwrap();

        registry.invalidate("ns1").await.unwrap();

        assert!(!registry.contains("ns1"));
        assert!(registry.contains("ns2"));
        assert_eq!(broker.closed_session_count(), 1);
        assert_eq!(broker.closed_sender_count(), 1);
        assert!(registry
            .send("ns1", "q1", &json("{}"))
            .await
            .unwrap_err()
            .is_invalid_state());

        assert!(registry.invalidate("ns1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_rotates_credentials() {
        let (registry, broker) = registry();
        let old = registry
            .get_or_create_connection("ns1", &creds("old-key"))
            .await
            .unwrap();

        let new = registry
            .refresh_connection("ns1", &creds("new-key"))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!old.is_live());
        assert_eq!(broker.last_credentials("ns1"), Some(creds("new-key")));
        assert_eq!(registry.connection_state("ns1"), Some(ConnectionState::Live));
    }

    #[tokio::test]
    async fn test_stale_connection_is_replaced() {
        let (registry, broker) = registry();
        let old = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();

        // A holder tears the connection down directly
        old.teardown().await.unwrap();

        let new = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.is_live());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_torn_down_by_holder_leaves_registry() {
        let (registry, broker) = registry();
        let held = registry.get_or_create_connection("ns1", &creds("a")).await.unwrap();
        registry.get_or_create_sender("ns1", "q1").await.unwrap();
        registry.get_or_create_connection("ns2", &creds("b")).await.unwrap();

        held.teardown().await.unwrap();

        assert!(!registry.contains("ns1"));
        assert!(registry.connection("ns1").is_none());
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.namespaces(), vec!["ns2"]);
        assert_eq!(
            registry.connection_state("ns1"),
            Some(ConnectionState::Disposed)
        );
        assert!(registry
            .send("ns1", "q1", &json("{}"))
            .await
            .unwrap_err()
            .is_invalid_state());
        assert!(registry
            .get_or_create_sender("ns1", "q1")
            .await
            .unwrap_err()
            .is_invalid_state());

        // Registry teardown does not dispose it a second time
        registry.teardown().await.unwrap();
        assert_eq!(broker.closed_session_count(), 2);
        assert_eq!(broker.closed_sender_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_survives_failed_dispose_of_old_connection() {
        let (registry, broker) = registry();
        let old = registry
            .get_or_create_connection("ns1", &creds("old-key"))
            .await
            .unwrap();
        broker.inject_faults(
            "ns1",
            FaultPlan {
                close_session: true,
                ..Default::default()
            },
        );

        let new = registry
            .refresh_connection("ns1", &creds("new-key"))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!old.is_live());
        assert!(new.is_live());
        assert_eq!(broker.closed_session_count(), 0);
        assert_eq!(broker.last_credentials("ns1"), Some(creds("new-key")));
        assert!(Arc::ptr_eq(&registry.connection("ns1").unwrap(), &new));
        assert_eq!(registry.connection_state("ns1"), Some(ConnectionState::Live));
    }

    #[tokio::test]
    async fn test_rejected_credentials_surface_as_transport_error() {
        let (registry, broker) = registry();
        broker.inject_faults(
            "ns1",
            FaultPlan {
                unauthorized: true,
                ..Default::default()
            },
        );

        let err = registry
            .get_or_create_connection("ns1", &creds("bad"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::Transport(TransportError::Unauthorized {
                namespace: "ns1".to_string(),
            })
        );
        assert!(!registry.contains("ns1"));
    }
}
