//! Shared fixtures for broker-cache integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use broker_cache::{ConnectionRegistry, Credentials, InMemoryBroker, OutboundMessage};

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("broker_cache=debug")
            .with_test_writer()
            .try_init();
    });
}

/// A registry backed by a fresh in-memory broker, plus a handle to inspect it.
pub fn registry() -> (Arc<ConnectionRegistry>, InMemoryBroker) {
    init_tracing();
    let broker = InMemoryBroker::new();
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(broker.clone())));
    (registry, broker)
}

/// Connection-string credentials for a namespace.
pub fn credentials(namespace: &str) -> Credentials {
    Credentials::connection_string(format!(
        "Endpoint=sb://{}.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=test",
        namespace
    ))
}

/// JSON message carrying the current UTC time, as the HTTP collaborator builds it.
pub fn timestamp_message() -> OutboundMessage {
    let body = serde_json::json!({ "time": chrono::Utc::now() });
    OutboundMessage::new("application/json", body.to_string())
}
