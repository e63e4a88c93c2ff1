//! Broker backends.

mod memory;
pub mod postgres;

use std::sync::RwLock;

use conveyor_core::transport::{MessageHandler, TransportEvent};
use futures::future::join_all;

pub use memory::{MemoryBroker, MemoryBrokerConfig, MemoryTransport};
pub use postgres::{PostgresTransport, PostgresTransportConfig};

/// Run every registered handler on an event. True when all succeeded, in
/// which case the delivery may be acknowledged.
pub(crate) async fn deliver(handlers: &RwLock<Vec<MessageHandler>>, event: TransportEvent) -> bool {
    let handlers: Vec<MessageHandler> = handlers
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let results = join_all(handlers.iter().map(|handler| handler(event.clone()))).await;

    let mut ok = true;
    for result in results {
        if let Err(e) = result {
            tracing::warn!(event = event.event_type(), "Message handler failed: {}", e);
            ok = false;
        }
    }
    ok
}
