//! The broker capability consumed by the agency core.
//!
//! The real transport is an external collaborator; this crate defines the
//! connection/channel/binding traits the core programs against, and an
//! in-memory emulation broker used by tests and embedders.

use models::Message;
use std::sync::{Arc, Weak};

mod emu;
pub use emu::Broker;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection is closed")]
    Disconnected,
    #[error("publish failed: {0}")]
    Publish(String),
}

/// The inbound half of a connection: the owner is offered every message
/// matching one of its bindings, and reports whether it was consumed.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    async fn on_message(&self, message: Message) -> bool;
}

/// A personal binding on `(key, shard)`. Owned by whoever created it;
/// revocation is idempotent.
pub trait Binding: Send + Sync {
    fn key(&self) -> &str;
    fn shard(&self) -> &str;
    fn revoke(&self);
    fn is_revoked(&self) -> bool;
}

/// An established connection to the broker.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    async fn publish(&self, key: &str, shard: &str, message: Message) -> Result<(), Error>;
    fn personal_binding(&self, key: &str, shard: &str) -> Result<Arc<dyn Binding>, Error>;
    fn get_bindings(&self, shard: &str) -> Vec<Arc<dyn Binding>>;
    fn disconnect(&self);
}

/// Dials connections on behalf of message sinks. The owner is held weakly:
/// delivery stops when it goes away.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn get_connection(&self, owner: Weak<dyn MessageSink>) -> Result<Arc<dyn Channel>, Error>;
}
