//! Value-graph snapshots.
//!
//! A [`Live`] value is an in-memory graph: scalars, lists, maps, shared
//! (aliasable, possibly cyclic) nodes, and handles to live objects. A
//! [`Tree`] is its serialized form, in which sharing is expressed with
//! explicit `Ref`/`Deref` nodes and registered recorders are replaced by
//! their stable journal ids (`External`).

use std::sync::{Arc, Mutex};

mod de;
mod live;
mod ser;
mod tree;

pub use de::{unpack, RestoredInstance};
pub use live::Live;
pub use ser::{convert, freeze};
pub use tree::Tree;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("dereference of unknown reference {0}")]
    UnresolvedRef(u32),
    #[error("unknown external reference {0:?}")]
    UnknownExternal(String),
    #[error("value graph cannot render to JSON (cycle or non-string key)")]
    UnrenderableJson,
}

/// An object that can be embedded in a [`Live`] graph.
///
/// `journal_ref` returns the object's stable journal id when it is a
/// recorder; whether that id is actually substituted during serialization
/// is decided by the [`Externalizer`] (the object must also be present in
/// the externalizer's registry).
pub trait Snapshot: Send + Sync {
    fn type_name(&self) -> &str;

    fn journal_ref(&self) -> Option<String> {
        None
    }

    /// The by-value body of this object.
    fn snapshot(&self) -> Live;

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

/// Decides which handles serialize as external references.
pub trait Externalizer: Send + Sync {
    /// The stable id to substitute for `handle`, or None to serialize it
    /// by value.
    fn identify(&self, handle: &Arc<dyn Snapshot>) -> Option<String>;
}

/// Resolves external references back to live replicas during unpacking.
pub trait Resolver: Send + Sync {
    fn lookup(&self, journal_ref: &str) -> Option<Live>;
}

/// Externalizer that serializes every handle by value.
pub struct NoExternalizer;

impl Externalizer for NoExternalizer {
    fn identify(&self, _handle: &Arc<dyn Snapshot>) -> Option<String> {
        None
    }
}

/// Resolver that knows no externals; unpacking a tree containing an
/// `External` node through it fails.
pub struct NoResolver;

impl Resolver for NoResolver {
    fn lookup(&self, _journal_ref: &str) -> Option<Live> {
        None
    }
}

/// Identity of a graph node, used to detect sharing and cycles.
pub(crate) fn shared_key(node: &Arc<Mutex<Live>>) -> *const () {
    Arc::as_ptr(node) as *const ()
}

pub(crate) fn handle_key(handle: &Arc<dyn Snapshot>) -> *const () {
    Arc::as_ptr(handle) as *const ()
}
