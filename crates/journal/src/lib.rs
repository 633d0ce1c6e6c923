//! The append-only journal.
//!
//! Every agent-visible operation runs inside a *section* identified by a
//! fiber descriptor; when the section closes, an [`Entry`] is appended
//! recording the call's input, its captured side effects, and its output.
//! Replay re-applies entries and substitutes the recorded side effects for
//! live calls.

use std::sync::{Arc, Mutex};

mod effect;
mod section;
mod sink;

pub use effect::{pack_effects, unpack_effects, EffectOutcome, SideEffect};
pub use section::Section;
pub use sink::{format_entries, MemorySink};

use snapshot::Tree;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("side effect replayed out of order: expected {expected:?}, journal holds {found:?}")]
    EffectMismatch {
        expected: String,
        found: Option<String>,
    },
    #[error("recorded failure: {0}")]
    Recorded(String),
    #[error("malformed journal data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Effect(anyhow::Error),
}

/// Whether journal sections record live execution or consume a previously
/// recorded entry.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    Record,
    Replay,
}

/// The stable identity of a recorder. Agent mediums use their descriptor's
/// `doc_id` as the root; protocol instances are numbered children of it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalId(Arc<str>);

impl JournalId {
    pub fn root(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn child(&self, seq: u64) -> Self {
        Self(Arc::from(format!("{}/{seq}", self.0).as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::fmt::Debug for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// A causal chain of calls. Nested journaled calls share the fiber of
/// their parent section at increasing depth.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(uuid::Uuid);

impl FiberId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl std::fmt::Debug for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

/// Which recorder an entry belongs to: the agency itself (lifecycle
/// events) or a registered recorder.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum InstanceId {
    Agency,
    Recorder(JournalId),
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceId::Agency => f.write_str("agency"),
            InstanceId::Recorder(id) => id.fmt(f),
        }
    }
}

/// One recorded entry. Input and side effects are snapshot via the tree
/// serializer's `convert`; the output is frozen.
#[derive(Clone, Debug)]
pub struct Entry {
    pub agent_id: String,
    pub instance_id: InstanceId,
    pub entry_id: String,
    pub fiber_id: FiberId,
    pub fiber_depth: u32,
    pub input: Tree,
    pub side_effects: Tree,
    pub output: Tree,
}

/// Encode a (possibly failed) call output for an entry. Replay reproduces
/// failures by re-executing the same deterministic path, so the encoding
/// only needs to be recognizable, not revivable.
pub fn output_tree(result: &Result<snapshot::Live, String>, ext: &dyn snapshot::Externalizer) -> Tree {
    match result {
        Ok(value) => snapshot::freeze(value, ext),
        Err(message) => Tree::List(vec![Tree::str("failure"), Tree::str(message.clone())]),
    }
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap()
}
