//! The document-store capability and its revision-tracking client.
//!
//! [`Driver`] is what an external store must provide; [`Connection`] is
//! what the agency core programs against. The connection remembers every
//! revision it has observed so that incoming change notifications can be
//! classified as *own* (caused by this connection) or *foreign*.

use std::sync::Arc;

mod connection;
mod emu;

pub use connection::{AnalyzedSink, Connection, DEFAULT_REVISION_CAPACITY};
pub use emu::Database;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("document {0:?} not found")]
    NotFound(String),
    #[error("revision conflict on document {0:?}")]
    Conflict(String),
    #[error("connection to the document store was lost")]
    ConnectionLost,
    #[error("malformed revision {0:?}")]
    MalformedRevision(String),
    #[error("document {0:?} carries no revision")]
    MissingRevision(String),
    #[error("document is not a JSON object")]
    InvalidDocument,
    #[error("failed to serialize document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A persistable document. The revision is assigned by the store and
/// adopted from its responses.
pub trait Document: serde::Serialize + serde::de::DeserializeOwned {
    fn doc_id(&self) -> &str;
    fn rev(&self) -> Option<&str>;
    fn set_rev(&mut self, rev: String);
}

impl Document for models::Descriptor {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }
    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }
    fn set_rev(&mut self, rev: String) {
        self.rev = Some(rev);
    }
}

/// `{id, rev}` as returned by store writes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DocRef {
    pub id: String,
    pub rev: String,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(pub String);

impl ListenerId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Raw change notification: `(doc_id, rev, deleted)`.
pub type ChangeSink = Arc<dyn Fn(&str, &str, bool) + Send + Sync>;

/// A view over the document set, in the map/reduce style of document
/// stores. `parse` turns a raw `(key, value)` row into the caller's value.
pub trait ViewFactory: Send + Sync {
    fn name(&self) -> &str;

    fn map(&self, document: &serde_json::Value) -> Vec<(serde_json::Value, serde_json::Value)>;

    fn use_reduce(&self) -> bool {
        false
    }

    fn reduce(&self, _values: &[serde_json::Value]) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn parse(
        &self,
        _key: serde_json::Value,
        value: serde_json::Value,
        _reduced: bool,
    ) -> serde_json::Value {
        value
    }
}

#[derive(Clone, Default, Debug)]
pub struct ViewOptions {
    /// Whether to apply the view's reduce step, when it has one.
    pub reduce: Option<bool>,
}

/// The wire capability an external document store must provide.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    async fn create_db(&self) -> Result<(), Error>;

    async fn save_doc(&self, serialized: serde_json::Value, doc_id: &str) -> Result<DocRef, Error>;

    async fn open_doc(&self, doc_id: &str) -> Result<serde_json::Value, Error>;

    async fn delete_doc(&self, doc_id: &str, rev: &str) -> Result<DocRef, Error>;

    async fn listen_changes(
        &self,
        doc_ids: &[String],
        callback: ChangeSink,
    ) -> Result<ListenerId, Error>;

    fn cancel_listener(&self, listener_id: &ListenerId);

    async fn query_view(
        &self,
        factory: &dyn ViewFactory,
        options: &ViewOptions,
    ) -> Result<Vec<(serde_json::Value, serde_json::Value)>, Error>;
}

/// Split a `"<index>-<hash>"` revision into its parts. Both must be
/// present and the index must be numeric.
pub fn parse_doc_revision(rev: &str) -> Result<(u64, String), Error> {
    let malformed = || Error::MalformedRevision(rev.to_string());
    let (index, hash) = rev.split_once('-').ok_or_else(malformed)?;
    if index.is_empty() || hash.is_empty() {
        return Err(malformed());
    }
    let index: u64 = index.parse().map_err(|_| malformed())?;
    Ok((index, hash.to_string()))
}

#[cfg(test)]
mod test {
    use super::parse_doc_revision;

    #[test]
    fn revision_parsing() {
        assert_eq!(parse_doc_revision("3-abc").unwrap(), (3, "abc".to_string()));
        // Hashes may themselves contain dashes; only the first one splits.
        assert_eq!(
            parse_doc_revision("1-a-b").unwrap(),
            (1, "a-b".to_string())
        );

        for malformed in ["", "3", "3-", "-abc", "x-abc"] {
            assert!(parse_doc_revision(malformed).is_err(), "{malformed:?}");
        }
    }
}
