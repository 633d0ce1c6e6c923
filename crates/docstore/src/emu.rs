use crate::{ChangeSink, DocRef, Driver, Error, ListenerId, ViewFactory, ViewOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use xxhash_rust::xxh3::xxh3_64;

/// The in-memory emulation document store.
///
/// Revisions follow the `"<index>-<hash>"` convention of document stores:
/// the index counts writes, the hash digests the written content. Change
/// notifications are deferred to the executor so that the write that caused
/// them returns (and its revision is noticed) first.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    docs: HashMap<String, StoredDoc>,
    listeners: HashMap<ListenerId, ListenerEntry>,
}

struct StoredDoc {
    body: serde_json::Value,
    index: u64,
    hash: String,
    deleted: bool,
}

impl StoredDoc {
    fn rev(&self) -> String {
        format!("{}-{}", self.index, self.hash)
    }
}

struct ListenerEntry {
    doc_ids: Vec<String>,
    callback: ChangeSink,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live (non-deleted) documents.
    pub fn doc_count(&self) -> usize {
        lock(&self.inner.state)
            .docs
            .values()
            .filter(|doc| !doc.deleted)
            .count()
    }

    fn trigger_change(state: &State, doc_id: &str, rev: &str, deleted: bool) {
        for entry in state.listeners.values() {
            if !entry.doc_ids.iter().any(|covered| covered == doc_id) {
                continue;
            }
            let callback = entry.callback.clone();
            let (doc_id, rev) = (doc_id.to_string(), rev.to_string());
            tokio::spawn(async move {
                callback(&doc_id, &rev, deleted);
            });
        }
    }
}

fn content_hash(doc_id: &str, index: u64, body: &serde_json::Value) -> String {
    let rendered = body.to_string();
    format!("{:016x}", xxh3_64(format!("{doc_id}/{index}/{rendered}").as_bytes()))
}

#[async_trait::async_trait]
impl Driver for Database {
    async fn create_db(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn save_doc(&self, serialized: serde_json::Value, doc_id: &str) -> Result<DocRef, Error> {
        let serde_json::Value::Object(mut fields) = serialized else {
            return Err(Error::InvalidDocument);
        };
        let incoming_rev = fields
            .get("rev")
            .and_then(|rev| rev.as_str())
            .map(str::to_string);

        let mut state = lock(&self.inner.state);
        let index = match state.docs.get(doc_id) {
            Some(existing) if !existing.deleted => {
                if incoming_rev.as_deref() != Some(existing.rev().as_str()) {
                    return Err(Error::Conflict(doc_id.to_string()));
                }
                existing.index + 1
            }
            // Re-creating a deleted document continues its revision line.
            Some(tombstone) => tombstone.index + 1,
            None => {
                if incoming_rev.is_some() {
                    return Err(Error::Conflict(doc_id.to_string()));
                }
                1
            }
        };

        fields.remove("rev");
        let body = serde_json::Value::Object(fields);
        let hash = content_hash(doc_id, index, &body);

        let stored = StoredDoc {
            body,
            index,
            hash,
            deleted: false,
        };
        let rev = stored.rev();
        state.docs.insert(doc_id.to_string(), stored);
        Self::trigger_change(&state, doc_id, &rev, false);

        Ok(DocRef {
            id: doc_id.to_string(),
            rev,
        })
    }

    async fn open_doc(&self, doc_id: &str) -> Result<serde_json::Value, Error> {
        let state = lock(&self.inner.state);
        let doc = state
            .docs
            .get(doc_id)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))?;

        let serde_json::Value::Object(mut fields) = doc.body.clone() else {
            return Err(Error::InvalidDocument);
        };
        fields.insert("rev".to_string(), serde_json::Value::String(doc.rev()));
        Ok(serde_json::Value::Object(fields))
    }

    async fn delete_doc(&self, doc_id: &str, rev: &str) -> Result<DocRef, Error> {
        let mut state = lock(&self.inner.state);
        let doc = state
            .docs
            .get_mut(doc_id)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))?;
        if doc.rev() != rev {
            return Err(Error::Conflict(doc_id.to_string()));
        }

        doc.index += 1;
        doc.hash = content_hash(doc_id, doc.index, &serde_json::Value::Null);
        doc.deleted = true;
        doc.body = serde_json::Value::Null;
        let tombstone_rev = doc.rev();
        Self::trigger_change(&state, doc_id, &tombstone_rev, true);

        Ok(DocRef {
            id: doc_id.to_string(),
            rev: tombstone_rev,
        })
    }

    async fn listen_changes(
        &self,
        doc_ids: &[String],
        callback: ChangeSink,
    ) -> Result<ListenerId, Error> {
        let listener_id = ListenerId::generate();
        tracing::debug!(?listener_id, ?doc_ids, "registering change listener");
        lock(&self.inner.state).listeners.insert(
            listener_id.clone(),
            ListenerEntry {
                doc_ids: doc_ids.to_vec(),
                callback,
            },
        );
        Ok(listener_id)
    }

    fn cancel_listener(&self, listener_id: &ListenerId) {
        lock(&self.inner.state).listeners.remove(listener_id);
    }

    async fn query_view(
        &self,
        factory: &dyn ViewFactory,
        options: &ViewOptions,
    ) -> Result<Vec<(serde_json::Value, serde_json::Value)>, Error> {
        let state = lock(&self.inner.state);
        let mut rows: Vec<(serde_json::Value, serde_json::Value)> = Vec::new();
        for doc in state.docs.values().filter(|doc| !doc.deleted) {
            let serde_json::Value::Object(mut fields) = doc.body.clone() else {
                continue;
            };
            fields.insert("rev".to_string(), serde_json::Value::String(doc.rev()));
            rows.extend(factory.map(&serde_json::Value::Object(fields)));
        }
        // Stores return view rows in key order, document id breaking ties.
        rows.sort_by_key(|(key, value)| (key.to_string(), value.to_string()));

        if factory.use_reduce() && options.reduce.unwrap_or(true) {
            let values: Vec<serde_json::Value> =
                rows.into_iter().map(|(_, value)| value).collect();
            return Ok(vec![(serde_json::Value::Null, factory.reduce(&values))]);
        }
        Ok(rows)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}
