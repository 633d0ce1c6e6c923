use crate::{
    parse_doc_revision, ChangeSink, DocRef, Document, Driver, Error, ListenerId, ViewFactory,
    ViewOptions,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// Analyzed change notification: `(doc_id, rev, deleted, own_change)`.
pub type AnalyzedSink = Arc<dyn Fn(&str, &str, bool, bool) + Send + Sync>;

pub const DEFAULT_REVISION_CAPACITY: usize = 1024;

/// The agency-facing client of a document store.
///
/// Every save/get/delete records the revision it observed in a bounded
/// (LRU by last access) store, which the change-feed wrapper consults to
/// tell the connection's own writes apart from foreign ones.
pub struct Connection {
    self_ref: Weak<Connection>,
    driver: Arc<dyn Driver>,
    known: Mutex<RevisionStore>,
    // listener id -> doc ids it covers
    listeners: Mutex<HashMap<ListenerId, Vec<String>>>,
}

impl Connection {
    pub fn new(driver: Arc<dyn Driver>) -> Arc<Self> {
        Self::with_capacity(driver, DEFAULT_REVISION_CAPACITY)
    }

    pub fn with_capacity(driver: Arc<dyn Driver>, revision_capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            driver,
            known: Mutex::new(RevisionStore::new(revision_capacity)),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    pub async fn create_database(&self) -> Result<(), Error> {
        self.driver.create_db().await
    }

    pub async fn save_document<D: Document>(&self, doc: &mut D) -> Result<(), Error> {
        let serialized = serde_json::to_value(&*doc)?;
        let DocRef { id, rev } = self.driver.save_doc(serialized, doc.doc_id()).await?;
        doc.set_rev(rev.clone());
        self.notice_revision(&id, &rev);
        Ok(())
    }

    pub async fn get_document<D: Document>(&self, doc_id: &str) -> Result<D, Error> {
        let serialized = self.driver.open_doc(doc_id).await?;
        let doc: D = serde_json::from_value(serialized)?;
        let rev = doc
            .rev()
            .ok_or_else(|| Error::MissingRevision(doc_id.to_string()))?;
        self.notice_revision(doc.doc_id(), rev);
        Ok(doc)
    }

    /// Fetch the latest revision of a document already held by the caller.
    pub async fn reload_document<D: Document>(&self, doc: &D) -> Result<D, Error> {
        self.get_document(doc.doc_id()).await
    }

    pub async fn delete_document<D: Document>(&self, doc: &mut D) -> Result<(), Error> {
        let rev = doc
            .rev()
            .ok_or_else(|| Error::MissingRevision(doc.doc_id().to_string()))?;
        let DocRef { id, rev } = self.driver.delete_doc(doc.doc_id(), rev).await?;
        doc.set_rev(rev.clone());
        self.notice_revision(&id, &rev);
        Ok(())
    }

    /// Subscribe to changes of `doc_ids`. The callback additionally
    /// receives the own-change classification.
    pub async fn changes_listener(
        &self,
        doc_ids: &[String],
        callback: AnalyzedSink,
    ) -> Result<ListenerId, Error> {
        let analytic = RevisionAnalytic {
            connection: self.self_ref.clone(),
            callback,
        };
        let wrapped: ChangeSink = Arc::new(move |doc_id: &str, rev: &str, deleted: bool| {
            analytic.on_change(doc_id, rev, deleted);
        });

        let listener_id = self.driver.listen_changes(doc_ids, wrapped).await?;
        lock(&self.listeners).insert(listener_id.clone(), doc_ids.to_vec());
        Ok(listener_id)
    }

    /// Cancel every subscription covering `doc_id`.
    pub fn cancel_listener(&self, doc_id: &str) {
        let covering: Vec<ListenerId> = lock(&self.listeners)
            .iter()
            .filter(|(_, doc_ids)| doc_ids.iter().any(|covered| covered == doc_id))
            .map(|(listener_id, _)| listener_id.clone())
            .collect();
        for listener_id in covering {
            self.cancel(&listener_id);
        }
    }

    pub fn disconnect(&self) {
        let all: Vec<ListenerId> = lock(&self.listeners).keys().cloned().collect();
        for listener_id in all {
            self.cancel(&listener_id);
        }
    }

    pub async fn query_view(
        &self,
        factory: &dyn ViewFactory,
        options: &ViewOptions,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let rows = self.driver.query_view(factory, options).await?;
        let reduced = factory.use_reduce() && options.reduce.unwrap_or(true);
        Ok(rows
            .into_iter()
            .map(|(key, value)| factory.parse(key, value, reduced))
            .collect())
    }

    /// Classify an incoming change notification. Own iff the revision is
    /// already known: the stored index is greater (stale notification), or
    /// index and hash both match.
    pub fn is_own_change(&self, doc_id: &str, rev: &str) -> bool {
        let Some((known_index, known_hash)) = lock(&self.known).get(doc_id) else {
            return false;
        };
        match parse_doc_revision(rev) {
            Ok((index, hash)) => {
                known_index > index || (known_index == index && known_hash == hash)
            }
            Err(err) => {
                tracing::warn!(doc_id, rev, %err, "unparseable revision in change feed");
                false
            }
        }
    }

    /// The most recent `(index, hash)` observed for a document, if still
    /// retained.
    pub fn known_revision(&self, doc_id: &str) -> Option<(u64, String)> {
        lock(&self.known).peek(doc_id)
    }

    fn cancel(&self, listener_id: &ListenerId) {
        self.driver.cancel_listener(listener_id);
        if lock(&self.listeners).remove(listener_id).is_none() {
            tracing::warn!(?listener_id, "cancelled a listener that was not registered");
        }
    }

    fn notice_revision(&self, doc_id: &str, rev: &str) {
        tracing::debug!(doc_id, rev, "observed document revision");
        match parse_doc_revision(rev) {
            Ok((index, hash)) => lock(&self.known).update(doc_id, index, hash),
            Err(err) => tracing::warn!(doc_id, rev, %err, "store returned malformed revision"),
        }
    }
}

/// Wraps a change callback and stamps each notification with the
/// own-change flag derived from the connection's known revisions.
struct RevisionAnalytic {
    connection: Weak<Connection>,
    callback: AnalyzedSink,
}

impl RevisionAnalytic {
    fn on_change(&self, doc_id: &str, rev: &str, deleted: bool) {
        let own_change = match self.connection.upgrade() {
            Some(connection) => connection.is_own_change(doc_id, rev),
            None => return,
        };
        tracing::debug!(doc_id, rev, deleted, own_change, "change notification");
        (self.callback)(doc_id, rev, deleted, own_change);
    }
}

/// Known revisions with LRU-by-last-access retention. Within retention an
/// entry's index never regresses: it is replaced only by a strictly
/// greater index, or refreshed by the identical `(index, hash)`.
struct RevisionStore {
    capacity: usize,
    entries: HashMap<String, RevEntry>,
    by_tick: BTreeMap<u64, String>,
    tick: u64,
}

struct RevEntry {
    index: u64,
    hash: String,
    tick: u64,
}

impl RevisionStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            by_tick: BTreeMap::new(),
            tick: 0,
        }
    }

    fn update(&mut self, doc_id: &str, index: u64, hash: String) {
        let tick = self.next_tick();
        match self.entries.get_mut(doc_id) {
            Some(entry) => {
                let replace = index > entry.index || (index == entry.index && hash == entry.hash);
                if !replace {
                    tracing::debug!(
                        doc_id,
                        known = entry.index,
                        incoming = index,
                        "ignoring regressing revision"
                    );
                    return;
                }
                self.by_tick.remove(&entry.tick);
                self.by_tick.insert(tick, doc_id.to_string());
                entry.index = index;
                entry.hash = hash;
                entry.tick = tick;
            }
            None => {
                self.entries
                    .insert(doc_id.to_string(), RevEntry { index, hash, tick });
                self.by_tick.insert(tick, doc_id.to_string());
                self.evict();
            }
        }
    }

    fn get(&mut self, doc_id: &str) -> Option<(u64, String)> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(doc_id)?;
        self.by_tick.remove(&entry.tick);
        self.by_tick.insert(tick, doc_id.to_string());
        entry.tick = tick;
        Some((entry.index, entry.hash.clone()))
    }

    fn peek(&self, doc_id: &str) -> Option<(u64, String)> {
        let entry = self.entries.get(doc_id)?;
        Some((entry.index, entry.hash.clone()))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((&oldest, _)) = self.by_tick.iter().next() else {
                return;
            };
            if let Some(doc_id) = self.by_tick.remove(&oldest) {
                self.entries.remove(&doc_id);
                tracing::debug!(doc_id, "evicted least recently used revision");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> RevisionStore {
        RevisionStore::new(4)
    }

    #[test]
    fn revisions_never_regress() {
        let mut known = store();
        known.update("d", 5, "h".to_string());
        known.update("d", 4, "x".to_string());
        assert_eq!(known.peek("d"), Some((5, "h".to_string())));

        // Identical (index, hash) is an idempotent refresh.
        known.update("d", 5, "h".to_string());
        assert_eq!(known.peek("d"), Some((5, "h".to_string())));

        // Same index with a different hash is not adopted.
        known.update("d", 5, "z".to_string());
        assert_eq!(known.peek("d"), Some((5, "h".to_string())));

        known.update("d", 6, "q".to_string());
        assert_eq!(known.peek("d"), Some((6, "q".to_string())));
    }

    #[test]
    fn least_recently_used_entries_are_evicted() {
        let mut known = RevisionStore::new(2);
        known.update("a", 1, "a".to_string());
        known.update("b", 1, "b".to_string());

        // Touch "a" so "b" is the eviction candidate.
        assert!(known.get("a").is_some());
        known.update("c", 1, "c".to_string());

        assert!(known.peek("a").is_some());
        assert!(known.peek("b").is_none());
        assert!(known.peek("c").is_some());
    }
}
