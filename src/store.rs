//! Document store access.
//!
//! Workers never share a session: each one checks out its own through
//! [`DocumentStore::session`] and keeps it until it exits. Dropping the
//! session returns it to the store, so release happens on every exit path.
//!
//! [`MemoryStore`] is the in-process implementation used by the CLI and the
//! tests. It evaluates [`Pipeline`]s on the blocking thread pool and can be
//! loaded from or saved to a JSON snapshot of the form
//! `{"collection": [doc, ...]}`. A database driver plugs in by implementing
//! [`DocumentStore`] and [`Session`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::aggregate::{Document, Filter, Pipeline};
use crate::error::StoreError;

/// Field changes applied by an upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Document,
    push: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a top-level field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Appends to a top-level array field, creating it when missing.
    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((field.into(), value.into()));
        self
    }

    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
        for (field, value) in &self.push {
            match doc.get_mut(field) {
                Some(Value::Array(items)) => items.push(value.clone()),
                _ => {
                    doc.insert(field.clone(), Value::Array(vec![value.clone()]));
                }
            }
        }
    }
}

/// Index definition requested when a collection is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// An exclusive connection to the store, owned by one worker.
#[async_trait]
pub trait Session: Send {
    /// Runs `pipeline` and returns the first output document, if any.
    async fn aggregate_one(
        &mut self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> Result<Option<Document>, StoreError>;

    /// Updates the first document matching `selector`, or inserts one seeded
    /// from the selector's equality fields.
    async fn upsert(
        &mut self,
        collection: &str,
        selector: &Filter,
        update: &Update,
    ) -> Result<(), StoreError>;

    /// Creates the collection with `indexes`. Returns `false` if it already
    /// existed, in which case nothing changes.
    async fn ensure_collection(
        &mut self,
        name: &str,
        indexes: &[IndexSpec],
    ) -> Result<bool, StoreError>;
}

/// Source of per-worker sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    type Session: Session + 'static;

    async fn session(&self) -> Result<Self::Session, StoreError>;
}

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: RwLock<HashMap<String, Collection>>,
    session_limit: Option<Arc<Semaphore>>,
    open_sessions: AtomicUsize,
    sessions_opened: AtomicU64,
    pending_failures: AtomicUsize,
    latency_ms: AtomicU64,
}

/// In-process document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of concurrently checked-out sessions.
    pub fn with_max_sessions(max: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                session_limit: Some(Arc::new(Semaphore::new(max))),
                ..Default::default()
            }),
        }
    }

    /// Loads a JSON snapshot.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let snapshot_err = |reason: String| StoreError::Snapshot {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| snapshot_err(e.to_string()))?;
        let snapshot: HashMap<String, Vec<Document>> =
            serde_json::from_str(&content).map_err(|e| snapshot_err(e.to_string()))?;

        let store = Self::new();
        for (name, docs) in snapshot {
            store.insert_many(&name, docs);
        }
        debug!("Loaded snapshot {} ({} collections)", path.display(), store.collection_names().len());
        Ok(store)
    }

    /// Writes every collection to a JSON snapshot.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot: HashMap<String, Vec<Document>> = self
            .inner
            .collections
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.docs.clone()))
            .collect();
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, content).map_err(|e| StoreError::Snapshot {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Inserts documents, assigning an `_id` to any that lack one.
    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut collections = self.inner.collections.write();
        let target = collections.entry(collection.to_string()).or_default();
        for mut doc in docs {
            doc.entry("_id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            target.docs.push(doc);
        }
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .collections
            .read()
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.inner
            .collections
            .read()
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Sessions currently checked out.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions checked out since the store was created.
    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Makes the next `count` aggregations fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Delays every aggregation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.inner
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    type Session = MemorySession;

    async fn session(&self) -> Result<MemorySession, StoreError> {
        let permit = match &self.inner.session_limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| StoreError::SessionUnavailable(e.to_string()))?,
            ),
            None => None,
        };
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        trace!("Session checked out ({} open)", self.open_sessions());
        Ok(MemorySession {
            store: self.clone(),
            _permit: permit,
        })
    }
}

/// Session over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn aggregate_one(
        &mut self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> Result<Option<Document>, StoreError> {
        let latency = self.store.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.store.take_failure() {
            return Err(StoreError::QueryFailed {
                collection: collection.to_string(),
                reason: "injected failure".into(),
            });
        }

        // CPU-bound: evaluated on the blocking pool so the caller's timeout
        // can abandon the wait.
        let store = self.store.clone();
        let name = collection.to_string();
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || {
            let collections = store.inner.collections.read();
            let first = collections
                .get(&name)
                .and_then(|c| pipeline.run_over(&c.docs).into_iter().next());
            first
        })
        .await
        .map_err(|e| StoreError::QueryFailed {
            collection: collection.to_string(),
            reason: e.to_string(),
        })
    }

    async fn upsert(
        &mut self,
        collection: &str,
        selector: &Filter,
        update: &Update,
    ) -> Result<(), StoreError> {
        let mut collections = self.store.inner.collections.write();
        let target = collections.entry(collection.to_string()).or_default();

        match target.docs.iter_mut().find(|d| selector.matches(d)) {
            Some(existing) => update.apply(existing),
            None => {
                let mut doc = selector.equality_fields();
                doc.insert("_id".into(), Value::String(Uuid::new_v4().to_string()));
                update.apply(&mut doc);
                target.docs.push(doc);
            }
        }
        Ok(())
    }

    async fn ensure_collection(
        &mut self,
        name: &str,
        indexes: &[IndexSpec],
    ) -> Result<bool, StoreError> {
        let mut collections = self.store.inner.collections.write();
        if collections.contains_key(name) {
            return Ok(false);
        }
        collections.insert(
            name.to_string(),
            Collection {
                docs: Vec::new(),
                indexes: indexes.to_vec(),
            },
        );
        Ok(true)
    }
}
