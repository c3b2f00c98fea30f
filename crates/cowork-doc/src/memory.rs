//! In-process document engine.
//!
//! Holds the whole document behind a lock and fans out notifications on
//! broadcast channels. There is no merge: the `apply_remote_*` helpers write
//! directly and tag the update [`Origin::Remote`], which is enough to exercise
//! every local-vs-remote code path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cowork_core::{PermissionRequest, PermissionResponse, TaskDocument};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

use crate::errors::DocumentError;
use crate::handle::{
    DocumentChange, DocumentProvider, EphemeralChannel, EphemeralEntry, EphemeralUpdate, Origin,
    TaskDocumentHandle,
};
use crate::id::DocumentId;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory [`EphemeralChannel`].
pub struct MemoryEphemeral<V> {
    entries: Mutex<HashMap<String, EphemeralEntry<V>>>,
    tx: broadcast::Sender<EphemeralUpdate<V>>,
}

impl<V: Clone + Send + Sync + 'static> MemoryEphemeral<V> {
    /// Empty channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Write as if a remote peer published `value`.
    pub fn apply_remote_set(&self, key: &str, value: V) {
        self.write(key, Some(value), Origin::Remote);
    }

    /// Delete as if a remote peer removed `key`.
    pub fn apply_remote_delete(&self, key: &str) {
        self.write(key, None, Origin::Remote);
    }

    fn write(&self, key: &str, value: Option<V>, origin: Origin) {
        let changed = {
            let mut entries = self.entries.lock();
            match &value {
                Some(v) => {
                    let _ = entries.insert(
                        key.to_owned(),
                        EphemeralEntry {
                            value: v.clone(),
                            origin,
                        },
                    );
                    true
                }
                None => entries.remove(key).is_some(),
            }
        };
        if changed {
            // No receivers is fine.
            let _ = self.tx.send(EphemeralUpdate {
                key: key.to_owned(),
                value,
                origin,
            });
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MemoryEphemeral<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> EphemeralChannel<V> for MemoryEphemeral<V> {
    fn set(&self, key: &str, value: V) {
        self.write(key, Some(value), Origin::Local);
    }

    fn delete(&self, key: &str) {
        self.write(key, None, Origin::Local);
    }

    fn get(&self, key: &str) -> Option<EphemeralEntry<V>> {
        self.entries.lock().get(key).cloned()
    }

    fn get_all(&self) -> Vec<(String, EphemeralEntry<V>)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<EphemeralUpdate<V>> {
        self.tx.subscribe()
    }
}

/// In-memory [`TaskDocumentHandle`].
pub struct MemoryDocument {
    id: DocumentId,
    state: RwLock<TaskDocument>,
    changes: broadcast::Sender<DocumentChange>,
    requests: MemoryEphemeral<PermissionRequest>,
    responses: MemoryEphemeral<PermissionResponse>,
    closed: AtomicBool,
}

impl MemoryDocument {
    /// A fresh document for the task named by `id`.
    #[must_use]
    pub fn new(id: DocumentId) -> Self {
        let doc = TaskDocument::new(id.task_id.clone());
        Self::with_state(id, doc)
    }

    /// A document seeded with `state`.
    #[must_use]
    pub fn with_state(id: DocumentId, state: TaskDocument) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            id,
            state: RwLock::new(state),
            changes,
            requests: MemoryEphemeral::new(),
            responses: MemoryEphemeral::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Apply a change as if it arrived from a remote peer.
    pub fn apply_remote(&self, mutator: impl FnOnce(&mut TaskDocument)) -> Result<(), DocumentError> {
        self.ensure_open()?;
        {
            let mut state = self.state.write();
            mutator(&mut *state);
        }
        self.notify(Origin::Remote);
        Ok(())
    }

    /// Concrete request channel, for remote-side helpers.
    #[must_use]
    pub fn requests(&self) -> &MemoryEphemeral<PermissionRequest> {
        &self.requests
    }

    /// Concrete response channel, for remote-side helpers.
    #[must_use]
    pub fn responses(&self) -> &MemoryEphemeral<PermissionResponse> {
        &self.responses
    }

    /// Stop accepting changes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), DocumentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DocumentError::Closed(self.id.to_string()));
        }
        Ok(())
    }

    fn notify(&self, origin: Origin) {
        trace!(document = %self.id, ?origin, "document changed");
        let _ = self.changes.send(DocumentChange { origin });
    }
}

impl TaskDocumentHandle for MemoryDocument {
    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn snapshot(&self) -> TaskDocument {
        self.state.read().clone()
    }

    fn change(&self, mutator: &mut dyn FnMut(&mut TaskDocument)) -> Result<(), DocumentError> {
        self.ensure_open()?;
        {
            let mut state = self.state.write();
            mutator(&mut *state);
        }
        self.notify(Origin::Local);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    fn permission_requests(&self) -> &dyn EphemeralChannel<PermissionRequest> {
        &self.requests
    }

    fn permission_responses(&self) -> &dyn EphemeralChannel<PermissionResponse> {
        &self.responses
    }
}

/// [`DocumentProvider`] that keeps one [`MemoryDocument`] per id.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: DashMap<String, Arc<MemoryDocument>>,
}

impl MemoryDocumentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) and return the concrete document.
    pub fn open_memory(&self, id: &DocumentId) -> Arc<MemoryDocument> {
        self.docs
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MemoryDocument::new(id.clone())))
            .value()
            .clone()
    }
}

#[async_trait]
impl DocumentProvider for MemoryDocumentStore {
    async fn open(&self, id: &DocumentId) -> Result<Arc<dyn TaskDocumentHandle>, DocumentError> {
        let doc: Arc<dyn TaskDocumentHandle> = self.open_memory(id);
        Ok(doc)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
