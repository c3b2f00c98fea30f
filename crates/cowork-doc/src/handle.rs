//! Handle traits implemented by a replication engine.

use std::sync::Arc;

use async_trait::async_trait;
use cowork_core::{PermissionRequest, PermissionResponse, TaskDocument};
use tokio::sync::broadcast;

use crate::errors::DocumentError;
use crate::id::DocumentId;

/// Where an update came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Written through this handle.
    Local,
    /// Received from another peer.
    Remote,
}

/// Notification that the document changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocumentChange {
    /// Who made the change.
    pub origin: Origin,
}

/// A value currently held by an ephemeral channel.
#[derive(Clone, Debug, PartialEq)]
pub struct EphemeralEntry<V> {
    /// The value.
    pub value: V,
    /// Who wrote it.
    pub origin: Origin,
}

/// A set or delete on an ephemeral channel.
#[derive(Clone, Debug, PartialEq)]
pub struct EphemeralUpdate<V> {
    /// Key written.
    pub key: String,
    /// New value; `None` for a delete.
    pub value: Option<V>,
    /// Who wrote it.
    pub origin: Origin,
}

/// A keyed pub/sub namespace that is never persisted.
pub trait EphemeralChannel<V>: Send + Sync {
    /// Publish `value` under `key` as a local write.
    fn set(&self, key: &str, value: V);

    /// Remove `key` as a local write. No-op when absent.
    fn delete(&self, key: &str);

    /// Current entry for `key`.
    fn get(&self, key: &str) -> Option<EphemeralEntry<V>>;

    /// All current entries.
    fn get_all(&self) -> Vec<(String, EphemeralEntry<V>)>;

    /// Subscribe to future updates.
    fn subscribe(&self) -> broadcast::Receiver<EphemeralUpdate<V>>;
}

/// A live handle to one replicated task document.
pub trait TaskDocumentHandle: Send + Sync {
    /// Which document this is.
    fn document_id(&self) -> &DocumentId;

    /// Current state.
    fn snapshot(&self) -> TaskDocument;

    /// Apply `mutator` as one local transaction.
    fn change(&self, mutator: &mut dyn FnMut(&mut TaskDocument)) -> Result<(), DocumentError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;

    /// Pending permission requests, keyed by tool-invocation id.
    fn permission_requests(&self) -> &dyn EphemeralChannel<PermissionRequest>;

    /// Permission decisions, keyed by tool-invocation id.
    fn permission_responses(&self) -> &dyn EphemeralChannel<PermissionResponse>;
}

/// Convenience over [`TaskDocumentHandle::change`] for closures returning a value.
pub trait TaskDocumentExt {
    /// Run `f` inside a transaction and return its result.
    fn update<R>(&self, f: impl FnOnce(&mut TaskDocument) -> R) -> Result<R, DocumentError>;
}

impl<T: TaskDocumentHandle + ?Sized> TaskDocumentExt for T {
    fn update<R>(&self, f: impl FnOnce(&mut TaskDocument) -> R) -> Result<R, DocumentError> {
        let mut f = Some(f);
        let mut out = None;
        self.change(&mut |doc| {
            if let Some(f) = f.take() {
                out = Some(f(doc));
            }
        })?;
        out.ok_or_else(|| DocumentError::Closed(self.document_id().to_string()))
    }
}

/// Opens document handles by id.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Open (or create) the document.
    async fn open(&self, id: &DocumentId) -> Result<Arc<dyn TaskDocumentHandle>, DocumentError>;
}
