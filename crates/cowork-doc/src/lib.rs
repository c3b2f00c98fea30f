//! # cowork-doc
//!
//! The seam between the orchestrator and the replication engine.
//!
//! - [`TaskDocumentHandle`]: snapshot, transactional change, change feed
//! - [`EphemeralChannel`]: keyed pub/sub namespaces that are never persisted
//! - [`DocumentId`]: deterministic `(kind, task, schema epoch)` naming
//! - [`DocumentProvider`]: opens handles by id
//! - [`MemoryDocument`] / [`MemoryDocumentStore`]: in-process engine used by the
//!   CLI and tests, with `apply_remote_*` helpers that play the remote peer
//!
//! Every update is tagged with an [`Origin`] so consumers can ignore their own
//! writes.

#![deny(unsafe_code)]

pub mod errors;
pub mod handle;
pub mod id;
pub mod memory;

pub use errors::DocumentError;
pub use handle::{
    DocumentChange, DocumentProvider, EphemeralChannel, EphemeralEntry, EphemeralUpdate, Origin,
    TaskDocumentExt, TaskDocumentHandle,
};
pub use id::{DocumentId, DocumentKind};
pub use memory::{MemoryDocument, MemoryDocumentStore, MemoryEphemeral};
