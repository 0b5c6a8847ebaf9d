//! Ticket content store and replica sync
//!
//! Documents live at `tickets/<id>.md` inside a git repository. A replica
//! is either the origin itself (bare repository) or a working clone of
//! it; which one is decided explicitly when the replica is opened.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;

mod clone;
pub mod git;
mod origin;

pub use clone::ClonedReplica;
pub use git::Signature;
pub use origin::OriginReplica;

pub(crate) const TICKETS_DIR: &str = "tickets";
const DOC_EXT: &str = "md";

pub(crate) fn doc_rel_path(id: &str) -> String {
    format!("{}/{}.{}", TICKETS_DIR, id, DOC_EXT)
}

pub(crate) fn id_from_rel_path(path: &str) -> Option<&str> {
    path.strip_prefix(TICKETS_DIR)?
        .strip_prefix('/')?
        .strip_suffix(".md")
        .filter(|id| !id.contains('/'))
}

/// One commit in a document's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub commit: String,
    pub author: String,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// What a pull did to the local replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing to reconcile
    UpToDate,
    /// Local head moved from `from` to `to`
    Updated { from: String, to: String },
}

/// What a push published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Origin already had everything
    UpToDate,
    Published { head: String },
}

/// Role of a replica relative to the shared origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Origin,
    Clone,
}

/// Versioned, name-addressed document store
///
/// Knows nothing about ticket schema. Every write and delete is one
/// commit carrying `message`.
pub trait ContentStore {
    /// Document ids in the store's natural (lexicographic) order
    fn list(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Raw document content, `Error::NotFound` if absent
    fn read(&self, id: &str) -> impl Future<Output = Result<String>> + Send;

    fn write(&self, id: &str, content: &str, message: &str)
    -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, id: &str, message: &str) -> impl Future<Output = Result<()>> + Send;

    /// Commits touching the document, newest first
    fn history(&self, id: &str) -> impl Future<Output = Result<Vec<Revision>>> + Send;

    /// Where the document lives for this replica
    fn document_path(&self, id: &str) -> PathBuf;
}

/// A participant's copy of the content store
pub trait Replica: ContentStore {
    fn role(&self) -> ReplicaRole;

    /// Repository directory of this replica
    fn path(&self) -> &Path;

    /// Bring the replica up to date with the origin
    fn pull(&self) -> impl Future<Output = Result<PullOutcome>> + Send;

    /// Commit pending changes and publish them to the origin
    fn push(&self, message: &str) -> impl Future<Output = Result<PushOutcome>> + Send;

    /// Current head commit
    fn revision(&self) -> impl Future<Output = Result<String>> + Send;

    /// Write the document only if the head is still `base`
    ///
    /// Anything committed after `base` fails the write with
    /// `SyncConflict::OriginAdvanced`, so a document read at `base` can
    /// never overwrite a change it has not seen.
    fn write_from(
        &self,
        base: &str,
        id: &str,
        content: &str,
        message: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Discard everything after `revision` that has not been published
    fn rollback(&self, revision: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Either kind of replica, chosen from configuration
pub enum AnyReplica {
    Origin(OriginReplica),
    Clone(ClonedReplica),
}

impl ContentStore for AnyReplica {
    async fn list(&self) -> Result<Vec<String>> {
        match self {
            AnyReplica::Origin(r) => r.list().await,
            AnyReplica::Clone(r) => r.list().await,
        }
    }

    async fn read(&self, id: &str) -> Result<String> {
        match self {
            AnyReplica::Origin(r) => r.read(id).await,
            AnyReplica::Clone(r) => r.read(id).await,
        }
    }

    async fn write(&self, id: &str, content: &str, message: &str) -> Result<()> {
        match self {
            AnyReplica::Origin(r) => r.write(id, content, message).await,
            AnyReplica::Clone(r) => r.write(id, content, message).await,
        }
    }

    async fn delete(&self, id: &str, message: &str) -> Result<()> {
        match self {
            AnyReplica::Origin(r) => r.delete(id, message).await,
            AnyReplica::Clone(r) => r.delete(id, message).await,
        }
    }

    async fn history(&self, id: &str) -> Result<Vec<Revision>> {
        match self {
            AnyReplica::Origin(r) => r.history(id).await,
            AnyReplica::Clone(r) => r.history(id).await,
        }
    }

    fn document_path(&self, id: &str) -> PathBuf {
        match self {
            AnyReplica::Origin(r) => r.document_path(id),
            AnyReplica::Clone(r) => r.document_path(id),
        }
    }
}

impl Replica for AnyReplica {
    fn role(&self) -> ReplicaRole {
        match self {
            AnyReplica::Origin(r) => r.role(),
            AnyReplica::Clone(r) => r.role(),
        }
    }

    fn path(&self) -> &Path {
        match self {
            AnyReplica::Origin(r) => r.path(),
            AnyReplica::Clone(r) => r.path(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        match self {
            AnyReplica::Origin(r) => r.pull().await,
            AnyReplica::Clone(r) => r.pull().await,
        }
    }

    async fn push(&self, message: &str) -> Result<PushOutcome> {
        match self {
            AnyReplica::Origin(r) => r.push(message).await,
            AnyReplica::Clone(r) => r.push(message).await,
        }
    }

    async fn revision(&self) -> Result<String> {
        match self {
            AnyReplica::Origin(r) => r.revision().await,
            AnyReplica::Clone(r) => r.revision().await,
        }
    }

    async fn write_from(&self, base: &str, id: &str, content: &str, message: &str) -> Result<()> {
        match self {
            AnyReplica::Origin(r) => r.write_from(base, id, content, message).await,
            AnyReplica::Clone(r) => r.write_from(base, id, content, message).await,
        }
    }

    async fn rollback(&self, revision: &str) -> Result<()> {
        match self {
            AnyReplica::Origin(r) => r.rollback(revision).await,
            AnyReplica::Clone(r) => r.rollback(revision).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_paths() {
        assert_eq!(doc_rel_path("tix-ab12"), "tickets/tix-ab12.md");
        assert_eq!(id_from_rel_path("tickets/tix-ab12.md"), Some("tix-ab12"));
        assert_eq!(id_from_rel_path("tickets/sub/x.md"), None);
        assert_eq!(id_from_rel_path("README.md"), None);
    }
}
