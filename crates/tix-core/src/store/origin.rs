//! The origin replica: a bare repository that is the source of truth
//!
//! Writes never touch a working tree. A commit is built against a
//! private index and the branch is advanced with a compare-and-swap, so
//! a clone pushing at the same moment makes the write fail instead of
//! being silently overwritten.

use std::path::{Path, PathBuf};

use super::git::{self, Git, Signature};
use super::{
    ContentStore, PullOutcome, PushOutcome, Replica, ReplicaRole, Revision, TICKETS_DIR,
    doc_rel_path, id_from_rel_path,
};
use crate::error::SyncConflict;
use crate::{Error, Result};

pub struct OriginReplica {
    git: Git,
    branch: String,
}

impl OriginReplica {
    /// Open an existing bare origin
    pub async fn open(dir: impl Into<PathBuf>, branch: &str, signature: Signature) -> Result<Self> {
        let dir = dir.into();
        let git = Git::new(&dir, signature);
        let bare = if dir.exists() {
            git.run(&["rev-parse", "--is-bare-repository"]).await.ok()
        } else {
            None
        };
        if bare.as_deref() != Some("true") {
            return Err(Error::NotInitialized);
        }
        let replica = Self {
            git,
            branch: branch.to_string(),
        };
        if replica.git.resolve(&replica.branch_ref()).await?.is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(replica)
    }

    /// Create a new bare origin with an empty initial commit
    pub async fn init(dir: impl Into<PathBuf>, branch: &str, signature: Signature) -> Result<Self> {
        let dir = dir.into();
        if dir.join("HEAD").exists() {
            return Err(Error::AlreadyInitialized(dir));
        }
        let git = git::init_bare(&dir, branch, signature).await?;
        tracing::info!(path = %dir.display(), branch, "initialized origin ticket store");
        Ok(Self {
            git,
            branch: branch.to_string(),
        })
    }

    pub async fn open_or_init(
        dir: impl Into<PathBuf>,
        branch: &str,
        signature: Signature,
    ) -> Result<Self> {
        let dir = dir.into();
        if dir.join("HEAD").exists() {
            Self::open(dir, branch, signature).await
        } else {
            Self::init(dir, branch, signature).await
        }
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    async fn head(&self) -> Result<String> {
        self.git
            .resolve(&self.branch_ref())
            .await?
            .ok_or(Error::NotInitialized)
    }

    /// Build a commit on top of `parent` with one path changed, then
    /// advance the branch only if it still points at `parent`.
    async fn commit_change(
        &self,
        parent: &str,
        rel_path: &str,
        blob: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let index = self
            .git
            .dir()
            .join(format!("tix-index-{}", uuid::Uuid::new_v4()));
        let result = self
            .commit_with_index(&index, parent, rel_path, blob, message)
            .await;
        if let Err(e) = tokio::fs::remove_file(&index).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %index.display(), error = %e, "failed to remove scratch index");
        }
        let commit = result?;

        let branch = self.branch_ref();
        let output = self
            .git
            .output(&["update-ref", &branch, &commit, parent])
            .await?;
        if !output.status.success() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "origin ref moved during write"
            );
            return Err(SyncConflict::OriginAdvanced {
                branch: self.branch.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn commit_with_index(
        &self,
        index: &Path,
        parent: &str,
        rel_path: &str,
        blob: Option<&str>,
        message: &str,
    ) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index)];
        self.git.run_with(&["read-tree", parent], &env, None).await?;
        match blob {
            Some(blob) => {
                let info = format!("100644,{},{}", blob, rel_path);
                self.git
                    .run_with(&["update-index", "--add", "--cacheinfo", &info], &env, None)
                    .await?;
            }
            None => {
                self.git
                    .run_with(&["update-index", "--force-remove", rel_path], &env, None)
                    .await?;
            }
        }
        let tree = self.git.run_with(&["write-tree"], &env, None).await?;
        self.git
            .run(&["commit-tree", &tree, "-p", parent, "-m", message])
            .await
    }

    async fn put(&self, parent: &str, id: &str, content: &str, message: &str) -> Result<()> {
        let blob = self
            .git
            .run_with(&["hash-object", "-w", "--stdin"], &[], Some(content.as_bytes()))
            .await?;
        self.commit_change(parent, &doc_rel_path(id), Some(&blob), message)
            .await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let object = format!("{}:{}", self.branch_ref(), doc_rel_path(id));
        self.git.succeeds(&["cat-file", "-e", &object]).await
    }
}

impl ContentStore for OriginReplica {
    async fn list(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", TICKETS_DIR);
        let out = self
            .git
            .run(&["ls-tree", "--name-only", &self.branch_ref(), &prefix])
            .await?;
        let mut ids: Vec<String> = out
            .lines()
            .filter_map(id_from_rel_path)
            .map(String::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &str) -> Result<String> {
        if !self.exists(id).await? {
            return Err(Error::NotFound(id.to_string()));
        }
        let object = format!("{}:{}", self.branch_ref(), doc_rel_path(id));
        let output = self.git.output(&["cat-file", "blob", &object]).await?;
        if !output.status.success() {
            return Err(Error::NotFound(id.to_string()));
        }
        String::from_utf8(output.stdout).map_err(|e| Error::MalformedTicket {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn write(&self, id: &str, content: &str, message: &str) -> Result<()> {
        let parent = self.head().await?;
        self.put(&parent, id, content, message).await
    }

    async fn delete(&self, id: &str, message: &str) -> Result<()> {
        if !self.exists(id).await? {
            return Err(Error::NotFound(id.to_string()));
        }
        let parent = self.head().await?;
        self.commit_change(&parent, &doc_rel_path(id), None, message)
            .await
    }

    async fn history(&self, id: &str) -> Result<Vec<Revision>> {
        self.git.log(&self.branch_ref(), &doc_rel_path(id)).await
    }

    /// Bare repositories have no working tree; this is the path the
    /// document has inside the repository, readable with
    /// `git show <branch>:tickets/<id>.md`.
    fn document_path(&self, id: &str) -> PathBuf {
        self.git.dir().join(doc_rel_path(id))
    }
}

impl Replica for OriginReplica {
    fn role(&self) -> ReplicaRole {
        ReplicaRole::Origin
    }

    fn path(&self) -> &Path {
        self.git.dir()
    }

    async fn pull(&self) -> Result<PullOutcome> {
        Ok(PullOutcome::UpToDate)
    }

    async fn push(&self, _message: &str) -> Result<PushOutcome> {
        Ok(PushOutcome::UpToDate)
    }

    async fn revision(&self) -> Result<String> {
        self.head().await
    }

    /// `base` becomes the expected old value of the ref update
    async fn write_from(&self, base: &str, id: &str, content: &str, message: &str) -> Result<()> {
        self.put(base, id, content, message).await
    }

    /// Every commit on the origin is published the moment the ref moves,
    /// and a failed write never moves it, so there is nothing to discard.
    async fn rollback(&self, revision: &str) -> Result<()> {
        tracing::trace!(revision, "origin rollback is a no-op");
        Ok(())
    }
}
