//! A working clone of the origin
//!
//! Writes are ordinary file writes followed by a commit. `pull` fetches
//! and replays local, unpublished commits on top of the origin branch;
//! ticket documents are marked non-mergeable for git so every
//! concurrent edit of the same document goes through the field-level
//! reconciliation in `crate::merge`.

use std::path::{Path, PathBuf};

use super::git::{Git, Signature};
use super::{
    ContentStore, PullOutcome, PushOutcome, Replica, ReplicaRole, Revision, TICKETS_DIR,
    doc_rel_path, id_from_rel_path,
};
use crate::error::SyncConflict;
use crate::{Error, Result, merge};

const REMOTE: &str = "origin";
const ATTRIBUTES: &str = "tickets/*.md -merge\n";

pub struct ClonedReplica {
    git: Git,
    branch: String,
}

impl ClonedReplica {
    /// Open an existing clone
    pub async fn open(dir: impl Into<PathBuf>, branch: &str, signature: Signature) -> Result<Self> {
        let dir = dir.into();
        if !dir.join(".git").exists() {
            return Err(Error::NotInitialized);
        }
        let replica = Self {
            git: Git::new(dir, signature),
            branch: branch.to_string(),
        };
        replica.configure().await?;
        Ok(replica)
    }

    /// Clone `upstream` into `dir`
    pub async fn clone_from(
        upstream: &str,
        dir: impl Into<PathBuf>,
        branch: &str,
        signature: Signature,
    ) -> Result<Self> {
        let dir = dir.into();
        if dir.join(".git").exists() {
            return Err(Error::AlreadyInitialized(dir));
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let parent_git = Git::new(dir.parent().unwrap_or(Path::new(".")), signature.clone());
        let target = dir.to_string_lossy().to_string();
        parent_git
            .run(&["clone", "--quiet", "--branch", branch, upstream, &target])
            .await?;
        tracing::info!(upstream, path = %dir.display(), "cloned ticket store");

        let replica = Self {
            git: Git::new(dir, signature),
            branch: branch.to_string(),
        };
        replica.configure().await?;
        Ok(replica)
    }

    pub async fn open_or_clone(
        upstream: &str,
        dir: impl Into<PathBuf>,
        branch: &str,
        signature: Signature,
    ) -> Result<Self> {
        let dir = dir.into();
        if dir.join(".git").exists() {
            Self::open(dir, branch, signature).await
        } else {
            Self::clone_from(upstream, dir, branch, signature).await
        }
    }

    /// Keep git from textually merging ticket documents
    async fn configure(&self) -> Result<()> {
        let info = self.git.dir().join(".git").join("info");
        tokio::fs::create_dir_all(&info).await?;
        let attributes = info.join("attributes");
        let current = tokio::fs::read_to_string(&attributes)
            .await
            .unwrap_or_default();
        if !current.contains(ATTRIBUTES.trim()) {
            tokio::fs::write(&attributes, format!("{}{}", current, ATTRIBUTES)).await?;
        }
        Ok(())
    }

    fn upstream_ref(&self) -> String {
        format!("refs/remotes/{}/{}", REMOTE, self.branch)
    }

    /// Paths with uncommitted changes, including untracked files
    async fn dirty_paths(&self) -> Result<Vec<String>> {
        let out = self.git.run(&["status", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..))
            .map(String::from)
            .collect())
    }

    fn rebase_in_progress(&self) -> bool {
        let git_dir = self.git.dir().join(".git");
        git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
    }

    async fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self
            .git
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Resolve conflicts of an in-progress rebase until it completes
    ///
    /// Any failure aborts the rebase, restoring the pre-pull state.
    async fn reconcile_rebase(&self) -> Result<()> {
        let mut stalled = false;
        loop {
            if !self.rebase_in_progress() {
                return Ok(());
            }

            let conflicted = self.conflicted_paths().await?;
            if conflicted.is_empty() {
                // A step whose resolution left nothing to commit
                if stalled {
                    self.abort_rebase().await;
                    return Err(Error::Git {
                        command: "rebase".into(),
                        stderr: "replay stalled without conflicts".into(),
                    });
                }
                stalled = true;
                self.git.output(&["rebase", "--skip"]).await?;
                continue;
            }
            stalled = false;

            for path in &conflicted {
                if let Err(e) = self.resolve_path(path).await {
                    self.abort_rebase().await;
                    return Err(e);
                }
            }
            self.git.output(&["rebase", "--continue"]).await?;
        }
    }

    async fn resolve_path(&self, path: &str) -> Result<()> {
        let Some(id) = id_from_rel_path(path) else {
            return Err(SyncConflict::Unmergeable {
                path: path.to_string(),
            }
            .into());
        };

        let base = self.stage(1, path).await?;
        // During a rebase stage 2 is the branch being rebased onto (the
        // origin) and stage 3 is the local commit being replayed.
        let (Some(upstream), Some(local)) = (self.stage(2, path).await?, self.stage(3, path).await?)
        else {
            return Err(SyncConflict::Unmergeable {
                path: path.to_string(),
            }
            .into());
        };

        let merged = merge::reconcile(id, base.as_deref(), &upstream, &local)?;
        tokio::fs::write(self.git.dir().join(path), merged).await?;
        self.git.run(&["add", "--", path]).await?;
        tracing::debug!(id, "reconciled concurrent edits");
        Ok(())
    }

    async fn stage(&self, stage: u8, path: &str) -> Result<Option<String>> {
        let spec = format!(":{}:{}", stage, path);
        let output = self.git.output(&["show", &spec]).await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }

    async fn abort_rebase(&self) {
        if let Err(e) = self.git.run(&["rebase", "--abort"]).await {
            tracing::warn!(error = %e, "failed to abort rebase");
        }
    }

    async fn commit_all(&self, message: &str) -> Result<bool> {
        if self.dirty_paths().await?.is_empty() {
            return Ok(false);
        }
        self.git.run(&["add", "--all"]).await?;
        self.git.run(&["commit", "--quiet", "-m", message]).await?;
        Ok(true)
    }
}

impl ContentStore for ClonedReplica {
    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.git.dir().join(TICKETS_DIR);
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = format!("{}/{}", TICKETS_DIR, entry.file_name().to_string_lossy());
            if let Some(id) = id_from_rel_path(&name) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &str) -> Result<String> {
        match tokio::fs::read_to_string(self.document_path(id)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &str, content: &str, message: &str) -> Result<()> {
        let path = self.document_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        let rel = doc_rel_path(id);
        self.git.run(&["add", "--", &rel]).await?;
        if self.git.succeeds(&["diff", "--cached", "--quiet"]).await? {
            return Ok(());
        }
        self.git
            .run(&["commit", "--quiet", "-m", message, "--", &rel])
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str, message: &str) -> Result<()> {
        if !self.document_path(id).exists() {
            return Err(Error::NotFound(id.to_string()));
        }
        let rel = doc_rel_path(id);
        self.git.run(&["rm", "--quiet", "--", &rel]).await?;
        self.git
            .run(&["commit", "--quiet", "-m", message, "--", &rel])
            .await?;
        Ok(())
    }

    async fn history(&self, id: &str) -> Result<Vec<Revision>> {
        self.git.log("HEAD", &doc_rel_path(id)).await
    }

    fn document_path(&self, id: &str) -> PathBuf {
        self.git.dir().join(doc_rel_path(id))
    }
}

impl Replica for ClonedReplica {
    fn role(&self) -> ReplicaRole {
        ReplicaRole::Clone
    }

    fn path(&self) -> &Path {
        self.git.dir()
    }

    async fn pull(&self) -> Result<PullOutcome> {
        self.git.run(&["fetch", "--quiet", REMOTE]).await?;
        let upstream = self.upstream_ref();
        let Some(remote_head) = self.git.resolve(&upstream).await? else {
            return Ok(PullOutcome::UpToDate);
        };

        let head = self.revision().await?;
        let contained = self
            .git
            .succeeds(&["merge-base", "--is-ancestor", &remote_head, &head])
            .await?;
        if contained {
            return Ok(PullOutcome::UpToDate);
        }

        let dirty = self.dirty_paths().await?;
        if !dirty.is_empty() {
            return Err(SyncConflict::DirtyReplica { paths: dirty }.into());
        }

        let output = self.git.output(&["rebase", "--quiet", &upstream]).await?;
        if !output.status.success() {
            if !self.rebase_in_progress() {
                return Err(Error::Git {
                    command: "rebase".into(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            self.reconcile_rebase().await?;
        }

        let new_head = self.revision().await?;
        tracing::debug!(from = %head, to = %new_head, "pulled from origin");
        Ok(PullOutcome::Updated {
            from: head,
            to: new_head,
        })
    }

    async fn push(&self, message: &str) -> Result<PushOutcome> {
        self.commit_all(message).await?;

        let head = self.revision().await?;
        if let Some(remote_head) = self.git.resolve(&self.upstream_ref()).await?
            && remote_head == head
        {
            return Ok(PushOutcome::UpToDate);
        }

        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let output = self
            .git
            .output(&["push", "--quiet", REMOTE, &refspec])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("[rejected]")
                || stderr.contains("non-fast-forward")
                || stderr.contains("fetch first")
                || stderr.contains("remote rejected")
                || stderr.contains("cannot lock ref")
            {
                tracing::info!(branch = %self.branch, "push rejected, origin has advanced");
                return Err(SyncConflict::PushRejected {
                    branch: self.branch.clone(),
                }
                .into());
            }
            return Err(Error::Git {
                command: "push".into(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(PushOutcome::Published { head })
    }

    async fn revision(&self) -> Result<String> {
        self.git.resolve("HEAD").await?.ok_or(Error::NotInitialized)
    }

    async fn write_from(&self, base: &str, id: &str, content: &str, message: &str) -> Result<()> {
        let head = self.revision().await?;
        if head != base {
            tracing::debug!(%head, base, "clone head moved since the document was read");
            return Err(SyncConflict::OriginAdvanced {
                branch: self.branch.clone(),
            }
            .into());
        }
        self.write(id, content, message).await
    }

    async fn rollback(&self, revision: &str) -> Result<()> {
        self.git
            .run(&["reset", "--quiet", "--hard", revision])
            .await?;
        Ok(())
    }
}
