//! The project-level `.tix/` directory
//!
//! Holds the configuration, the ticket-type policy, project hooks and
//! (by default) the replica itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::hooks::HookDispatcher;
use crate::policy::PolicyEngine;
use crate::service::{Identity, TicketService};
use crate::store::{AnyReplica, ClonedReplica, OriginReplica, Signature};
use crate::{Error, Result};

pub const TIX_DIR: &str = ".tix";
const CONFIG_FILE: &str = "config.toml";
const POLICY_FILE: &str = "ticket_types.toml";
const HOOKS_DIR: &str = "hooks";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: Config,
}

impl Workspace {
    /// Find the workspace enclosing the current directory
    pub fn discover() -> Result<Self> {
        Self::discover_from(&std::env::current_dir()?)
    }

    /// Find the workspace enclosing `start`
    pub fn discover_from(start: &Path) -> Result<Self> {
        let root = find_root(start)?;
        let config = Config::load(&root.join(TIX_DIR).join(CONFIG_FILE))?;
        Ok(Self { root, config })
    }

    /// Create `.tix/` under `root` and set up the replica
    ///
    /// With `upstream` the replica is a clone of it, otherwise a new
    /// origin is created.
    pub async fn init(root: &Path, prefix: &str, upstream: Option<&str>) -> Result<Self> {
        let tix_dir = root.join(TIX_DIR);
        if tix_dir.join(CONFIG_FILE).exists() {
            return Err(Error::AlreadyInitialized(tix_dir));
        }

        tokio::fs::create_dir_all(tix_dir.join(HOOKS_DIR)).await?;
        let config_path = tix_dir.join(CONFIG_FILE);
        tokio::fs::write(&config_path, Config::default_with_comments(prefix, upstream)).await?;
        // Keep the replica repository out of the project's own history
        tokio::fs::write(tix_dir.join(".gitignore"), "replica/\n").await?;

        let workspace = Self {
            root: root.to_path_buf(),
            config: Config::load(&config_path)?,
        };
        if let Err(e) = workspace.open_replica(Signature::for_agent(None)).await {
            // Leave no config behind so init can be retried
            let _ = tokio::fs::remove_file(&config_path).await;
            return Err(e);
        }
        tracing::info!(root = %root.display(), prefix, "initialized tix workspace");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tix_dir(&self) -> PathBuf {
        self.root.join(TIX_DIR)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.tix_dir().join(POLICY_FILE)
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.tix_dir().join(HOOKS_DIR)
    }

    pub fn replica_path(&self) -> PathBuf {
        self.root.join(&self.config.replica.path)
    }

    /// Upstream location usable from any working directory
    fn upstream(&self) -> Option<String> {
        let upstream = self.config.replica.upstream.as_deref()?;
        if is_remote_url(upstream) || Path::new(upstream).is_absolute() {
            Some(upstream.to_string())
        } else {
            Some(self.root.join(upstream).to_string_lossy().into_owned())
        }
    }

    /// Open the configured replica, creating it on first use
    pub async fn open_replica(&self, signature: Signature) -> Result<AnyReplica> {
        let path = self.replica_path();
        let branch = &self.config.replica.branch;
        match self.upstream() {
            Some(upstream) => {
                let replica = ClonedReplica::open_or_clone(&upstream, path, branch, signature).await?;
                Ok(AnyReplica::Clone(replica))
            }
            None => {
                let replica = OriginReplica::open_or_init(path, branch, signature).await?;
                Ok(AnyReplica::Origin(replica))
            }
        }
    }

    pub fn hook_dispatcher(&self) -> HookDispatcher {
        let mut hooks = HookDispatcher::new(&self.root)
            .with_project_dir(self.hooks_dir())
            .with_timeout(Duration::from_secs(self.config.hooks.timeout_secs));
        if let Some(builtin) = self.config.hooks.builtin_dir() {
            hooks = hooks.with_builtin_dir(builtin);
        }
        hooks
    }

    /// Assemble the ticket service acting as `identity`
    pub async fn service(&self, identity: Identity) -> Result<TicketService<AnyReplica>> {
        let replica = self
            .open_replica(Signature::for_agent(identity.agent_id.as_deref()))
            .await?;
        Ok(
            TicketService::new(replica, PolicyEngine::new(self.policy_path()), self.hook_dispatcher())
                .with_config(self.config.clone())
                .with_identity(identity),
        )
    }
}

/// Find the project root (directory containing .tix)
fn find_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(TIX_DIR).join(CONFIG_FILE).exists() {
            return Ok(current);
        }
        if !current.pop() {
            return Err(Error::NotInitialized);
        }
    }
}

fn is_remote_url(location: &str) -> bool {
    // scheme://host/path or scp-like user@host:path
    location.contains("://")
        || location
            .split_once(':')
            .is_some_and(|(host, _)| !host.is_empty() && !host.contains('/'))
}
