//! Transition hooks
//!
//! Hooks are executables looked up by name, first in the project's
//! `.tix/hooks/` and then in the built-in hook directory. A missing hook
//! is a no-op. Pre-transition hooks run in series and can veto the
//! transition; post-transition hooks are spawned as detached processes
//! and never hold up the caller.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::HookFailure;
use crate::policy::HookPhase;
use crate::ticket::State;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a hook is told about the transition
#[derive(Debug, Clone)]
pub struct HookContext {
    pub ticket_id: String,
    pub ticket_path: PathBuf,
    pub prev_state: State,
    pub new_state: State,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub replica: PathBuf,
}

/// Result of one post-transition hook, collected in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub hook: String,
    pub ticket: String,
    pub result: std::result::Result<(), HookFailure>,
}

/// Locates and runs hook executables
pub struct HookDispatcher {
    project_dir: Option<PathBuf>,
    builtin_dir: Option<PathBuf>,
    working_dir: PathBuf,
    timeout: Duration,
    background: Mutex<Vec<JoinHandle<HookOutcome>>>,
}

impl HookDispatcher {
    /// Dispatcher running hooks from `working_dir`, the caller's context
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: None,
            builtin_dir: None,
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_builtin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builtin_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Find a hook by name, project directory first
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            tracing::warn!(hook = name, "ignoring hook with invalid name");
            return None;
        }
        [self.project_dir.as_deref(), self.builtin_dir.as_deref()]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    fn command(&self, path: &Path, phase: HookPhase, ctx: &HookContext) -> Command {
        let mut cmd = Command::new(path);
        cmd.arg(&ctx.ticket_id)
            .current_dir(&self.working_dir)
            .env("TIX_TICKET_ID", &ctx.ticket_id)
            .env("TIX_TICKET_PATH", &ctx.ticket_path)
            .env("TIX_PREV_STATE", ctx.prev_state.as_str())
            .env("TIX_NEW_STATE", ctx.new_state.as_str())
            .env("TIX_HOOK_PHASE", phase.to_string())
            .env("TIX_REPLICA", &ctx.replica)
            .env("TIX_PROJECT_ROOT", &self.working_dir)
            .stdin(Stdio::null());
        match &ctx.agent_id {
            Some(agent) => cmd.env("TIX_AGENT_ID", agent),
            None => cmd.env_remove("TIX_AGENT_ID"),
        };
        match &ctx.session_id {
            Some(session) => cmd.env("TIX_SESSION_ID", session),
            None => cmd.env_remove("TIX_SESSION_ID"),
        };
        cmd
    }

    /// Run pre-transition hooks in order; the first failure vetoes
    pub async fn run_pre(&self, names: &[String], ctx: &HookContext) -> Result<()> {
        for name in names {
            let Some(path) = self.resolve(name) else {
                tracing::debug!(hook = %name, "no pre-transition hook installed");
                continue;
            };
            tracing::debug!(hook = %name, ticket = %ctx.ticket_id, "running pre-transition hook");
            if let Err(reason) = self.run_one(&path, ctx).await {
                tracing::info!(hook = %name, ticket = %ctx.ticket_id, %reason, "pre-transition hook vetoed");
                return Err(Error::HookVetoed {
                    hook: name.clone(),
                    ticket: ctx.ticket_id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn run_one(&self, path: &Path, ctx: &HookContext) -> std::result::Result<(), HookFailure> {
        let mut child = self
            .command(path, HookPhase::Pre, ctx)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HookFailure::Spawn(e.to_string()))?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status_result(status),
            Ok(Err(e)) => Err(HookFailure::Spawn(e.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                Err(HookFailure::TimedOut(self.timeout))
            }
        }
    }

    /// Start post-transition hooks without waiting for them
    ///
    /// Each hook is started right away as its own detached process, so
    /// it keeps running even if the caller exits. A background task
    /// reaps it and logs failures. Returns how many hooks were started.
    pub fn spawn_post(&self, names: &[String], ctx: &HookContext) -> usize {
        self.prune_finished();
        let mut started = 0;
        for name in names {
            let Some(path) = self.resolve(name) else {
                tracing::debug!(hook = %name, "no post-transition hook installed");
                continue;
            };

            let mut cmd = self.command(&path, HookPhase::Post, ctx);
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            #[cfg(unix)]
            cmd.process_group(0);

            let hook = name.clone();
            let ticket = ctx.ticket_id.clone();
            let handle = match cmd.spawn() {
                Ok(mut child) => tokio::spawn(async move {
                    let result = match child.wait().await {
                        Ok(status) => status_result(status),
                        Err(e) => Err(HookFailure::Spawn(e.to_string())),
                    };
                    if let Err(reason) = &result {
                        tracing::warn!(%hook, %ticket, %reason, "post-transition hook failed");
                    }
                    HookOutcome {
                        hook,
                        ticket,
                        result,
                    }
                }),
                Err(e) => {
                    tracing::warn!(%hook, %ticket, error = %e, "could not start post-transition hook");
                    let outcome = HookOutcome {
                        hook,
                        ticket,
                        result: Err(HookFailure::Spawn(e.to_string())),
                    };
                    tokio::spawn(async move { outcome })
                }
            };
            self.background
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
            started += 1;
        }
        started
    }

    /// Forget hooks that already finished; their failures were logged
    /// when they were reaped
    fn prune_finished(&self) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| !h.is_finished());
    }

    /// Number of post-transition hooks not yet reaped
    pub fn pending(&self) -> usize {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for the post-transition hooks still tracked
    ///
    /// Hooks that had already finished when a later `spawn_post` ran are
    /// no longer tracked and do not appear in the outcomes.
    pub async fn wait_background(&self) -> Vec<HookOutcome> {
        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(error = %e, "post-transition hook task failed"),
            }
        }
        outcomes
    }
}

fn status_result(status: ExitStatus) -> std::result::Result<(), HookFailure> {
    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(HookFailure::Exit(code)),
            None => Err(HookFailure::Signal),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn context(root: &Path) -> HookContext {
        HookContext {
            ticket_id: "tix-h00k".into(),
            ticket_path: root.join("tickets/tix-h00k.md"),
            prev_state: State::from("in-progress"),
            new_state: State::from("review"),
            agent_id: Some("agent-9".into()),
            session_id: None,
            replica: root.to_path_buf(),
        }
    }

    #[test]
    fn test_project_hooks_shadow_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let builtin = dir.path().join("builtin");
        script(&project, "pre-review", "exit 0");
        script(&builtin, "pre-review", "exit 1");
        script(&builtin, "post-review", "exit 0");

        let hooks = HookDispatcher::new(dir.path())
            .with_project_dir(&project)
            .with_builtin_dir(&builtin);
        assert_eq!(hooks.resolve("pre-review"), Some(project.join("pre-review")));
        assert_eq!(hooks.resolve("post-review"), Some(builtin.join("post-review")));
        assert_eq!(hooks.resolve("missing"), None);
        assert_eq!(hooks.resolve("../builtin/post-review"), None);
    }

    #[tokio::test]
    async fn test_pre_hook_receives_context() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join("hooks");
        let out = dir.path().join("seen");
        script(
            &hooks_dir,
            "check",
            &format!(
                "echo \"$1 $TIX_PREV_STATE $TIX_NEW_STATE $TIX_AGENT_ID ${{TIX_SESSION_ID:-none}} $TIX_HOOK_PHASE\" > {}",
                out.display()
            ),
        );
        let hooks = HookDispatcher::new(dir.path()).with_project_dir(&hooks_dir);
        hooks
            .run_pre(&["check".into()], &context(dir.path()))
            .await
            .unwrap();
        let seen = std::fs::read_to_string(&out).unwrap();
        assert_eq!(seen.trim(), "tix-h00k in-progress review agent-9 none pre");
    }

    #[tokio::test]
    async fn test_failing_pre_hook_vetoes_and_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join("hooks");
        let marker = dir.path().join("second-ran");
        script(&hooks_dir, "first", "exit 3");
        script(&hooks_dir, "second", &format!("touch {}", marker.display()));

        let hooks = HookDispatcher::new(dir.path()).with_project_dir(&hooks_dir);
        let err = hooks
            .run_pre(&["first".into(), "second".into()], &context(dir.path()))
            .await
            .unwrap_err();
        match err {
            Error::HookVetoed { hook, reason, .. } => {
                assert_eq!(hook, "first");
                assert_eq!(reason, HookFailure::Exit(3));
            }
            other => panic!("expected veto, got {other:?}"),
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_pre_hook_timeout_is_a_veto() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join("hooks");
        script(&hooks_dir, "slow", "sleep 5");

        let hooks = HookDispatcher::new(dir.path())
            .with_project_dir(&hooks_dir)
            .with_timeout(Duration::from_millis(200));
        let err = hooks
            .run_pre(&["slow".into()], &context(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HookVetoed {
                reason: HookFailure::TimedOut(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_hooks_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(dir.path()).with_project_dir(dir.path().join("none"));
        hooks
            .run_pre(&["pre-review".into()], &context(dir.path()))
            .await
            .unwrap();
        assert_eq!(hooks.spawn_post(&["post-review".into()], &context(dir.path())), 0);
        assert!(hooks.wait_background().await.is_empty());
    }

    #[tokio::test]
    async fn test_post_hooks_run_in_background_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join("hooks");
        let marker = dir.path().join("done");
        script(&hooks_dir, "slow-ok", &format!("sleep 1; touch {}", marker.display()));
        script(&hooks_dir, "broken", "exit 7");

        let hooks = HookDispatcher::new(dir.path()).with_project_dir(&hooks_dir);
        let started = hooks.spawn_post(&["slow-ok".into(), "broken".into()], &context(dir.path()));
        assert_eq!(started, 2);
        assert!(!marker.exists());

        let outcomes = hooks.wait_background().await;
        assert!(marker.exists());
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result, Ok(()));
        assert_eq!(outcomes[1].result, Err(HookFailure::Exit(7)));
        assert_eq!(hooks.pending(), 0);
    }

    #[tokio::test]
    async fn test_finished_post_hooks_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join("hooks");
        script(&hooks_dir, "quick", "exit 0");
        script(&hooks_dir, "slow", "sleep 1");

        let hooks = HookDispatcher::new(dir.path()).with_project_dir(&hooks_dir);
        assert_eq!(hooks.spawn_post(&["quick".into()], &context(dir.path())), 1);
        for _ in 0..100 {
            if hooks.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(hooks.pending(), 0);

        hooks.spawn_post(&["slow".into()], &context(dir.path()));
        let outcomes = hooks.wait_background().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].hook, "slow");
    }
}
