//! Thin async wrapper around the `git` executable

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Error, Result};

/// Identity recorded on commits made by this replica
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn for_agent(agent: Option<&str>) -> Self {
        let name = agent.unwrap_or("tix").to_string();
        let email = format!("{}@tix.local", name.replace(char::is_whitespace, "-"));
        Self { name, email }
    }
}

/// A git invocation context: which repository, and who is acting
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    signature: Signature,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>, signature: Signature) -> Self {
        Self {
            dir: dir.into(),
            signature,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .env("GIT_AUTHOR_NAME", &self.signature.name)
            .env("GIT_AUTHOR_EMAIL", &self.signature.email)
            .env("GIT_COMMITTER_NAME", &self.signature.name)
            .env("GIT_COMMITTER_EMAIL", &self.signature.email)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run git and return its raw output, whatever the exit status
    pub async fn output(&self, args: &[&str]) -> Result<Output> {
        self.output_with(args, &[], None).await
    }

    /// Run git with extra environment and optional stdin
    pub async fn output_with(
        &self,
        args: &[&str],
        env: &[(&str, &Path)],
        stdin: Option<&[u8]>,
    ) -> Result<Output> {
        tracing::debug!(dir = %self.dir.display(), "git {}", args.join(" "));
        let mut cmd = self.command(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await?;
            drop(pipe);
        }
        Ok(child.wait_with_output().await?)
    }

    /// Run git, failing on non-zero exit; returns trimmed stdout
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        check(args, output)
    }

    /// Like `run`, with extra environment and optional stdin
    pub async fn run_with(
        &self,
        args: &[&str],
        env: &[(&str, &Path)],
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let output = self.output_with(args, env, stdin).await?;
        check(args, output)
    }

    /// Whether a command exits zero; stderr is discarded
    pub async fn succeeds(&self, args: &[&str]) -> Result<bool> {
        Ok(self.output(args).await?.status.success())
    }

    /// Resolve a revision to a commit id, `None` if it does not exist
    pub async fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{}^{{commit}}", rev);
        let output = self.output(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Revision history touching `path`, newest first
    pub async fn log(&self, rev: &str, path: &str) -> Result<Vec<super::Revision>> {
        let format = "--format=%H%x1f%an%x1f%aI%x1f%s%x1e";
        let out = self.run(&["log", format, rev, "--", path]).await?;
        out.split('\x1e')
            .map(str::trim)
            .filter(|record| !record.is_empty())
            .map(|record| {
                let fields: Vec<&str> = record.split('\x1f').collect();
                let [commit, author, at, message] = fields[..] else {
                    return Err(Error::Other(format!("unexpected git log record: {}", record)));
                };
                let at = chrono::DateTime::parse_from_rfc3339(at)
                    .map_err(|e| Error::Other(format!("bad commit date {}: {}", at, e)))?
                    .with_timezone(&chrono::Utc);
                Ok(super::Revision {
                    commit: commit.to_string(),
                    author: author.to_string(),
                    at,
                    message: message.to_string(),
                })
            })
            .collect()
    }
}

fn check(args: &[&str], output: Output) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    } else {
        Err(Error::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Initialize a bare repository whose branch already has one commit
pub async fn init_bare(dir: &Path, branch: &str, signature: Signature) -> Result<Git> {
    tokio::fs::create_dir_all(dir).await?;
    let git = Git::new(dir, signature);
    git.run(&["init", "--quiet", "--bare"]).await?;
    git.run(&["symbolic-ref", "HEAD", &format!("refs/heads/{}", branch)])
        .await?;

    let tree = git.run_with(&["mktree"], &[], Some(b"")).await?;
    let commit = git
        .run(&["commit-tree", &tree, "-m", "tix: initialize ticket store"])
        .await?;
    let zero = "0".repeat(40);
    git.run(&["update-ref", &format!("refs/heads/{}", branch), &commit, &zero])
        .await?;
    Ok(git)
}
