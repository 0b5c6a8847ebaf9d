//! Configuration for tix
//!
//! Stored in .tix/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ticket::Ticket;

/// tix configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ticket ID prefix (e.g., "tix", "myproject")
    pub prefix: String,

    /// Default priority for new tickets (0-4)
    pub default_priority: u8,

    /// Commit message template
    /// Available variables: {action}, {id}, {title}
    pub message_template: String,

    /// Where the ticket store lives and what it syncs with
    #[serde(default)]
    pub replica: ReplicaConfig,

    /// Transition hook settings
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: "tix".to_string(),
            default_priority: 2,
            message_template: "tix: {action} {id}".to_string(),
            replica: ReplicaConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

/// Replica configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Repository directory, relative to the project root
    pub path: PathBuf,

    /// Origin to clone from; unset means this replica is the origin
    pub upstream: Option<String>,

    /// Branch carrying the tickets
    pub branch: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".tix/replica"),
            upstream: None,
            branch: "main".to_string(),
        }
    }
}

/// Hook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Seconds a pre-transition hook may run before it counts as a veto
    pub timeout_secs: u64,

    /// Built-in hook directory (defaults to <data dir>/tix/hooks)
    pub builtin_dir: Option<PathBuf>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            builtin_dir: None,
        }
    }
}

impl HooksConfig {
    pub fn builtin_dir(&self) -> Option<PathBuf> {
        self.builtin_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("tix").join("hooks")))
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            crate::Error::ConfigurationInvalid(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if !crate::id::is_valid_id(&self.prefix) || self.prefix.contains('-') {
            return Err(crate::Error::ConfigurationInvalid(format!(
                "invalid prefix '{}'",
                self.prefix
            )));
        }
        if self.default_priority > 4 {
            return Err(crate::Error::ConfigurationInvalid(format!(
                "default_priority must be 0-4, got {}",
                self.default_priority
            )));
        }
        if self.replica.branch.trim().is_empty() {
            return Err(crate::Error::ConfigurationInvalid(
                "replica.branch must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Commit message for `action` applied to `ticket`
    pub fn render_message(&self, action: &str, ticket: &Ticket) -> String {
        self.message_template
            .replace("{action}", action)
            .replace("{id}", &ticket.id)
            .replace("{title}", &ticket.title)
    }

    /// Generate a default config file with comments
    pub fn default_with_comments(prefix: &str, upstream: Option<&str>) -> String {
        let upstream = match upstream {
            Some(url) => format!("upstream = {}", toml::Value::String(url.to_string())),
            None => "# upstream = \"/srv/tickets.git\"".to_string(),
        };
        format!(
            r#"# tix configuration

# Ticket ID prefix (e.g., "tix", "myproject")
prefix = {prefix}

# Default priority for new tickets (0=critical, 1=high, 2=medium, 3=low, 4=backlog)
default_priority = 2

# Commit message template
# Variables: {{action}}, {{id}}, {{title}}
message_template = "tix: {{action}} {{id}}"

[replica]
# Repository directory, relative to the project root
path = ".tix/replica"

# Origin to clone from. Leave unset to make this replica the origin.
{upstream}

# Branch carrying the tickets
branch = "main"

[hooks]
# Seconds a pre-transition hook may run before the transition is vetoed
timeout_secs = 300

# Built-in hook directory (defaults to <data dir>/tix/hooks)
# builtin_dir = "/usr/local/share/tix/hooks"
"#,
            prefix = toml::Value::String(prefix.to_string()),
        )
    }
}
