//! Transition policy
//!
//! Answers which states exist, which transitions are legal, and which
//! hooks fire for a transition. The graph comes from
//! `.tix/ticket_types.toml` when present and valid, otherwise from a
//! built-in pipeline.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::ticket::State;
use crate::{Error, Result};

/// When a hook runs relative to the state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookPhase::Pre => write!(f, "pre"),
            HookPhase::Post => write!(f, "post"),
        }
    }
}

/// Where the active policy came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Configured,
    Fallback,
}

/// Hook names for one phase pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSet {
    pub pre: Vec<String>,
    pub post: Vec<String>,
}

impl HookSet {
    fn phase(&self, phase: HookPhase) -> &[String] {
        match phase {
            HookPhase::Pre => &self.pre,
            HookPhase::Post => &self.post,
        }
    }
}

/// One state declaration in the ticket-type configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: String,

    #[serde(default)]
    pub targets: Vec<String>,

    /// Phase-wide default pre-hooks for any transition out of this state
    #[serde(default)]
    pub pre: Vec<String>,

    /// Phase-wide default post-hooks
    #[serde(default)]
    pub post: Vec<String>,

    /// Hooks for a specific target, overriding the defaults
    #[serde(default)]
    pub on: BTreeMap<String, HookSet>,
}

/// The ticket-type configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub initial_state: String,
    pub done_state: String,

    #[serde(default = "default_types")]
    pub types: Vec<String>,

    #[serde(default = "default_type")]
    pub default_type: String,

    pub states: Vec<StateSpec>,

    /// Derive `pre-<to>` / `post-<to>` hook names when nothing is declared
    #[serde(default)]
    pub conventional_hooks: bool,
}

fn default_types() -> Vec<String> {
    ["feature", "bug", "task", "epic", "chore"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_type() -> String {
    "task".to_string()
}

impl Policy {
    /// The built-in pipeline used whenever no valid configuration exists
    ///
    /// ready → in-progress → review → qa → done, with review and qa able
    /// to bounce back to in-progress and an early exit to closed.
    pub fn fallback() -> Self {
        let state = |name: &str, targets: &[&str]| StateSpec {
            name: name.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            pre: Vec::new(),
            post: Vec::new(),
            on: BTreeMap::new(),
        };
        Self {
            initial_state: "ready".to_string(),
            done_state: "done".to_string(),
            types: default_types(),
            default_type: default_type(),
            states: vec![
                state("ready", &["in-progress", "closed"]),
                state("in-progress", &["review"]),
                state("review", &["qa", "in-progress", "closed"]),
                state("qa", &["done", "in-progress", "closed"]),
                state("done", &[]),
                state("closed", &[]),
            ],
            conventional_hooks: true,
        }
    }

    /// Parse and validate a configuration document
    pub fn from_toml(src: &str) -> Result<Self> {
        let policy: Policy =
            toml::from_str(src).map_err(|e| Error::ConfigurationInvalid(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::ConfigurationInvalid(msg));

        if self.states.is_empty() {
            return invalid("no states declared".into());
        }
        let mut names = HashSet::new();
        for spec in &self.states {
            if spec.name.trim().is_empty() {
                return invalid("empty state name".into());
            }
            if !names.insert(spec.name.as_str()) {
                return invalid(format!("state '{}' declared twice", spec.name));
            }
        }
        for spec in &self.states {
            for target in &spec.targets {
                if !names.contains(target.as_str()) {
                    return invalid(format!(
                        "state '{}' targets undeclared state '{}'",
                        spec.name, target
                    ));
                }
            }
            for target in spec.on.keys() {
                if !spec.targets.contains(target) {
                    return invalid(format!(
                        "hooks declared for '{}' -> '{}' which is not an allowed transition",
                        spec.name, target
                    ));
                }
            }
        }
        if !names.contains(self.initial_state.as_str()) {
            return invalid(format!("initial state '{}' is not declared", self.initial_state));
        }
        if !names.contains(self.done_state.as_str()) {
            return invalid(format!("done state '{}' is not declared", self.done_state));
        }
        if !self.types.contains(&self.default_type) {
            return invalid(format!("default type '{}' is not in types", self.default_type));
        }
        Ok(())
    }

    fn spec(&self, state: &State) -> Option<&StateSpec> {
        self.states.iter().find(|s| s.name == state.as_str())
    }

    pub fn valid_states(&self) -> Vec<State> {
        self.states.iter().map(|s| State::new(&s.name)).collect()
    }

    pub fn is_valid_state(&self, state: &State) -> bool {
        self.spec(state).is_some()
    }

    pub fn valid_targets(&self, from: &State) -> Vec<State> {
        self.spec(from)
            .map(|s| s.targets.iter().map(State::new).collect())
            .unwrap_or_default()
    }

    pub fn is_valid_transition(&self, from: &State, to: &State) -> bool {
        self.spec(from)
            .is_some_and(|s| s.targets.iter().any(|t| t == to.as_str()))
    }

    /// Hooks for `from -> to`: exact pair first, then the phase-wide
    /// default declared on `from`.
    pub fn hooks_for(&self, from: &State, to: &State, phase: HookPhase) -> Vec<String> {
        let Some(spec) = self.spec(from) else {
            return Vec::new();
        };
        if let Some(pair) = spec.on.get(to.as_str()) {
            let hooks = pair.phase(phase);
            if !hooks.is_empty() {
                return hooks.to_vec();
            }
        }
        let defaults = match phase {
            HookPhase::Pre => &spec.pre,
            HookPhase::Post => &spec.post,
        };
        if !defaults.is_empty() {
            return defaults.to_vec();
        }
        if self.conventional_hooks {
            return vec![format!("{}-{}", phase, to)];
        }
        Vec::new()
    }
}

/// Lazily loaded, cached policy owned by the ticket service
pub struct PolicyEngine {
    path: Option<PathBuf>,
    cache: RwLock<Option<(Arc<Policy>, PolicySource)>>,
}

impl PolicyEngine {
    /// Engine backed by a configuration file, loaded on first use
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            cache: RwLock::new(None),
        }
    }

    /// Engine that always uses the built-in pipeline
    pub fn fallback() -> Self {
        Self {
            path: None,
            cache: RwLock::new(None),
        }
    }

    /// Engine with an already-built policy (tests, embedding)
    pub fn with_policy(policy: Policy) -> Self {
        Self {
            path: None,
            cache: RwLock::new(Some((Arc::new(policy), PolicySource::Configured))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drop the cached policy so the next query reloads it
    pub fn reset(&self) {
        if self.path.is_some() {
            *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    /// The active policy, loading it if needed
    pub fn policy(&self) -> Arc<Policy> {
        self.load().0
    }

    pub fn source(&self) -> PolicySource {
        self.load().1
    }

    fn load(&self) -> (Arc<Policy>, PolicySource) {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return cached.clone();
        }

        let loaded = match self.path.as_deref() {
            Some(path) => match load_policy(path) {
                Ok(Some(policy)) => {
                    tracing::debug!(path = %path.display(), "loaded ticket policy");
                    (Arc::new(policy), PolicySource::Configured)
                }
                Ok(None) => (Arc::new(Policy::fallback()), PolicySource::Fallback),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "ignoring ticket policy, using built-in pipeline"
                    );
                    (Arc::new(Policy::fallback()), PolicySource::Fallback)
                }
            },
            None => (Arc::new(Policy::fallback()), PolicySource::Fallback),
        };

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.get_or_insert(loaded).clone()
    }

    pub fn valid_states(&self) -> Vec<State> {
        self.policy().valid_states()
    }

    pub fn valid_targets(&self, from: &State) -> Vec<State> {
        self.policy().valid_targets(from)
    }

    pub fn is_valid_transition(&self, from: &State, to: &State) -> bool {
        self.policy().is_valid_transition(from, to)
    }

    pub fn hooks_for(&self, from: &State, to: &State, phase: HookPhase) -> Vec<String> {
        self.policy().hooks_for(from, to, phase)
    }

    pub fn initial_state(&self) -> State {
        State::new(&self.policy().initial_state)
    }

    pub fn done_state(&self) -> State {
        State::new(&self.policy().done_state)
    }

    pub fn valid_types(&self) -> Vec<String> {
        self.policy().types.clone()
    }

    pub fn default_type(&self) -> String {
        self.policy().default_type.clone()
    }
}

fn load_policy(path: &Path) -> Result<Option<Policy>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Policy::from_toml(&content).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
initial_state = "todo"
done_state = "shipped"
types = ["story", "defect"]
default_type = "story"

[[states]]
name = "todo"
targets = ["doing"]

[[states]]
name = "doing"
targets = ["shipped", "todo"]
pre = ["lint"]
post = ["notify"]

[states.on.shipped]
pre = ["check-tests"]
post = ["announce", "archive"]

[[states]]
name = "shipped"
"#;

    fn s(name: &str) -> State {
        State::from(name)
    }

    #[test]
    fn test_fallback_pipeline() {
        let policy = Policy::fallback();
        assert_eq!(
            policy.valid_states(),
            vec![s("ready"), s("in-progress"), s("review"), s("qa"), s("done"), s("closed")]
        );
        assert!(policy.is_valid_transition(&s("ready"), &s("in-progress")));
        assert!(policy.is_valid_transition(&s("review"), &s("in-progress")));
        assert!(policy.is_valid_transition(&s("qa"), &s("done")));
        assert!(policy.is_valid_transition(&s("review"), &s("closed")));
        assert!(!policy.is_valid_transition(&s("in-progress"), &s("done")));
        assert!(!policy.is_valid_transition(&s("done"), &s("ready")));
        assert!(policy.valid_targets(&s("closed")).is_empty());
        assert_eq!(policy.valid_targets(&s("in-progress")), vec![s("review")]);
    }

    #[test]
    fn test_fallback_hooks_follow_naming_convention() {
        let policy = Policy::fallback();
        assert_eq!(
            policy.hooks_for(&s("in-progress"), &s("review"), HookPhase::Pre),
            vec!["pre-review"]
        );
        assert_eq!(
            policy.hooks_for(&s("in-progress"), &s("review"), HookPhase::Post),
            vec!["post-review"]
        );
    }

    #[test]
    fn test_configured_hooks_pair_then_default() {
        let policy = Policy::from_toml(CONFIG).unwrap();
        assert_eq!(
            policy.hooks_for(&s("doing"), &s("shipped"), HookPhase::Pre),
            vec!["check-tests"]
        );
        assert_eq!(
            policy.hooks_for(&s("doing"), &s("shipped"), HookPhase::Post),
            vec!["announce", "archive"]
        );
        assert_eq!(
            policy.hooks_for(&s("doing"), &s("todo"), HookPhase::Pre),
            vec!["lint"]
        );
        assert!(policy.hooks_for(&s("todo"), &s("doing"), HookPhase::Post).is_empty());
    }

    #[test]
    fn test_configured_policy_fields() {
        let policy = Policy::from_toml(CONFIG).unwrap();
        assert_eq!(policy.initial_state, "todo");
        assert_eq!(policy.done_state, "shipped");
        assert_eq!(policy.default_type, "story");
        assert!(policy.is_valid_transition(&s("doing"), &s("todo")));
        assert!(!policy.is_valid_transition(&s("todo"), &s("shipped")));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let cases = [
            "not toml = = =",
            "initial_state = \"a\"\ndone_state = \"a\"\nstates = []\n",
            "initial_state = \"a\"\ndone_state = \"a\"\n[[states]]\nname = \"a\"\ntargets = [\"b\"]\n",
            "initial_state = \"x\"\ndone_state = \"a\"\n[[states]]\nname = \"a\"\n",
            "initial_state = \"a\"\ndone_state = \"a\"\ndefault_type = \"nope\"\n[[states]]\nname = \"a\"\n",
            "initial_state = \"a\"\ndone_state = \"a\"\n[[states]]\nname = \"a\"\n[states.on.b]\npre = [\"x\"]\n",
        ];
        for src in cases {
            assert!(
                matches!(Policy::from_toml(src), Err(Error::ConfigurationInvalid(_))),
                "{src}"
            );
        }
    }

    #[test]
    fn test_engine_falls_back_on_invalid_file_and_reloads_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticket_types.toml");
        std::fs::write(&path, "garbage = [").unwrap();

        let engine = PolicyEngine::new(&path);
        assert_eq!(engine.source(), PolicySource::Fallback);
        assert_eq!(engine.initial_state(), s("ready"));

        std::fs::write(&path, CONFIG).unwrap();
        // cached until reset
        assert_eq!(engine.initial_state(), s("ready"));

        engine.reset();
        assert_eq!(engine.source(), PolicySource::Configured);
        assert_eq!(engine.initial_state(), s("todo"));
        assert_eq!(engine.valid_types(), vec!["story", "defect"]);
    }

    #[test]
    fn test_engine_missing_file_uses_fallback() {
        let engine = PolicyEngine::new("/nonexistent/ticket_types.toml");
        assert_eq!(engine.source(), PolicySource::Fallback);
        assert_eq!(engine.done_state(), s("done"));
        assert_eq!(engine.default_type(), "task");
    }
}
