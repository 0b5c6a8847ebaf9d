//! Ticket CRUD and transition service
//!
//! The only component that reads or writes ticket documents. Every
//! operation pulls first so it sees the latest published state, and
//! every mutation is published before it returns. A write only lands on
//! the head its ticket was read at, so a stale document never replaces a
//! newer one. A mutation that fails part-way rolls the replica back to
//! where it started.

use serde::Serialize;

use crate::config::Config;
use crate::graph::TicketGraph;
use crate::hooks::{HookContext, HookDispatcher};
use crate::id::{generate_id, is_valid_id};
use crate::policy::{HookPhase, PolicyEngine};
use crate::store::{PullOutcome, Replica, Revision};
use crate::ticket::{Criterion, State, Ticket, TicketId};
use crate::{Error, Result};

const MAX_ID_ATTEMPTS: usize = 16;
/// Times an append-only change is replayed after losing a publish race
const MAX_REPLAYS: usize = 5;

/// Input for `create`
#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub title: String,
    /// Defaults to the policy's default type
    pub ticket_type: Option<String>,
    /// Defaults to the configured default priority
    pub priority: Option<u8>,
    pub depends_on: Vec<TicketId>,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
}

impl NewTicket {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<State>,
    pub ticket_type: Option<String>,
}

impl ListFilter {
    fn matches(&self, ticket: &Ticket) -> bool {
        self.state.as_ref().is_none_or(|s| &ticket.state == s)
            && self
                .ticket_type
                .as_ref()
                .is_none_or(|t| &ticket.ticket_type == t)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionOptions {
    /// Run no hooks at all
    pub skip_hooks: bool,
    /// Neither pull before nor push after; the commit stays local
    pub skip_sync: bool,
}

/// What a successful transition did
#[derive(Debug, Clone, Serialize)]
pub struct Transitioned {
    pub id: TicketId,
    pub from: State,
    pub to: State,
    /// Post-transition hooks started in the background
    pub post_hooks: usize,
}

/// A ticket held back by unfinished dependencies
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTicket {
    pub ticket: Ticket,
    pub blocking: Vec<TicketId>,
}

/// Who is acting on the tickets
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

/// What a mutation does when another writer published first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnConflict {
    /// Structured fields: report the conflict, the caller re-reads and decides
    Fail,
    /// Append-only content: apply the change again on the newer head
    Replay,
}

impl OnConflict {
    fn attempts(self) -> usize {
        match self {
            OnConflict::Fail => 1,
            OnConflict::Replay => MAX_REPLAYS,
        }
    }
}

/// Fields writable through `set_field`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Description,
    Type,
    Priority,
    DependsOn,
}

impl Field {
    fn parse(key: &str) -> Result<Self> {
        match key {
            "title" => Ok(Field::Title),
            "description" => Ok(Field::Description),
            "type" => Ok(Field::Type),
            "priority" => Ok(Field::Priority),
            "depends_on" => Ok(Field::DependsOn),
            "id" | "state" | "assigned_agent_id" | "assigned_at" | "created_at" | "created_by"
            | "updated_at" | "blocks" | "comments" | "acceptance_criteria" => {
                Err(Error::ReadOnlyField(key.to_string()))
            }
            _ => Err(Error::UnknownField(key.to_string())),
        }
    }
}

pub struct TicketService<R: Replica> {
    replica: R,
    policy: PolicyEngine,
    hooks: HookDispatcher,
    config: Config,
    identity: Identity,
}

impl<R: Replica> TicketService<R> {
    pub fn new(replica: R, policy: PolicyEngine, hooks: HookDispatcher) -> Self {
        Self {
            replica,
            policy,
            hooks,
            config: Config::default(),
            identity: Identity::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn replica(&self) -> &R {
        &self.replica
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Create a ticket in the initial state and publish it
    pub async fn create(&self, new: NewTicket) -> Result<TicketId> {
        let title = single_line("title", &new.title)?;
        let ticket_type = new
            .ticket_type
            .unwrap_or_else(|| self.policy.default_type());
        self.check_type(&ticket_type)?;
        let priority = new.priority.unwrap_or(self.config.default_priority);
        check_priority(priority)?;
        for dep in &new.depends_on {
            check_id(dep)?;
        }
        let criteria = new
            .acceptance_criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| single_line("acceptance criterion", c).map(Criterion::open))
            .collect::<Result<Vec<_>>>()?;

        let depends_on = dedup(new.depends_on);
        let description = new.description.trim().to_string();

        // A new document touches nobody else's, so losing the race only
        // means allocating against the newer head and writing again
        let mut attempt = 1;
        loop {
            self.replica.pull().await?;
            let base = self.replica.revision().await?;
            let id = self.allocate_id().await?;

            let mut ticket = Ticket::new(
                id.clone(),
                title.clone(),
                ticket_type.clone(),
                self.policy.initial_state(),
            );
            ticket.priority = priority;
            ticket.depends_on = depends_on.clone();
            ticket.created_by = self.identity.agent_id.clone();
            ticket.description = description.clone();
            ticket.acceptance_criteria = criteria.clone();

            match self.save(&ticket, "create", &base, true).await {
                Ok(()) => {
                    tracing::info!(%id, ticket_type = %ticket.ticket_type, "created ticket");
                    return Ok(id);
                }
                Err(e) if e.is_retryable() && attempt < OnConflict::Replay.attempts() => {
                    tracing::debug!(%id, attempt, error = %e, "create lost a publish race, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn allocate_id(&self) -> Result<TicketId> {
        let existing = self.replica.list().await?;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id(&self.config.prefix);
            if !existing.contains(&id) {
                return Ok(id);
            }
            tracing::debug!(%id, "generated id already taken, retrying");
        }
        Err(Error::Other(format!(
            "could not allocate a free id with prefix '{}'",
            self.config.prefix
        )))
    }

    /// Fetch one ticket, with `blocks` derived from the current graph
    pub async fn read(&self, id: &str) -> Result<Ticket> {
        check_id(id)?;
        self.replica.pull().await?;
        self.load_linked(id).await
    }

    /// All tickets matching `filter`, in store order
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Ticket>> {
        self.replica.pull().await?;
        let mut tickets = self.load_all().await?;
        let graph = TicketGraph::from_tickets(&tickets);
        for ticket in &mut tickets {
            ticket.blocks = graph.dependents(&ticket.id);
        }
        tickets.retain(|t| filter.matches(t));
        Ok(tickets)
    }

    /// Set a writable field from its textual form
    pub async fn set_field(&self, id: &str, key: &str, value: &str) -> Result<Ticket> {
        let field = Field::parse(key)?;
        check_id(id)?;
        let action = format!("set {}", key);
        self.mutate(id, &action, OnConflict::Fail, |ticket| {
            match field {
                Field::Title => ticket.title = single_line("title", value)?,
                Field::Description => ticket.description = value.trim().to_string(),
                Field::Type => {
                    self.check_type(value)?;
                    ticket.ticket_type = value.to_string();
                }
                Field::Priority => {
                    let priority = value.trim().parse::<u8>().map_err(|e| Error::InvalidValue {
                        field: "priority".into(),
                        reason: e.to_string(),
                    })?;
                    check_priority(priority)?;
                    ticket.priority = priority;
                }
                Field::DependsOn => {
                    let deps: Vec<TicketId> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(String::from)
                        .collect();
                    for dep in &deps {
                        check_id(dep)?;
                        if dep == &ticket.id {
                            return Err(Error::InvalidValue {
                                field: "depends_on".into(),
                                reason: "a ticket cannot depend on itself".into(),
                            });
                        }
                    }
                    ticket.depends_on = dedup(deps);
                }
            }
            ticket.touch();
            Ok(())
        })
        .await
    }

    /// Append a comment to the ticket's log
    ///
    /// Comments from concurrent writers never conflict: when another
    /// writer publishes first, the comment is appended again on top of
    /// their change.
    pub async fn append_comment(&self, id: &str, author: &str, text: &str) -> Result<Ticket> {
        check_id(id)?;
        let author = single_line("author", author)?;
        if text.trim().is_empty() {
            return Err(Error::InvalidValue {
                field: "comment".into(),
                reason: "must not be empty".into(),
            });
        }
        self.mutate(id, "comment", OnConflict::Replay, |ticket| {
            ticket.append_comment(author.as_str(), text);
            Ok(())
        })
        .await
    }

    /// Tick or untick acceptance criterion `index` (1-based)
    pub async fn check_criterion(&self, id: &str, index: usize, done: bool) -> Result<Ticket> {
        check_id(id)?;
        self.mutate(id, "check", OnConflict::Fail, |ticket| {
            let count = ticket.acceptance_criteria.len();
            let criterion = index
                .checked_sub(1)
                .and_then(|i| ticket.acceptance_criteria.get_mut(i))
                .ok_or_else(|| Error::InvalidValue {
                    field: "criterion".into(),
                    reason: format!("{} is out of range 1..={}", index, count),
                })?;
            criterion.done = done;
            ticket.touch();
            Ok(())
        })
        .await
    }

    /// Record `agent` as responsible for the ticket; state is untouched
    pub async fn assign(&self, id: &str, agent: &str) -> Result<Ticket> {
        check_id(id)?;
        let agent = single_line("agent", agent)?;
        self.mutate(id, "assign", OnConflict::Fail, |ticket| {
            ticket.assign(agent.as_str());
            Ok(())
        })
        .await
    }

    pub async fn unassign(&self, id: &str) -> Result<Ticket> {
        check_id(id)?;
        self.mutate(id, "unassign", OnConflict::Fail, |ticket| {
            ticket.unassign();
            Ok(())
        })
        .await
    }

    /// Move a ticket along an allowed edge of the state graph
    ///
    /// Pre-transition hooks run first and any of them can veto, in which
    /// case nothing is written. Post-transition hooks are started in the
    /// background once the new state is published.
    pub async fn transition(
        &self,
        id: &str,
        to: &str,
        options: TransitionOptions,
    ) -> Result<Transitioned> {
        check_id(id)?;
        if !options.skip_sync {
            self.replica.pull().await?;
        }

        let to = State::from(to);
        if !self.policy.policy().is_valid_state(&to) {
            return Err(Error::UnknownState {
                state: to.to_string(),
                valid: self.policy.valid_states(),
            });
        }

        let base = self.replica.revision().await?;
        let mut ticket = self.load_linked(id).await?;
        let from = ticket.state.clone();
        if !self.policy.policy().is_valid_state(&from) {
            return Err(Error::UnknownCurrentState {
                id: id.to_string(),
                state: from,
                valid: self.policy.valid_states(),
            });
        }
        if !self.policy.is_valid_transition(&from, &to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: from.clone(),
                allowed: self.policy.valid_targets(&from),
                to,
            });
        }

        let ctx = HookContext {
            ticket_id: ticket.id.clone(),
            ticket_path: self.replica.document_path(&ticket.id),
            prev_state: from.clone(),
            new_state: to.clone(),
            agent_id: self.identity.agent_id.clone(),
            session_id: self.identity.session_id.clone(),
            replica: self.replica.path().to_path_buf(),
        };

        if !options.skip_hooks {
            let pre = self.policy.hooks_for(&from, &to, HookPhase::Pre);
            self.hooks.run_pre(&pre, &ctx).await?;
        }

        ticket.set_state(to.clone());
        let action = format!("transition {} -> {}", from, to);
        self.save(&ticket, &action, &base, !options.skip_sync)
            .await?;
        tracing::info!(%id, %from, %to, "transitioned ticket");

        let post_hooks = if options.skip_hooks {
            0
        } else {
            let post = self.policy.hooks_for(&from, &to, HookPhase::Post);
            self.hooks.spawn_post(&post, &ctx)
        };

        Ok(Transitioned {
            id: ticket.id,
            from,
            to,
            post_hooks,
        })
    }

    /// Tickets in the initial state with every dependency done
    pub async fn ready(&self, limit: Option<usize>) -> Result<Vec<Ticket>> {
        self.replica.pull().await?;
        let tickets = self.load_all().await?;
        let graph = TicketGraph::from_tickets(&tickets);
        let initial = self.policy.initial_state();
        let done = self.policy.done_state();
        let ready = graph.ready(&tickets, &initial, &done);
        Ok(ready
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|t| with_blocks(t, &graph))
            .collect())
    }

    /// Tickets in the initial state waiting on unfinished dependencies
    pub async fn blocked(&self) -> Result<Vec<BlockedTicket>> {
        self.replica.pull().await?;
        let tickets = self.load_all().await?;
        let graph = TicketGraph::from_tickets(&tickets);
        let initial = self.policy.initial_state();
        let done = self.policy.done_state();
        Ok(graph
            .blocked(&tickets, &initial, &done)
            .into_iter()
            .map(|(t, blocking)| BlockedTicket {
                ticket: with_blocks(t, &graph),
                blocking,
            })
            .collect())
    }

    /// Commits that touched the ticket, newest first
    pub async fn history(&self, id: &str) -> Result<Vec<Revision>> {
        check_id(id)?;
        self.replica.pull().await?;
        let revisions = self.replica.history(id).await?;
        if revisions.is_empty() {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(revisions)
    }

    /// Bring the local replica up to date with the origin
    pub async fn sync(&self) -> Result<PullOutcome> {
        let outcome = self.replica.pull().await?;
        if let PullOutcome::Updated { from, to } = &outcome {
            tracing::info!(%from, %to, "synced with origin");
        }
        Ok(outcome)
    }

    async fn load(&self, id: &str) -> Result<Ticket> {
        let content = self.replica.read(id).await?;
        Ticket::from_document(id, &content)
    }

    async fn load_linked(&self, id: &str) -> Result<Ticket> {
        let mut ticket = self.load(id).await?;
        let all = self.load_all().await?;
        ticket.blocks = TicketGraph::from_tickets(&all).dependents(id);
        Ok(ticket)
    }

    /// Every parseable ticket in store order; malformed ones are skipped
    async fn load_all(&self) -> Result<Vec<Ticket>> {
        let mut tickets = Vec::new();
        for id in self.replica.list().await? {
            match self.load(&id).await {
                Ok(ticket) => tickets.push(ticket),
                Err(e @ Error::MalformedTicket { .. }) => {
                    tracing::warn!(%id, error = %e, "skipping malformed ticket");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tickets)
    }

    /// Pull, apply `change` to the current ticket, publish
    async fn mutate<F>(
        &self,
        id: &str,
        action: &str,
        on_conflict: OnConflict,
        change: F,
    ) -> Result<Ticket>
    where
        F: Fn(&mut Ticket) -> Result<()>,
    {
        let mut attempt = 1;
        loop {
            self.replica.pull().await?;
            let base = self.replica.revision().await?;
            let mut ticket = self.load_linked(id).await?;
            change(&mut ticket)?;
            match self.save(&ticket, action, &base, true).await {
                Ok(()) => {
                    tracing::info!(%id, action, "updated ticket");
                    return Ok(ticket);
                }
                Err(e) if e.is_retryable() && attempt < on_conflict.attempts() => {
                    tracing::debug!(%id, action, attempt, error = %e, "lost a publish race, replaying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write on top of `base` and (optionally) publish, rolling back on
    /// any failure
    async fn save(&self, ticket: &Ticket, action: &str, base: &str, publish: bool) -> Result<()> {
        let checkpoint = self.replica.revision().await?;
        let message = self.config.render_message(action, ticket);
        let content = ticket.to_document()?;

        let result = async {
            self.replica
                .write_from(base, &ticket.id, &content, &message)
                .await?;
            if publish {
                self.replica.push(&message).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = &result {
            tracing::debug!(id = %ticket.id, error = %e, %checkpoint, "rolling back failed write");
            if let Err(rollback) = self.replica.rollback(&checkpoint).await {
                tracing::warn!(id = %ticket.id, error = %rollback, "rollback failed");
            }
        }
        result
    }

    fn check_type(&self, ty: &str) -> Result<()> {
        let valid = self.policy.valid_types();
        if valid.iter().any(|t| t == ty) {
            Ok(())
        } else {
            Err(Error::InvalidType {
                ty: ty.to_string(),
                valid,
            })
        }
    }
}

fn with_blocks(ticket: &Ticket, graph: &TicketGraph) -> Ticket {
    let mut ticket = ticket.clone();
    ticket.blocks = graph.dependents(&ticket.id);
    ticket
}

fn check_id(id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

fn check_priority(priority: u8) -> Result<()> {
    if priority > 4 {
        return Err(Error::InvalidValue {
            field: "priority".into(),
            reason: format!("must be 0-4, got {}", priority),
        });
    }
    Ok(())
}

fn single_line(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() || value.contains('\n') {
        return Err(Error::InvalidValue {
            field: field.to_string(),
            reason: "must be a single non-empty line".into(),
        });
    }
    Ok(value.to_string())
}

fn dedup(ids: Vec<TicketId>) -> Vec<TicketId> {
    let mut out: Vec<TicketId> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_keys() {
        assert_eq!(Field::parse("title").unwrap(), Field::Title);
        assert_eq!(Field::parse("depends_on").unwrap(), Field::DependsOn);
        assert!(matches!(Field::parse("state"), Err(Error::ReadOnlyField(_))));
        assert!(matches!(Field::parse("blocks"), Err(Error::ReadOnlyField(_))));
        assert!(matches!(
            Field::parse("assigned_agent_id"),
            Err(Error::ReadOnlyField(_))
        ));
        assert!(matches!(Field::parse("colour"), Err(Error::UnknownField(_))));
    }

    #[test]
    fn test_list_filter() {
        let ticket = Ticket::new("tix-1".into(), "t".into(), "bug".into(), State::from("ready"));
        assert!(ListFilter::default().matches(&ticket));
        let by_state = ListFilter {
            state: Some(State::from("ready")),
            ..Default::default()
        };
        assert!(by_state.matches(&ticket));
        let by_type = ListFilter {
            ticket_type: Some("task".into()),
            ..Default::default()
        };
        assert!(!by_type.matches(&ticket));
    }

    #[test]
    fn test_single_line_and_dedup() {
        assert_eq!(single_line("title", "  Fix it ").unwrap(), "Fix it");
        assert!(single_line("title", "two\nlines").is_err());
        assert!(single_line("title", "   ").is_err());
        assert_eq!(
            dedup(vec!["a".into(), "b".into(), "a".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
