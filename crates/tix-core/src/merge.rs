//! Three-way reconciliation of concurrently edited ticket documents
//!
//! Used while replaying local commits on top of the origin. Structured
//! fields are never merged textually: a field changed on one side takes
//! that side's value, a field changed differently on both sides is a
//! conflict. The comment log is append-only and is unioned.

use crate::error::SyncConflict;
use crate::ticket::Ticket;
use crate::Result;

/// Merge `local` onto `upstream` given their common ancestor `base`
///
/// `base` is `None` when both sides created the document independently.
pub fn reconcile(id: &str, base: Option<&str>, upstream: &str, local: &str) -> Result<String> {
    let base = base.map(|b| Ticket::from_document(id, b)).transpose()?;
    let upstream = Ticket::from_document(id, upstream)?;
    let local = Ticket::from_document(id, local)?;
    let merged = merge_tickets(base.as_ref(), &upstream, &local)?;
    merged.to_document()
}

pub fn merge_tickets(base: Option<&Ticket>, upstream: &Ticket, local: &Ticket) -> Result<Ticket> {
    let mut conflicts = Vec::new();
    let mut merged = upstream.clone();

    macro_rules! field {
        ($name:literal, $get:expr) => {{
            let get = $get;
            merge_field(
                $name,
                base.map(|t| get(t)),
                get(upstream),
                get(local),
                &mut conflicts,
            )
        }};
    }

    merged.ticket_type = field!("type", |t: &Ticket| t.ticket_type.clone());
    merged.priority = field!("priority", |t: &Ticket| t.priority);
    merged.state = field!("state", |t: &Ticket| t.state.clone());
    (merged.assigned_agent_id, merged.assigned_at) =
        field!("assigned_agent_id", |t: &Ticket| (t.assigned_agent_id.clone(), t.assigned_at));
    merged.depends_on = field!("depends_on", |t: &Ticket| t.depends_on.clone());
    (merged.created_at, merged.created_by) =
        field!("created_at", |t: &Ticket| (t.created_at, t.created_by.clone()));
    merged.title = field!("title", |t: &Ticket| t.title.clone());
    merged.description = field!("description", |t: &Ticket| t.description.clone());
    merged.acceptance_criteria =
        field!("acceptance_criteria", |t: &Ticket| t.acceptance_criteria.clone());

    if !conflicts.is_empty() {
        return Err(SyncConflict::Diverged {
            id: upstream.id.clone(),
            fields: conflicts,
        }
        .into());
    }

    merged.blocks = union(&upstream.blocks, &local.blocks);
    merged.comments = union(&upstream.comments, &local.comments);
    merged.updated_at = upstream.updated_at.max(local.updated_at);
    Ok(merged)
}

/// Three-way choice: a one-sided change wins, a two-sided divergent
/// change is recorded as a conflict (upstream's value is kept meanwhile)
fn merge_field<T: PartialEq>(
    name: &str,
    base: Option<T>,
    upstream: T,
    local: T,
    conflicts: &mut Vec<String>,
) -> T {
    if upstream == local || base.as_ref() == Some(&local) {
        upstream
    } else if base.as_ref() == Some(&upstream) {
        local
    } else {
        conflicts.push(name.to_string());
        upstream
    }
}

fn union<T: Clone + PartialEq>(first: &[T], second: &[T]) -> Vec<T> {
    let mut out = first.to_vec();
    for item in second {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{Criterion, State};
    use crate::Error;

    fn base() -> Ticket {
        let mut t = Ticket::new(
            "tix-m1".into(),
            "Merge me".into(),
            "task".into(),
            State::from("in-progress"),
        );
        t.acceptance_criteria = vec![Criterion::open("works")];
        t
    }

    #[test]
    fn test_one_sided_field_changes_combine() {
        let base = base();
        let mut upstream = base.clone();
        upstream.set_state(State::from("review"));
        let mut local = base.clone();
        local.assign("agent-2");

        let merged = merge_tickets(Some(&base), &upstream, &local).unwrap();
        assert_eq!(merged.state, State::from("review"));
        assert_eq!(merged.assigned_agent_id.as_deref(), Some("agent-2"));
    }

    #[test]
    fn test_concurrent_state_changes_conflict() {
        let base = base();
        let mut upstream = base.clone();
        upstream.set_state(State::from("review"));
        let mut local = base.clone();
        local.set_state(State::from("ready"));

        match merge_tickets(Some(&base), &upstream, &local) {
            Err(Error::SyncConflict(SyncConflict::Diverged { fields, .. })) => {
                assert_eq!(fields, vec!["state"]);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_same_change_on_both_sides_is_not_a_conflict() {
        let base = base();
        let mut upstream = base.clone();
        upstream.priority = 0;
        let mut local = base.clone();
        local.priority = 0;
        let merged = merge_tickets(Some(&base), &upstream, &local).unwrap();
        assert_eq!(merged.priority, 0);
    }

    #[test]
    fn test_comments_are_unioned() {
        let base = base();
        let mut upstream = base.clone();
        upstream.append_comment("agent-1", "from upstream");
        let mut local = base.clone();
        local.append_comment("agent-2", "from local");

        let merged = merge_tickets(Some(&base), &upstream, &local).unwrap();
        let texts: Vec<_> = merged.comments.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["from upstream", "from local"]);
        assert_eq!(merged.updated_at, upstream.updated_at.max(local.updated_at));
    }

    #[test]
    fn test_reconcile_documents() {
        let base = base();
        let mut upstream = base.clone();
        upstream.append_comment("agent-1", "one");
        let mut local = base.clone();
        local.acceptance_criteria[0].done = true;

        let doc = reconcile(
            "tix-m1",
            Some(&base.to_document().unwrap()),
            &upstream.to_document().unwrap(),
            &local.to_document().unwrap(),
        )
        .unwrap();
        let merged = Ticket::from_document("tix-m1", &doc).unwrap();
        assert!(merged.acceptance_criteria[0].done);
        assert_eq!(merged.comments.len(), 1);
    }

    #[test]
    fn test_independent_creation_without_base() {
        let upstream = base();
        let mut local = upstream.clone();
        local.title = "Different".into();
        assert!(merge_tickets(None, &upstream, &local).is_err());
        assert!(merge_tickets(None, &upstream, &upstream.clone()).is_ok());
    }
}
