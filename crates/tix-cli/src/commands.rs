//! CLI command implementations

use anyhow::{Context, Result, bail};
use colored::{ColoredString, Colorize};
use tix_core::{
    AnyReplica, Identity, ListFilter, NewTicket, PolicyEngine, PullOutcome, State, Ticket,
    TicketService, TransitionOptions, Workspace,
};

async fn open(identity: Identity) -> Result<TicketService<AnyReplica>> {
    let workspace = Workspace::discover().context("not inside a tix workspace (run `tix init`)")?;
    tracing::debug!(root = %workspace.root().display(), "opened workspace");
    Ok(workspace.service(identity).await?)
}

fn state_label(state: &State, policy: &PolicyEngine) -> ColoredString {
    let name = state.as_str();
    if *state == policy.done_state() {
        name.green()
    } else if *state == policy.initial_state() {
        name.white()
    } else if policy.valid_targets(state).is_empty() {
        name.dimmed()
    } else {
        name.yellow()
    }
}

fn print_line(ticket: &Ticket, policy: &PolicyEngine) {
    let assignee = ticket
        .assigned_agent_id
        .as_deref()
        .map(|a| format!(" @{}", a).magenta().to_string())
        .unwrap_or_default();
    println!(
        "{} [P{}] [{}] {} - {}{}",
        ticket.id.cyan(),
        ticket.priority,
        ticket.ticket_type.blue(),
        state_label(&ticket.state, policy),
        ticket.title,
        assignee
    );
}

pub async fn init(prefix: &str, upstream: Option<&str>) -> Result<()> {
    let root = std::env::current_dir()?;
    let workspace = Workspace::init(&root, prefix, upstream).await?;
    println!(
        "{} Initialized tix in {}",
        "✓".green(),
        workspace.tix_dir().display()
    );
    println!("  Ticket prefix: {}", prefix);
    match upstream {
        Some(url) => println!("  Replica: clone of {}", url),
        None => println!("  Replica: origin at {}", workspace.replica_path().display()),
    }
    Ok(())
}

pub async fn create(identity: Identity, new: NewTicket, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let id = service.create(new).await?;
    let ticket = service.read(&id).await?;

    if json {
        println!("{}", serde_json::to_string(&ticket)?);
    } else {
        println!("{} Created ticket: {}", "✓".green(), id);
        println!("  Title: {}", ticket.title);
        println!("  Priority: P{}", ticket.priority);
        println!("  State: {}", ticket.state);
    }
    Ok(())
}

pub async fn show(identity: Identity, id: &str, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let ticket = service.read(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ticket)?);
        return Ok(());
    }

    let policy = service.policy();
    println!("{} {}", ticket.id.cyan().bold(), ticket.title.bold());
    println!();
    println!("State:    {}", state_label(&ticket.state, policy));
    println!("Priority: P{}", ticket.priority);
    println!("Type:     {}", ticket.ticket_type);
    if let Some(agent) = &ticket.assigned_agent_id {
        let since = ticket
            .assigned_at
            .map(|t| format!(" since {}", t.format("%Y-%m-%d %H:%M")))
            .unwrap_or_default();
        println!("Assigned: {}{}", agent, since);
    }
    println!("Created:  {}", ticket.created_at.format("%Y-%m-%d %H:%M"));
    println!("Updated:  {}", ticket.updated_at.format("%Y-%m-%d %H:%M"));
    if !ticket.depends_on.is_empty() {
        println!("Depends:  {}", ticket.depends_on.join(", "));
    }
    if !ticket.blocks.is_empty() {
        println!("Blocks:   {}", ticket.blocks.join(", "));
    }

    if !ticket.description.is_empty() {
        println!();
        println!("{}", "Description:".bold());
        println!("{}", ticket.description);
    }

    if !ticket.acceptance_criteria.is_empty() {
        println!();
        println!("{}", "Acceptance Criteria:".bold());
        for (i, c) in ticket.acceptance_criteria.iter().enumerate() {
            let mark = if c.done { "x".green() } else { " ".normal() };
            println!("  {}. [{}] {}", i + 1, mark, c.text);
        }
    }

    if !ticket.comments.is_empty() {
        println!();
        println!("{}", "Comments:".bold());
        for c in &ticket.comments {
            println!(
                "  {} {}",
                c.at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                c.author.magenta()
            );
            for line in c.text.lines() {
                println!("    {}", line);
            }
        }
    }
    Ok(())
}

pub async fn list(
    identity: Identity,
    state: Option<String>,
    ticket_type: Option<String>,
    json: bool,
) -> Result<()> {
    let service = open(identity).await?;
    let filter = ListFilter {
        state: state.as_deref().map(State::from),
        ticket_type,
    };
    let tickets = service.list(&filter).await?;

    if json {
        println!("{}", serde_json::to_string(&tickets)?);
    } else if tickets.is_empty() {
        println!("No tickets found");
    } else {
        for ticket in &tickets {
            print_line(ticket, service.policy());
        }
    }
    Ok(())
}

pub async fn ready(identity: Identity, limit: Option<usize>, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let tickets = service.ready(limit).await?;

    if json {
        println!("{}", serde_json::to_string(&tickets)?);
    } else if tickets.is_empty() {
        println!("No ready tickets");
    } else {
        println!("{}", "Ready to work on:".bold());
        for ticket in &tickets {
            print_line(ticket, service.policy());
        }
    }
    Ok(())
}

pub async fn blocked(identity: Identity, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let blocked = service.blocked().await?;

    if json {
        println!("{}", serde_json::to_string(&blocked)?);
    } else if blocked.is_empty() {
        println!("No blocked tickets");
    } else {
        for entry in &blocked {
            print_line(&entry.ticket, service.policy());
            println!("    {} {}", "waiting on".red(), entry.blocking.join(", "));
        }
    }
    Ok(())
}

pub async fn transition(
    identity: Identity,
    id: &str,
    state: &str,
    options: TransitionOptions,
    json: bool,
) -> Result<()> {
    let service = open(identity).await?;
    let done = service.transition(id, state, options).await?;

    if json {
        println!("{}", serde_json::to_string(&done)?);
    } else {
        println!(
            "{} {}: {} → {}",
            "✓".green(),
            done.id,
            done.from,
            state_label(&done.to, service.policy())
        );
        if done.post_hooks > 0 {
            println!("  Started {} post-transition hook(s)", done.post_hooks);
        }
        if options.skip_sync {
            println!("  {} change is local until the next published update", "!".yellow());
        }
    }
    Ok(())
}

pub async fn assign(identity: Identity, id: &str, agent: Option<String>, json: bool) -> Result<()> {
    let Some(agent) = agent.or_else(|| identity.agent_id.clone()) else {
        bail!("no agent given and TIX_AGENT_ID is not set");
    };
    let service = open(identity).await?;
    let ticket = service.assign(id, &agent).await?;
    report(&ticket, &format!("Assigned {} to {}", id, agent), json)
}

pub async fn unassign(identity: Identity, id: &str, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let ticket = service.unassign(id).await?;
    report(&ticket, &format!("Unassigned {}", id), json)
}

pub async fn comment(
    identity: Identity,
    id: &str,
    text: &str,
    author: Option<String>,
    json: bool,
) -> Result<()> {
    let author = author
        .or_else(|| identity.agent_id.clone())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());
    let service = open(identity).await?;
    let ticket = service.append_comment(id, &author, text).await?;
    report(&ticket, &format!("Commented on {}", id), json)
}

pub async fn set(identity: Identity, id: &str, key: &str, value: &str, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let ticket = service.set_field(id, key, value).await?;
    report(&ticket, &format!("Updated {} of {}", key, id), json)
}

pub async fn check(identity: Identity, id: &str, index: usize, done: bool, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let ticket = service.check_criterion(id, index, done).await?;
    let verb = if done { "Checked" } else { "Unchecked" };
    report(&ticket, &format!("{} criterion {} of {}", verb, index, id), json)
}

fn report(ticket: &Ticket, message: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(ticket)?);
    } else {
        println!("{} {}", "✓".green(), message);
    }
    Ok(())
}

pub async fn history(identity: Identity, id: &str, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let revisions = service.history(id).await?;

    if json {
        println!("{}", serde_json::to_string(&revisions)?);
    } else {
        for rev in &revisions {
            println!(
                "{} {} {} {}",
                rev.commit.get(..8).unwrap_or(&rev.commit).yellow(),
                rev.at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                rev.author.magenta(),
                rev.message
            );
        }
    }
    Ok(())
}

pub async fn sync(identity: Identity, json: bool) -> Result<()> {
    let service = open(identity).await?;
    let outcome = service.sync().await?;

    match (json, &outcome) {
        (true, PullOutcome::UpToDate) => {
            println!("{}", serde_json::json!({ "updated": false }));
        }
        (true, PullOutcome::Updated { from, to }) => {
            println!("{}", serde_json::json!({ "updated": true, "from": from, "to": to }));
        }
        (false, PullOutcome::UpToDate) => println!("Already up to date"),
        (false, PullOutcome::Updated { from, to }) => println!(
            "{} Synced {}..{}",
            "✓".green(),
            from.get(..8).unwrap_or(from),
            to.get(..8).unwrap_or(to)
        ),
    }
    Ok(())
}
