//! tix - Git-replicated ticket queue for concurrent agents
//!
//! Tickets are markdown documents in a git repository under .tix/

use anyhow::Result;
use clap::{Parser, Subcommand};
use tix_core::Identity;

mod commands;

#[derive(Parser)]
#[command(name = "tix")]
#[command(about = "Git-replicated ticket queue for concurrent agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Acting agent, recorded on commits and passed to hooks
    #[arg(long, global = true, env = "TIX_AGENT_ID")]
    agent: Option<String>,

    /// Session of the acting agent, passed to hooks
    #[arg(long, global = true, env = "TIX_SESSION_ID")]
    session: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize tix in the current directory
    Init {
        /// Ticket ID prefix
        #[arg(long, default_value = "tix")]
        prefix: String,

        /// Origin to clone; without it this directory hosts the origin
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Create a new ticket
    Create {
        /// Ticket title
        title: String,

        /// Ticket type (defaults to the configured default type)
        #[arg(short = 't', long = "type")]
        ticket_type: Option<String>,

        /// Priority (0=critical, 1=high, 2=medium, 3=low, 4=backlog)
        #[arg(short, long)]
        priority: Option<u8>,

        /// Description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Ticket this one depends on (repeatable)
        #[arg(long = "dep")]
        depends_on: Vec<String>,

        /// Acceptance criterion (repeatable)
        #[arg(short = 'c', long = "criterion")]
        criteria: Vec<String>,
    },

    /// Show ticket details
    Show {
        /// Ticket ID
        id: String,
    },

    /// List tickets
    List {
        /// Filter by state
        #[arg(short, long)]
        state: Option<String>,

        /// Filter by type
        #[arg(short = 't', long = "type")]
        ticket_type: Option<String>,
    },

    /// Show tickets ready to be worked on
    Ready {
        /// Maximum number of tickets
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show tickets waiting on dependencies
    Blocked,

    /// Move a ticket to another state
    Transition {
        /// Ticket ID
        id: String,

        /// Target state
        state: String,

        /// Do not run pre/post transition hooks
        #[arg(long)]
        no_hooks: bool,

        /// Do not pull or push; the change stays local
        #[arg(long)]
        no_sync: bool,
    },

    /// Assign a ticket to an agent
    Assign {
        /// Ticket ID
        id: String,

        /// Agent ID (defaults to the acting agent)
        agent: Option<String>,
    },

    /// Clear a ticket's assignment
    Unassign {
        /// Ticket ID
        id: String,
    },

    /// Add a comment
    Comment {
        /// Ticket ID
        id: String,

        /// Comment text
        text: String,

        /// Comment author (defaults to the acting agent)
        #[arg(long)]
        author: Option<String>,
    },

    /// Set a ticket field (title, description, type, priority, depends_on)
    Set {
        /// Ticket ID
        id: String,

        /// Field name
        key: String,

        /// New value (comma-separated ids for depends_on)
        value: String,
    },

    /// Tick an acceptance criterion
    Check {
        /// Ticket ID
        id: String,

        /// Criterion number, starting at 1
        index: usize,

        /// Untick instead
        #[arg(long)]
        undo: bool,
    },

    /// Show the commits that touched a ticket
    History {
        /// Ticket ID
        id: String,
    },

    /// Pull the latest tickets from the origin
    Sync,
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let json = cli.json;
    let identity = Identity {
        agent_id: cli.agent,
        session_id: cli.session,
    };

    match cli.command {
        Commands::Init { prefix, upstream } => commands::init(&prefix, upstream.as_deref()).await,
        Commands::Create {
            title,
            ticket_type,
            priority,
            description,
            depends_on,
            criteria,
        } => {
            let new = tix_core::NewTicket {
                title,
                ticket_type,
                priority,
                depends_on,
                description,
                acceptance_criteria: criteria,
            };
            commands::create(identity, new, json).await
        }
        Commands::Show { id } => commands::show(identity, &id, json).await,
        Commands::List { state, ticket_type } => {
            commands::list(identity, state, ticket_type, json).await
        }
        Commands::Ready { limit } => commands::ready(identity, limit, json).await,
        Commands::Blocked => commands::blocked(identity, json).await,
        Commands::Transition {
            id,
            state,
            no_hooks,
            no_sync,
        } => {
            let options = tix_core::TransitionOptions {
                skip_hooks: no_hooks,
                skip_sync: no_sync,
            };
            commands::transition(identity, &id, &state, options, json).await
        }
        Commands::Assign { id, agent } => commands::assign(identity, &id, agent, json).await,
        Commands::Unassign { id } => commands::unassign(identity, &id, json).await,
        Commands::Comment { id, text, author } => {
            commands::comment(identity, &id, &text, author, json).await
        }
        Commands::Set { id, key, value } => commands::set(identity, &id, &key, &value, json).await,
        Commands::Check { id, index, undo } => {
            commands::check(identity, &id, index, !undo, json).await
        }
        Commands::History { id } => commands::history(identity, &id, json).await,
        Commands::Sync => commands::sync(identity, json).await,
    }
}
