//! tix-core: Core library for the tix ticket queue
//!
//! Tickets are markdown documents in a git repository. Every agent works
//! against its own replica; the origin is the source of truth and is
//! reached only through pull and push. State changes follow a
//! configurable transition graph and can trigger hook scripts.

pub mod config;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod id;
pub mod merge;
pub mod policy;
pub mod service;
pub mod store;
pub mod ticket;
pub mod workspace;

pub use config::Config;
pub use error::{Error, HookFailure, SyncConflict};
pub use graph::TicketGraph;
pub use hooks::{HookContext, HookDispatcher, HookOutcome};
pub use id::generate_id;
pub use policy::{HookPhase, Policy, PolicyEngine, PolicySource};
pub use service::{
    BlockedTicket, Identity, ListFilter, NewTicket, TicketService, TransitionOptions, Transitioned,
};
pub use store::{
    AnyReplica, ClonedReplica, ContentStore, OriginReplica, PullOutcome, PushOutcome, Replica,
    ReplicaRole, Revision, Signature,
};
pub use ticket::{Comment, Criterion, State, Ticket, TicketId};
pub use workspace::Workspace;

/// Result type for tix operations
pub type Result<T> = std::result::Result<T, Error>;
