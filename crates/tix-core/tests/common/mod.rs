#![allow(dead_code)]

use std::path::Path;

use tix_core::{
    ClonedReplica, Config, HookDispatcher, Identity, OriginReplica, PolicyEngine, Signature,
    TicketService,
};

pub const BRANCH: &str = "main";

pub async fn origin_at(dir: &Path) -> OriginReplica {
    origin_as(dir, "agent-1").await
}

/// The shared origin, opened as if `agent` were writing to it directly
pub async fn origin_as(dir: &Path, agent: &str) -> OriginReplica {
    OriginReplica::open_or_init(dir.join("origin.git"), BRANCH, Signature::for_agent(Some(agent)))
        .await
        .unwrap()
}

pub async fn clone_at(dir: &Path, name: &str) -> ClonedReplica {
    let upstream = dir.join("origin.git").to_string_lossy().into_owned();
    ClonedReplica::clone_from(&upstream, dir.join(name), BRANCH, Signature::for_agent(Some(name)))
        .await
        .unwrap()
}

pub fn hooks_for(root: &Path) -> HookDispatcher {
    HookDispatcher::new(root).with_project_dir(root.join("hooks"))
}

pub fn service<R: tix_core::Replica>(replica: R, root: &Path, agent: &str) -> TicketService<R> {
    TicketService::new(replica, PolicyEngine::fallback(), hooks_for(root))
        .with_config(Config::default())
        .with_identity(Identity {
            agent_id: Some(agent.to_string()),
            session_id: Some(format!("{}-session", agent)),
        })
}

#[cfg(unix)]
pub fn write_hook(root: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let dir = root.join("hooks");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
