mod common;

use std::sync::Arc;

use tokio::task::JoinSet;
use tix_core::{
    ContentStore, Error, NewTicket, PullOutcome, PushOutcome, Replica, ReplicaRole, State,
    SyncConflict, Ticket, TransitionOptions,
};

use common::{clone_at, origin_at, service};

#[tokio::test]
async fn test_clones_see_each_others_tickets() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = service(clone_at(dir.path(), "bob").await, dir.path(), "bob");
    assert_eq!(alice.replica().role(), ReplicaRole::Clone);

    let id = alice.create(NewTicket::titled("Shared")).await.unwrap();
    let seen = bob.read(&id).await.unwrap();
    assert_eq!(seen.title, "Shared");
    assert_eq!(seen.created_by.as_deref(), Some("alice"));

    // And the origin has it too
    let origin = origin_at(dir.path()).await;
    assert_eq!(origin.list().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_racing_transitions_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = service(clone_at(dir.path(), "bob").await, dir.path(), "bob");

    let id = alice.create(NewTicket::titled("Contested")).await.unwrap();
    bob.sync().await.unwrap();

    let opts = TransitionOptions::default();
    let (a, b) = tokio::join!(
        alice.transition(&id, "in-progress", opts),
        bob.transition(&id, "in-progress", opts),
    );
    let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1, "alice: {a:?}, bob: {b:?}");

    let loser = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
    assert!(
        loser.is_retryable() || loser.is_invalid_transition(),
        "unexpected failure: {loser:?}"
    );

    // The loser left nothing unpublished behind
    for side in [&alice, &bob] {
        side.sync().await.unwrap();
        assert_eq!(side.read(&id).await.unwrap().state, State::from("in-progress"));
    }
    let origin = origin_at(dir.path()).await;
    let head = origin.revision().await.unwrap();
    assert_eq!(alice.replica().revision().await.unwrap(), head);
    assert_eq!(bob.replica().revision().await.unwrap(), head);
}

#[tokio::test]
async fn test_rejected_push_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = clone_at(dir.path(), "bob").await;

    let id = alice.create(NewTicket::titled("Moving target")).await.unwrap();
    bob.pull().await.unwrap();
    let checkpoint = bob.revision().await.unwrap();

    // Bob commits locally, then alice publishes first
    let mut ticket = Ticket::from_document(&id, &bob.read(&id).await.unwrap()).unwrap();
    ticket.priority = 0;
    bob.write(&id, &ticket.to_document().unwrap(), "bump").await.unwrap();
    alice.append_comment(&id, "alice", "mine").await.unwrap();

    let err = bob.push("bump").await.unwrap_err();
    assert!(matches!(
        err,
        Error::SyncConflict(SyncConflict::PushRejected { .. })
    ));
    assert!(err.is_retryable());

    bob.rollback(&checkpoint).await.unwrap();
    assert_eq!(bob.revision().await.unwrap(), checkpoint);
    let restored = Ticket::from_document(&id, &bob.read(&id).await.unwrap()).unwrap();
    assert_eq!(restored.priority, 2);
}

#[tokio::test]
async fn test_concurrent_comments_are_unioned() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = service(clone_at(dir.path(), "bob").await, dir.path(), "bob");

    let id = alice.create(NewTicket::titled("Chatty")).await.unwrap();
    bob.sync().await.unwrap();

    // Bob's change stays local while alice publishes a comment
    bob.transition(
        &id,
        "in-progress",
        TransitionOptions {
            skip_hooks: true,
            skip_sync: true,
        },
    )
    .await
    .unwrap();
    alice.append_comment(&id, "alice", "from alice").await.unwrap();

    let outcome = bob.sync().await.unwrap();
    assert!(matches!(outcome, PullOutcome::Updated { .. }));
    bob.append_comment(&id, "bob", "from bob").await.unwrap();

    let merged = alice.read(&id).await.unwrap();
    assert_eq!(merged.state, State::from("in-progress"));
    let texts: Vec<_> = merged.comments.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["from alice", "from bob"]);
}

#[tokio::test]
async fn test_divergent_field_edits_fail_the_pull() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = service(clone_at(dir.path(), "bob").await, dir.path(), "bob");

    let id = alice.create(NewTicket::titled("Split brain")).await.unwrap();
    bob.sync().await.unwrap();

    let local = TransitionOptions {
        skip_hooks: true,
        skip_sync: true,
    };
    bob.transition(&id, "closed", local).await.unwrap();
    let bob_head = bob.replica().revision().await.unwrap();
    alice
        .transition(&id, "in-progress", TransitionOptions::default())
        .await
        .unwrap();

    let err = bob.sync().await.unwrap_err();
    match err {
        Error::SyncConflict(SyncConflict::Diverged { fields, .. }) => {
            assert_eq!(fields, vec!["state"]);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    // The replay was aborted; bob's replica is as it was
    assert_eq!(bob.replica().revision().await.unwrap(), bob_head);
}

#[tokio::test]
async fn test_dirty_clone_refuses_to_pull() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = clone_at(dir.path(), "bob").await;

    std::fs::write(dir.path().join("bob").join("scratch.txt"), "stray").unwrap();
    alice.create(NewTicket::titled("Newer")).await.unwrap();

    match bob.pull().await {
        Err(Error::SyncConflict(SyncConflict::DirtyReplica { paths })) => {
            assert_eq!(paths, vec!["scratch.txt"]);
        }
        other => panic!("expected dirty replica, got {other:?}"),
    }
}

#[tokio::test]
async fn test_push_with_nothing_new_is_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let bob = clone_at(dir.path(), "bob").await;
    assert_eq!(bob.push("noop").await.unwrap(), PushOutcome::UpToDate);
    assert_eq!(bob.pull().await.unwrap(), PullOutcome::UpToDate);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_origin_writes_never_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let origins = [
        Arc::new(origin_at(dir.path()).await),
        Arc::new(origin_at(dir.path()).await),
    ];

    let mut writers = JoinSet::new();
    for i in 0..6 {
        let origin = Arc::clone(&origins[i % 2]);
        writers.spawn(async move {
            let id = format!("tix-w{}", i);
            let doc = Ticket::new(id.clone(), id.clone(), "task".into(), State::from("ready"))
                .to_document()
                .unwrap();
            origin.write(&id, &doc, "concurrent").await.map(|_| id)
        });
    }

    let mut written = Vec::new();
    while let Some(result) = writers.join_next().await {
        match result.unwrap() {
            Ok(id) => written.push(id),
            Err(e) => assert!(
                matches!(e, Error::SyncConflict(SyncConflict::OriginAdvanced { .. })),
                "unexpected failure: {e:?}"
            ),
        }
    }
    written.sort();
    assert!(!written.is_empty());
    // Every write that reported success is on the branch, nothing else is
    assert_eq!(origins[0].list().await.unwrap(), written);
}

#[tokio::test]
async fn test_simultaneous_comments_both_land() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let alice = service(clone_at(dir.path(), "alice").await, dir.path(), "alice");
    let bob = service(clone_at(dir.path(), "bob").await, dir.path(), "bob");

    let id = alice.create(NewTicket::titled("Busy thread")).await.unwrap();
    let (a, b) = tokio::join!(
        alice.append_comment(&id, "alice", "from alice"),
        bob.append_comment(&id, "bob", "from bob"),
    );
    a.unwrap();
    b.unwrap();

    let origin = service(origin_at(dir.path()).await, dir.path(), "agent-1");
    let mut texts: Vec<_> = origin
        .read(&id)
        .await
        .unwrap()
        .comments
        .into_iter()
        .map(|c| c.text)
        .collect();
    texts.sort();
    assert_eq!(texts, vec!["from alice", "from bob"]);
}

#[tokio::test]
async fn test_clone_refuses_writes_over_unseen_commits() {
    let dir = tempfile::tempdir().unwrap();
    origin_at(dir.path()).await;
    let bob = clone_at(dir.path(), "bob").await;
    let base = bob.revision().await.unwrap();

    let doc = |title: &str| {
        Ticket::new("tix-c4s1".into(), title.into(), "task".into(), State::from("ready"))
            .to_document()
            .unwrap()
    };
    bob.write("tix-c4s1", &doc("First"), "first").await.unwrap();
    let head = bob.revision().await.unwrap();

    let err = bob
        .write_from(&base, "tix-c4s1", &doc("Stale"), "stale")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SyncConflict(SyncConflict::OriginAdvanced { .. })
    ));
    assert_eq!(bob.revision().await.unwrap(), head);

    bob.write_from(&head, "tix-c4s1", &doc("Fresh"), "fresh")
        .await
        .unwrap();
    let ticket = Ticket::from_document("tix-c4s1", &bob.read("tix-c4s1").await.unwrap()).unwrap();
    assert_eq!(ticket.title, "Fresh");
}

#[tokio::test]
async fn test_origin_delete() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin_at(dir.path()).await;
    let doc = Ticket::new("tix-d3l1".into(), "Gone".into(), "task".into(), State::from("ready"))
        .to_document()
        .unwrap();
    origin.write("tix-d3l1", &doc, "add").await.unwrap();

    origin.delete("tix-d3l1", "remove").await.unwrap();
    assert!(matches!(
        origin.read("tix-d3l1").await,
        Err(Error::NotFound(_))
    ));
    assert!(origin.list().await.unwrap().is_empty());
    assert!(matches!(
        origin.delete("tix-d3l1", "again").await,
        Err(Error::NotFound(_))
    ));

    let messages: Vec<_> = origin
        .history("tix-d3l1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(messages, vec!["remove", "add"]);
}

#[tokio::test]
async fn test_clone_delete_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin_at(dir.path()).await;
    let bob = clone_at(dir.path(), "bob").await;
    let doc = Ticket::new("tix-d3l2".into(), "Gone".into(), "task".into(), State::from("ready"))
        .to_document()
        .unwrap();
    bob.write("tix-d3l2", &doc, "add").await.unwrap();
    bob.push("add").await.unwrap();
    assert_eq!(origin.list().await.unwrap(), vec!["tix-d3l2"]);

    bob.delete("tix-d3l2", "remove").await.unwrap();
    assert!(matches!(bob.read("tix-d3l2").await, Err(Error::NotFound(_))));
    assert!(matches!(
        bob.delete("tix-d3l2", "again").await,
        Err(Error::NotFound(_))
    ));
    bob.push("remove").await.unwrap();

    assert!(origin.list().await.unwrap().is_empty());
    let messages: Vec<_> = origin
        .history("tix-d3l2")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(messages, vec!["remove", "add"]);
}
