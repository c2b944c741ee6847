use eventsync_core::{ConflictKind, SequenceNumber, SqlValue};
use eventsync_engine::{EngineError, PullPayload};
use eventsync_harness::schemas::*;
use eventsync_harness::{MemoryServer, TestClient, init_tracing};
use eventsync_storage::Storage;
use serde_json::json;

fn seq(global: u64) -> SequenceNumber {
    SequenceNumber::global_only(global)
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn overlapping_counter_edits_replay() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit("add", json!({"n": 2}))?;
    b.commit("multiply", json!({"n": 3}))?;
    a.sync()?;
    b.sync()?;
    a.sync()?;

    // b's multiply now runs after a's add
    assert_eq!(counter_value(a.leader.store())?, 6);
    assert_eq!(counter_value(b.leader.store())?, 6);
    assert_eq!(a.leader.store().export_state()?, b.leader.store().export_state()?);
    Ok(())
}

#[test]
fn rebase_preserves_pending_order() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = bookmarks_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://1", "one"))?;
    a.sync()?;
    b.sync()?;

    b.commit(BOOKMARK_CREATED, bookmark_created_args("b2", "https://2", "two"))?;
    b.commit(UI_STATE_SET, json!({"filter": "mine"}))?;
    b.commit(BOOKMARK_CREATED, bookmark_created_args("b3", "https://3", "three"))?;
    a.commit(BOOKMARK_CREATED, bookmark_created_args("b4", "https://4", "four"))?;
    a.sync()?;

    let rx = b.leader.pull_queue(b.leader.local_head())?;
    b.sync()?;

    let log: Vec<(SequenceNumber, String)> = b
        .leader
        .store()
        .events_since(SequenceNumber::ROOT)?
        .into_iter()
        .map(|e| {
            let id = e.args["id"].as_str().unwrap_or("ui").to_string();
            (e.seq_num, id)
        })
        .collect();
    assert_eq!(
        log,
        vec![
            (seq(1), "b1".to_string()),
            (seq(2), "b4".to_string()),
            (seq(3), "b2".to_string()),
            (SequenceNumber::new(3, 1), "ui".to_string()),
            (seq(4), "b3".to_string()),
        ]
    );

    let item = rx.try_recv()?;
    match item.payload {
        PullPayload::Rebase { rollback, new } => {
            assert_eq!(rollback.len(), 3);
            assert_eq!(rollback[0].seq_num, seq(2));
            let new: Vec<SequenceNumber> = new.iter().map(|e| e.seq_num).collect();
            assert_eq!(new, vec![seq(2), seq(3), SequenceNumber::new(3, 1), seq(4)]);
        }
        other => panic!("expected a rebase, got {other:?}"),
    }

    a.sync()?;
    assert_eq!(server.head(), seq(4));
    assert_eq!(a.rows("bookmarks")?.len(), 4);
    assert_eq!(b.rows("bookmarks")?.len(), 4);
    assert!(a.rows("ui_state")?.is_empty());
    Ok(())
}

#[test]
fn concurrent_creates_of_distinct_bookmarks_do_not_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = bookmarks_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit(BOOKMARK_CREATED, bookmark_created_args("x", "https://x", "X"))?;
    b.commit(BOOKMARK_CREATED, bookmark_created_args("y", "https://y", "Y"))?;
    b.commit(BOOKMARK_UPDATED, json!({"id": "y", "title": "Y2"}))?;
    a.sync()?;
    let report = b.sync()?;
    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 2);

    a.sync()?;
    let rows = a.rows("bookmarks")?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("title"), Some(&SqlValue::from("Y2")));
    Ok(())
}

// ============================================================================
// Missing requirements
// ============================================================================

#[test]
fn missing_requirement_keeps_local_event() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = MemoryServer::new();
    let schema = bookmarks_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://1", "one"))?;
    a.sync()?;
    b.sync()?;

    a.commit(BOOKMARK_DELETED, json!({"id": "b1"}))?;
    a.sync()?;
    let renamed = b.commit(BOOKMARK_UPDATED, json!({"id": "b1", "title": "renamed"}))?;
    assert_eq!(renamed.seq_num, seq(2));

    let err = b.leader.run_until_idle().unwrap_err();
    let EngineError::RebaseConflict(conflicts) = err else {
        panic!("expected a rebase conflict, got {err:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local, seq(2));
    assert_eq!(conflicts[0].remote, Some(seq(2)));
    assert_eq!(
        conflicts[0].kind,
        ConflictKind::MissingRequirement {
            key: bookmark_exists("b1")
        }
    );

    // nothing was discarded or advanced
    assert_eq!(b.leader.pending_events().len(), 1);
    assert_eq!(b.leader.upstream_head(), seq(1));
    assert_eq!(b.leader.store().head()?, seq(1));
    let rows = b.rows("bookmarks")?;
    assert_eq!(rows[0].get("title"), Some(&SqlValue::from("renamed")));

    // stays blocked until resolved
    assert!(matches!(
        b.leader.tick(),
        Err(EngineError::RebaseConflict(_))
    ));

    let discarded = b.leader.discard_pending_from(renamed.seq_num)?;
    assert_eq!(discarded.len(), 1);
    assert!(discarded[0].same_payload(&renamed));

    b.sync()?;
    assert!(b.rows("bookmarks")?.is_empty());
    assert_eq!(b.leader.upstream_head(), seq(2));
    assert_eq!(b.session.head(), seq(2));
    assert_eq!(server.head(), seq(2));
    Ok(())
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn discard_restores_exact_state() -> Result<(), Box<dyn std::error::Error>> {
    let schema = bookmarks_schema()?;
    let mut client = TestClient::local(&schema)?;
    client.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://1", "one"))?;
    client.commit(UI_STATE_SET, json!({"filter": "a"}))?;
    let before = client.leader.store().export_state()?;
    let head = client.leader.local_head();

    let first = client.commit(BOOKMARK_UPDATED, json!({"id": "b1", "title": "uno"}))?;
    client.commit(BOOKMARK_CREATED, bookmark_created_args("b2", "https://2", "two"))?;
    client.commit(UI_STATE_SET, json!({"filter": "b"}))?;
    client.commit(BOOKMARK_DELETED, json!({"id": "b1"}))?;
    assert_ne!(client.leader.store().export_state()?, before);

    let discarded = client.leader.discard_pending_from(first.seq_num)?;
    assert_eq!(discarded.len(), 4);
    assert_eq!(client.leader.store().export_state()?, before);
    assert_eq!(client.leader.local_head(), head);
    assert_eq!(client.leader.store().local_head()?, head);

    client.session.sync();
    assert_eq!(client.session.head(), head);
    let next = client.commit(BOOKMARK_CREATED, bookmark_created_args("b3", "https://3", "three"))?;
    assert_eq!(next.seq_num, seq(2));
    Ok(())
}

#[test]
fn discard_past_pending_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    client.commit("add", json!({"n": 1}))?;
    let counter = client.leader.merge_counter();
    assert!(client.leader.discard_pending_from(seq(5))?.is_empty());
    assert_eq!(client.leader.merge_counter(), counter);
    assert_eq!(client.leader.pending_events().len(), 1);
    Ok(())
}
