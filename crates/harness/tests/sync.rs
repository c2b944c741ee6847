use std::sync::mpsc;
use std::time::Duration;

use eventsync_core::{CoreError, Event, SequenceNumber, SessionId, SqlValue, rebase_events};
use eventsync_engine::{
    BootStatus, EngineError, InitialSyncOptions, LeaderSyncProcessor, PullPayload, PushOptions,
    SyncBackend,
};
use eventsync_harness::schemas::*;
use eventsync_harness::{MemoryServer, TestClient, TestSession, init_tracing, test_config};
use eventsync_storage::{SqliteStore, Storage};
use serde_json::json;

fn seq(global: u64) -> SequenceNumber {
    SequenceNumber::global_only(global)
}

// ============================================================================
// Local push
// ============================================================================

#[test]
fn stale_push_reports_minimum_expected() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    client.commit("add", json!({"n": 1}))?;
    client.commit("add", json!({"n": 1}))?;

    let stale = Event::new(
        "add",
        json!({"n": 5}),
        seq(2),
        seq(1),
        client.session.client_id,
        client.session.session_id,
    );
    let err = client.leader.push(vec![stale], PushOptions::wait()).unwrap_err();
    match err {
        EngineError::LeaderAhead {
            minimum_expected,
            provided,
        } => {
            assert_eq!(minimum_expected, seq(3));
            assert_eq!(provided, seq(2));
        }
        other => panic!("expected LeaderAhead, got {other:?}"),
    }
    assert_eq!(counter_value(client.leader.store())?, 2);
    Ok(())
}

#[test]
fn second_session_recovers_from_leader_ahead() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    let client_id = client.session.client_id;
    let mut other = TestSession::attach(&mut client.leader, client_id)?;

    client.commit("add", json!({"n": 1}))?;

    // `other` has not seen e1 yet
    let event = other.next_event(&schema, "add", json!({"n": 10}))?;
    assert!(matches!(
        client.leader.push(vec![event], PushOptions::wait()),
        Err(EngineError::LeaderAhead { .. })
    ));

    let committed = other.commit(&mut client.leader, "add", json!({"n": 10}))?;
    assert_eq!(committed.seq_num, seq(2));
    assert_eq!(counter_value(client.leader.store())?, 11);
    Ok(())
}

#[test]
fn invalid_batches_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let schema = bookmarks_schema()?;
    let mut client = TestClient::local(&schema)?;
    let session = &client.session;

    let created = session.next_event(&schema, BOOKMARK_CREATED, bookmark_created_args("b1", "u", "t"))?;

    assert!(matches!(
        client.leader.push(Vec::new(), PushOptions::wait()),
        Err(EngineError::InvalidBatch(_))
    ));

    let too_many = rebase_events(&vec![created.clone(); 101], SequenceNumber::ROOT);
    assert!(matches!(
        client.leader.push(too_many, PushOptions::wait()),
        Err(EngineError::InvalidBatch(_))
    ));

    let mut foreign = created.rebased(seq(2), seq(1));
    foreign.client_id = eventsync_core::ClientId::new();
    assert!(matches!(
        client.leader.push(vec![created.clone(), foreign], PushOptions::wait()),
        Err(EngineError::InvalidBatch(_))
    ));

    let gap = created.rebased(seq(3), seq(2));
    assert!(matches!(
        client.leader.push(vec![created.clone(), gap], PushOptions::wait()),
        Err(EngineError::InvalidBatch(_))
    ));

    // a client-only event must carry a client-only sequence number
    let mut ui = created.clone();
    ui.name = UI_STATE_SET.to_string();
    ui.args = json!({"filter": "x"});
    assert!(matches!(
        client.leader.push(vec![ui], PushOptions::wait()),
        Err(EngineError::InvalidBatch(_))
    ));

    let mut unknown = created.clone();
    unknown.name = "v1.BookmarkArchived".to_string();
    assert!(matches!(
        client.leader.push(vec![unknown], PushOptions::wait()),
        Err(EngineError::Core(CoreError::UnknownEvent(_)))
    ));

    assert_eq!(client.leader.store().event_count()?, 0);
    client.leader.push(vec![created], PushOptions::wait())?;
    assert_eq!(client.leader.store().event_count()?, 1);
    Ok(())
}

#[test]
fn queued_batches_apply_on_tick() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    let session = &client.session;

    let first = session.next_event(&schema, "add", json!({"n": 2}))?;
    let second = Event::new(
        "multiply",
        json!({"n": 5}),
        seq(2),
        seq(1),
        session.client_id,
        session.session_id,
    );
    client.leader.push(vec![first], PushOptions::default())?;
    client.leader.push(vec![second], PushOptions::default())?;
    assert_eq!(client.leader.status().queued, 2);
    assert_eq!(counter_value(client.leader.store())?, 0);

    let report = client.leader.tick()?;
    assert_eq!(report.applied, 2);
    assert_eq!(client.leader.status().queued, 0);
    assert_eq!(client.leader.local_head(), seq(2));
    assert_eq!(counter_value(client.leader.store())?, 10);
    Ok(())
}

// ============================================================================
// Backend sync
// ============================================================================

#[test]
fn two_clients_converge() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit("add", json!({"n": 2}))?;
    let report = a.sync()?;
    assert_eq!(report.pushed, 1);

    b.commit("add", json!({"n": 3}))?;
    b.sync()?;
    a.sync()?;

    assert_eq!(server.head(), seq(2));
    for client in [&a, &b] {
        assert_eq!(counter_value(client.leader.store())?, 5);
        assert_eq!(client.leader.upstream_head(), seq(2));
        assert!(client.leader.pending_events().is_empty());
    }
    assert_eq!(b.session.head(), seq(2));
    assert_eq!(a.session.head(), seq(2));
    Ok(())
}

#[test]
fn pushes_are_split_into_batches() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let config = test_config().with_push_batch_size(2);
    let mut client = TestClient::with_config(&schema, Some(&server), config)?;
    for _ in 0..5 {
        client.commit("add", json!({"n": 1}))?;
    }
    let report = client.sync()?;
    assert_eq!(report.pushed, 5);
    assert_eq!(server.push_count(), 3);
    assert_eq!(server.head(), seq(5));
    Ok(())
}

#[test]
fn offline_commits_sync_after_reconnect() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    server.set_online(false);
    let schema = counter_schema()?;
    let mut client = TestClient::new(&schema, &server)?;

    client.commit("add", json!({"n": 1}))?;
    client.commit("add", json!({"n": 2}))?;
    client.sync()?;

    let status = client.leader.status();
    assert!(!status.online);
    assert_eq!(status.pending, 2);
    assert!(status.retry_attempt >= 1);
    assert_eq!(server.head(), SequenceNumber::ROOT);
    assert_eq!(counter_value(client.leader.store())?, 3);

    server.set_online(true);
    let report = client.sync()?;
    assert_eq!(report.pushed, 2);

    let status = client.leader.status();
    assert!(status.online);
    assert_eq!(status.pending, 0);
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(status.upstream_head, seq(2));
    assert_eq!(server.head(), seq(2));
    Ok(())
}

#[test]
fn client_only_events_stay_local() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = bookmarks_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://a", "A"))?;
    let ui = a.commit(UI_STATE_SET, json!({"filter": "docs"}))?;
    assert_eq!(ui.seq_num, SequenceNumber::new(1, 1));
    let second = a.commit(BOOKMARK_CREATED, bookmark_created_args("b2", "https://b", "B"))?;
    assert_eq!(second.seq_num, seq(2));
    assert_eq!(second.parent_seq_num, SequenceNumber::new(1, 1));

    a.sync()?;
    let pushed = server.events();
    assert_eq!(pushed.len(), 2);
    assert!(pushed.iter().all(|e| e.name == BOOKMARK_CREATED));
    assert_eq!(pushed[1].parent_seq_num, 1);
    assert!(a.leader.pending_events().is_empty());

    b.sync()?;
    assert_eq!(b.rows("bookmarks")?.len(), 2);
    assert!(b.rows("ui_state")?.is_empty());
    assert_eq!(a.rows("ui_state")?.len(), 1);
    Ok(())
}

#[test]
fn client_only_event_follows_remote_head() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = bookmarks_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let mut b = TestClient::new(&schema, &server)?;

    a.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://a", "A"))?;
    a.sync()?;
    b.sync()?;

    b.commit(UI_STATE_SET, json!({"filter": "docs"}))?;
    a.commit(BOOKMARK_CREATED, bookmark_created_args("b2", "https://b", "B"))?;
    a.sync()?;
    b.sync()?;

    let pending: Vec<SequenceNumber> =
        b.leader.pending_events().iter().map(|e| e.seq_num).collect();
    assert_eq!(pending, vec![SequenceNumber::new(2, 1)]);
    assert_eq!(b.session.head(), SequenceNumber::new(2, 1));
    assert_eq!(b.rows("bookmarks")?.len(), 2);
    let ui = b.rows("ui_state")?;
    assert_eq!(ui[0].get("filter"), Some(&SqlValue::from("docs")));
    assert_eq!(server.head(), seq(2));
    Ok(())
}

// ============================================================================
// Pull queues
// ============================================================================

#[test]
fn pull_queue_gets_catch_up_then_merges() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    client.commit("add", json!({"n": 1}))?;
    client.commit("add", json!({"n": 2}))?;

    let rx = client.leader.pull_queue(SequenceNumber::ROOT)?;
    let catch_up = rx.try_recv()?;
    assert_eq!(catch_up.merge_counter, 2);
    match &catch_up.payload {
        PullPayload::Advance { events } => assert_eq!(events.len(), 2),
        other => panic!("unexpected payload {other:?}"),
    }

    let from_head = client.leader.pull_queue(seq(2))?;
    assert!(from_head.try_recv().is_err());

    client.commit("add", json!({"n": 3}))?;
    let item = rx.try_recv()?;
    assert_eq!(item.merge_counter, 3);
    assert_eq!(item.payload.new_head(), Some(seq(3)));
    assert_eq!(from_head.try_recv()?, item);

    let exclusive = client.leader.pull(seq(1))?;
    match exclusive.payload {
        PullPayload::Advance { events } => {
            let seqs: Vec<_> = events.iter().map(|e| e.seq_num).collect();
            assert_eq!(seqs, vec![seq(2), seq(3)]);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    Ok(())
}

#[test]
fn shutdown_closes_queues() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut client = TestClient::new(&schema, &server)?;
    let rx = client.leader.pull_queue(SequenceNumber::ROOT)?;

    let event = client.session.next_event(&schema, "add", json!({"n": 4}))?;
    client.leader.push(vec![event], PushOptions::default())?;
    client.leader.shutdown()?;

    // the queued batch was applied before the queues closed
    assert!(rx.recv().is_ok());
    assert!(rx.recv().is_err());
    assert_eq!(counter_value(client.leader.store())?, 4);
    assert!(client.leader.status().shut_down);
    assert!(matches!(client.leader.tick(), Err(EngineError::Shutdown)));
    assert!(matches!(
        client.commit("add", json!({"n": 1})),
        Err(EngineError::Shutdown)
    ));
    Ok(())
}

// ============================================================================
// Boot
// ============================================================================

#[test]
fn blocking_initial_sync_reports_progress() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut writer = TestClient::new(&schema, &server)?;
    for n in 1..=3 {
        writer.commit("add", json!({ "n": n }))?;
    }
    writer.sync()?;

    let (tx, rx) = mpsc::channel();
    let config = test_config()
        .with_pull_batch_size(2)
        .with_initial_sync(InitialSyncOptions::Blocking {
            timeout: Duration::from_secs(5),
        });
    let leader = LeaderSyncProcessor::builder(SqliteStore::open_in_memory(&schema)?)
        .backend(server.backend())
        .config(config)
        .boot_status(tx)
        .boot()?;

    let stages: Vec<BootStatus> = rx.try_iter().collect();
    assert_eq!(
        stages,
        vec![
            BootStatus::Loading,
            BootStatus::Syncing {
                pulled: 0,
                remaining: 0
            },
            BootStatus::Syncing {
                pulled: 2,
                remaining: 1
            },
            BootStatus::Syncing {
                pulled: 3,
                remaining: 0
            },
            BootStatus::Done,
        ]
    );
    assert_eq!(leader.upstream_head(), seq(3));
    assert_eq!(counter_value(leader.store())?, 6);
    Ok(())
}

#[test]
fn boot_proceeds_offline() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    server.set_online(false);
    let schema = counter_schema()?;
    let config = test_config().with_initial_sync(InitialSyncOptions::Blocking {
        timeout: Duration::from_millis(50),
    });
    let leader = LeaderSyncProcessor::builder(SqliteStore::open_in_memory(&schema)?)
        .backend(server.backend())
        .config(config)
        .boot()?;
    assert!(!leader.is_online());
    assert_eq!(leader.status().retry_attempt, 1);
    Ok(())
}

#[test]
fn authority_behind_local_head_is_retried_offline() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let old_server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut client = TestClient::new(&schema, &old_server)?;
    client.commit("add", json!({"n": 1}))?;
    client.commit("add", json!({"n": 1}))?;
    client.sync()?;
    assert_eq!(client.leader.upstream_head(), seq(2));
    let store = client.leader.into_store();

    // a fresh authority that has lost our history
    let server = MemoryServer::new();
    let config = test_config().with_initial_sync(InitialSyncOptions::Blocking {
        timeout: Duration::from_millis(50),
    });
    let mut client = TestClient::from_store(store, Some(&server), config)?;
    let status = client.leader.status();
    assert!(!status.online);
    assert_eq!(status.retry_attempt, 1);

    client.leader.tick()?;
    assert!(!client.leader.is_online());
    assert_eq!(client.leader.status().retry_attempt, 2);

    // local work goes on while offline
    client.commit("add", json!({"n": 5}))?;
    client.sync()?;
    assert_eq!(client.leader.pending_events().len(), 1);
    assert_eq!(counter_value(client.leader.store())?, 7);

    let mut restore = server.backend();
    restore.connect()?;
    restore.push(&old_server.events())?;

    client.sync()?;
    let status = client.leader.status();
    assert!(status.online);
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(status.pending, 0);
    assert_eq!(server.head(), seq(3));
    Ok(())
}

#[test]
fn invalid_config_fails_boot() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let result = LeaderSyncProcessor::builder(SqliteStore::open_in_memory(&schema)?)
        .config(test_config().with_pull_batch_size(0))
        .boot();
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    Ok(())
}

#[test]
fn restart_resumes_pending_events() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("client.db");
    let server = MemoryServer::new();
    server.set_online(false);
    let schema = counter_schema()?;

    {
        let store = SqliteStore::open(&path, &schema)?;
        let mut client = TestClient::from_store(store, Some(&server), test_config())?;
        client.commit("add", json!({"n": 4}))?;
        client.commit("multiply", json!({"n": 3}))?;
        client.leader.shutdown()?;
    }

    server.set_online(true);
    let store = SqliteStore::open(&path, &schema)?;
    let mut client = TestClient::from_store(store, Some(&server), test_config())?;
    assert_eq!(client.leader.pending_events().len(), 2);
    assert_eq!(client.session.head(), seq(2));
    assert_eq!(counter_value(client.leader.store())?, 12);

    client.sync()?;
    assert_eq!(server.head(), seq(2));
    assert!(client.leader.pending_events().is_empty());
    assert_eq!(client.leader.store().head()?, seq(2));
    Ok(())
}

#[test]
fn schema_change_rehydrates_state() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("client.db");
    let v1 = bookmarks_schema()?;
    let v2 = bookmarks_schema_v2()?;

    {
        let store = SqliteStore::open(&path, &v1)?;
        let mut client = TestClient::from_store(store, None, test_config())?;
        client.commit(BOOKMARK_CREATED, bookmark_created_args("b1", "https://a", "A"))?;
        client.commit(BOOKMARK_CREATED, bookmark_created_args("b2", "https://b", "B"))?;
        client.commit(BOOKMARK_UPDATED, json!({"id": "b1", "title": "A2"}))?;
        client.commit(UI_STATE_SET, json!({"filter": "all"}))?;
    }

    let (tx, rx) = mpsc::channel();
    let leader = LeaderSyncProcessor::builder(SqliteStore::open(&path, &v2)?)
        .config(test_config())
        .boot_status(tx)
        .boot()?;

    let stages: Vec<BootStatus> = rx.try_iter().collect();
    assert_eq!(stages[0], BootStatus::Loading);
    assert_eq!(
        stages[1],
        BootStatus::Migrating {
            from: Some(v1.hash()),
            to: v2.hash()
        }
    );
    assert_eq!(stages[2], BootStatus::Rehydrating { done: 1, total: 4 });
    assert_eq!(stages[5], BootStatus::Rehydrating { done: 4, total: 4 });
    assert_eq!(stages.last(), Some(&BootStatus::Done));

    let store = leader.store();
    assert!(store.schema_matches()?);
    let bookmarks = store.rows("bookmarks")?;
    assert_eq!(bookmarks.len(), 2);
    assert_eq!(bookmarks[0].get("title"), Some(&SqlValue::from("A2")));
    assert!(bookmarks.iter().all(|row| row.get("visits") == Some(&SqlValue::from(0i64))));
    assert_eq!(store.rows("ui_state")?.len(), 1);
    assert_eq!(leader.pending_events().len(), 4);
    assert_eq!(store.event_count()?, 4);
    Ok(())
}

#[test]
fn rematerialize_reproduces_state() -> Result<(), Box<dyn std::error::Error>> {
    let schema = counter_schema()?;
    let mut client = TestClient::local(&schema)?;
    client.commit("add", json!({"n": 3}))?;
    client.commit("multiply", json!({"n": 4}))?;
    client.commit("add", json!({"n": -2}))?;
    let before = client.leader.store().export_state()?;

    assert_eq!(client.leader.rematerialize()?, 3);
    assert_eq!(client.leader.store().export_state()?, before);
    assert_eq!(counter_value(client.leader.store())?, 10);
    assert_eq!(client.leader.pending_events().len(), 3);
    Ok(())
}

#[test]
fn events_carry_session_identity() -> Result<(), Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let schema = counter_schema()?;
    let mut a = TestClient::new(&schema, &server)?;
    let event = a.commit("add", json!({"n": 1}))?;
    a.sync()?;

    let pushed = &server.events()[0];
    assert_eq!(pushed.client_id, a.session.client_id);
    assert_eq!(pushed.session_id, a.session.session_id);
    assert_ne!(pushed.session_id, SessionId::new());

    let mut b = TestClient::new(&schema, &server)?;
    b.sync()?;
    let received = b.leader.store().get_event(seq(1))?.unwrap();
    assert!(received.same_payload(&event));
    assert_eq!(received.meta.sync_metadata, Some(json!({"offset": 1})));
    Ok(())
}
