use std::sync::mpsc::Receiver;

use eventsync_core::{ClientId, Event, Row, Schema, SequenceNumber, SessionId};
use eventsync_engine::{
    ConsistencyMode, EngineError, LeaderSyncProcessor, PullItem, PushOptions, RetryConfig,
    SyncConfig, TickReport,
};
use eventsync_storage::{SqliteStore, StorageError};

use crate::server::MemoryServer;

/// A client session: creates events on top of the head it has seen and
/// follows the leader through a pull queue.
pub struct TestSession {
    pub client_id: ClientId,
    pub session_id: SessionId,
    head: SequenceNumber,
    queue: Receiver<PullItem>,
    merge_counter: u64,
}

impl TestSession {
    pub fn attach(leader: &mut LeaderSyncProcessor, client_id: ClientId) -> Result<Self, EngineError> {
        let head = leader.local_head();
        Ok(Self {
            client_id,
            session_id: SessionId::new(),
            head,
            queue: leader.pull_queue(head)?,
            merge_counter: leader.merge_counter(),
        })
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn merge_counter(&self) -> u64 {
        self.merge_counter
    }

    /// Consumes everything the leader has sent so far.
    pub fn sync(&mut self) -> Vec<PullItem> {
        let items: Vec<PullItem> = self.queue.try_iter().collect();
        for item in &items {
            if let Some(head) = item.payload.new_head() {
                self.head = head;
            }
            self.merge_counter = item.merge_counter;
        }
        items
    }

    /// Builds the next event on top of this session's head without pushing it.
    pub fn next_event(
        &self,
        schema: &Schema,
        name: &str,
        args: serde_json::Value,
    ) -> Result<Event, EngineError> {
        let client_only = schema.event(name)?.client_only;
        Ok(Event::new(
            name,
            args,
            self.head.next(client_only),
            self.head,
            self.client_id,
            self.session_id,
        ))
    }

    /// Commits one event and waits for the leader to apply it.
    pub fn commit(
        &mut self,
        leader: &mut LeaderSyncProcessor,
        name: &str,
        args: serde_json::Value,
    ) -> Result<Event, EngineError> {
        self.sync();
        let event = self.next_event(leader.schema(), name, args)?;
        leader.push(vec![event.clone()], PushOptions::wait())?;
        self.head = event.seq_num;
        Ok(event)
    }
}

/// One client: a leader over an in-memory store and its main session.
pub struct TestClient {
    pub leader: LeaderSyncProcessor,
    pub session: TestSession,
}

/// Checked consistency, retry on every tick.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_consistency(ConsistencyMode::Checked)
        .with_retry(RetryConfig::immediate())
}

impl TestClient {
    pub fn new(schema: &Schema, server: &MemoryServer) -> Result<Self, EngineError> {
        Self::with_config(schema, Some(server), test_config())
    }

    /// A client that never talks to a backend.
    pub fn local(schema: &Schema) -> Result<Self, EngineError> {
        Self::with_config(schema, None, test_config())
    }

    pub fn with_config(
        schema: &Schema,
        server: Option<&MemoryServer>,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        let store = SqliteStore::open_in_memory(schema)?;
        Self::from_store(store, server, config)
    }

    pub fn from_store(
        store: SqliteStore,
        server: Option<&MemoryServer>,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        let mut builder = LeaderSyncProcessor::builder(store).config(config);
        if let Some(server) = server {
            builder = builder.backend(server.backend());
        }
        let mut leader = builder.boot()?;
        let session = TestSession::attach(&mut leader, ClientId::new())?;
        Ok(Self { leader, session })
    }

    pub fn commit(&mut self, name: &str, args: serde_json::Value) -> Result<Event, EngineError> {
        self.session.commit(&mut self.leader, name, args)
    }

    /// Runs the leader until idle and lets the session catch up.
    pub fn sync(&mut self) -> Result<TickReport, EngineError> {
        let report = self.leader.run_until_idle()?;
        self.session.sync();
        Ok(report)
    }

    pub fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        self.leader.store().rows(table)
    }
}
