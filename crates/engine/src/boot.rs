//! Leader construction: schema migration, rehydration and the optional
//! blocking initial sync.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::time::Instant;

use eventsync_core::{
    AbortOnMissingRequirement, FactsSnapshot, RebaseStrategy, SequenceNumber, facts_for_event,
};
use eventsync_storage::{SqliteStore, Storage};
use tracing::{info, warn};

use crate::applier::{Applier, LogMode};
use crate::backend::SyncBackend;
use crate::config::{InitialSyncOptions, SyncConfig};
use crate::error::EngineError;
use crate::leader::{ConnectionState, LeaderSyncProcessor, SyncState};

/// Progress reported while booting, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootStatus {
    Loading,
    /// The stored state tables belong to another schema and are recreated.
    Migrating { from: Option<u64>, to: u64 },
    Rehydrating { done: usize, total: usize },
    Syncing { pulled: usize, remaining: u64 },
    Done,
}

pub struct LeaderBuilder {
    store: SqliteStore,
    backend: Option<Box<dyn SyncBackend>>,
    config: SyncConfig,
    strategy: Box<dyn RebaseStrategy>,
    status: Option<Sender<BootStatus>>,
}

impl LeaderBuilder {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            backend: None,
            config: SyncConfig::default(),
            strategy: Box::new(AbortOnMissingRequirement),
            status: None,
        }
    }

    pub fn backend(mut self, backend: impl SyncBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rebase_strategy(mut self, strategy: impl RebaseStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn boot_status(mut self, sender: Sender<BootStatus>) -> Self {
        self.status = Some(sender);
        self
    }

    pub fn boot(self) -> Result<LeaderSyncProcessor, EngineError> {
        let Self {
            store,
            backend,
            config,
            strategy,
            status,
        } = self;
        config.validate()?;
        let report = |stage: BootStatus| {
            if let Some(tx) = &status {
                let _ = tx.send(stage);
            }
        };

        report(BootStatus::Loading);
        let upstream_head = store.head()?;
        let stored_hash = store.stored_schema_hash()?;
        let migrate = !store.schema_matches()?;
        let schema_hash = store.schema().hash();
        info!(head = %upstream_head, events = store.event_count()?, "booting leader");

        let mut leader = LeaderSyncProcessor {
            store,
            backend,
            applier: Applier::new(config.consistency),
            config,
            strategy,
            state: SyncState::new(upstream_head),
            connection: ConnectionState::default(),
            local_queue: VecDeque::new(),
            subscribers: Vec::new(),
            shut_down: false,
        };

        if migrate {
            report(BootStatus::Migrating {
                from: stored_hash,
                to: schema_hash,
            });
            info!(from = ?stored_hash, to = schema_hash, "state schema changed, migrating");
            let total = leader.rehydrate(false, |done, total| {
                report(BootStatus::Rehydrating { done, total })
            })?;
            info!(events = total, "rehydrated state from the event log");
        }
        leader.load_state()?;

        if leader.ensure_connected()
            && let InitialSyncOptions::Blocking { timeout } = leader.config.initial_sync
        {
            report(BootStatus::Syncing {
                pulled: 0,
                remaining: 0,
            });
            let deadline = Instant::now() + timeout;
            match leader.pull_pages(Some(deadline), |pulled, remaining| {
                report(BootStatus::Syncing { pulled, remaining })
            }) {
                Ok(pulled) => info!(pulled, "initial sync finished"),
                Err(EngineError::RebaseConflict(conflicts)) => {
                    warn!(conflicts = conflicts.len(), "initial sync stopped at a rebase conflict");
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "initial sync failed, continuing offline");
                }
                Err(e) => return Err(e),
            }
        }

        report(BootStatus::Done);
        info!(
            head = %leader.state.upstream_head,
            local_head = %leader.state.local_head,
            pending = leader.state.pending.len(),
            online = leader.connection.online,
            "leader running"
        );
        Ok(leader)
    }
}

impl LeaderSyncProcessor {
    pub fn builder(store: SqliteStore) -> LeaderBuilder {
        LeaderBuilder::new(store)
    }

    /// Rebuilds the state tables from the event log. In checked mode every
    /// event that still has a recorded materializer hash is verified against
    /// it. Returns the number of events replayed.
    pub fn rematerialize(&mut self) -> Result<usize, EngineError> {
        self.ensure_running()?;
        self.drain_local_queue()?;
        let total = self.rehydrate(true, |_, _| {})?;
        self.load_state()?;
        Ok(total)
    }

    pub(crate) fn rehydrate(
        &mut self,
        keep_hashes: bool,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<usize, EngineError> {
        let mut events = self.store.events_since(SequenceNumber::ROOT)?;
        let total = events.len();
        let head = self.state.upstream_head;
        let prune = self.config.prune_confirmed_changesets;

        self.transaction(|this| {
            this.store.recreate_state()?;
            for (i, event) in events.iter_mut().enumerate() {
                if !keep_hashes {
                    event.meta.materializer_hash = None;
                }
                this.applier.apply(&mut this.store, event, LogMode::Skip)?;
                progress(i + 1, total);
            }
            if prune {
                this.store.delete_changesets_up_to(head)?;
            }
            Ok(())
        })?;
        Ok(total)
    }

    /// Reads heads, pending events and the confirmed facts from storage.
    pub(crate) fn load_state(&mut self) -> Result<(), EngineError> {
        let events = self.store.events_since(SequenceNumber::ROOT)?;
        let head = self.state.upstream_head;
        let split = events.partition_point(|e| e.seq_num <= head);

        let mut facts = FactsSnapshot::new();
        for event in &events[..split] {
            let def = self.store.schema().event(&event.name)?;
            let group = facts_for_event(def, event, &facts)?;
            facts.apply(&group);
        }

        let pending = events[split..].to_vec();
        if let Some(event) = pending.iter().find(|e| e.meta.session_changeset.is_unset()) {
            return Err(EngineError::Unexpected(format!(
                "pending event {} has no recorded changeset",
                event.seq_num
            )));
        }

        self.state.local_head = self.store.local_head()?;
        self.state.upstream_facts = facts;
        self.state.pending = pending;
        Ok(())
    }
}
