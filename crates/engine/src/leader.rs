use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::time::Instant;

use eventsync_core::{
    EncodedEvent, Event, FactsSnapshot, HistoryDag, RebaseDecision, RebaseStrategy, Schema,
    SequenceNumber, compact_events, detect_conflicts, facts_for_event, rebase_events,
};
use eventsync_storage::{SqliteStore, Storage, StorageError};
use tracing::{debug, error, info, warn};

use crate::applier::{Applier, LogMode};
use crate::backend::{BackendError, PullCursor, PulledEvent, SyncBackend};
use crate::config::{MAX_BATCH_SIZE, SyncConfig};
use crate::error::EngineError;
use crate::pull::{PullItem, PullPayload};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Apply the batch before returning instead of queueing it for the next tick.
    pub wait_for_processing: bool,
}

impl PushOptions {
    pub fn wait() -> Self {
        Self {
            wait_for_processing: true,
        }
    }
}

/// Point-in-time view of the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    pub upstream_head: SequenceNumber,
    pub local_head: SequenceNumber,
    pub pending: usize,
    pub queued: usize,
    pub merge_counter: u64,
    pub retry_attempt: u32,
    pub shut_down: bool,
}

/// What one `tick` accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Queued local events applied.
    pub applied: usize,
    /// Remote events received.
    pub pulled: usize,
    /// Pending events confirmed by a push.
    pub pushed: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.applied == 0 && self.pulled == 0 && self.pushed == 0
    }

    fn absorb(&mut self, other: TickReport) {
        self.applied += other.applied;
        self.pulled += other.pulled;
        self.pushed += other.pushed;
    }
}

pub(crate) struct SyncState {
    /// Last global sequence number confirmed by the backend.
    pub(crate) upstream_head: SequenceNumber,
    pub(crate) local_head: SequenceNumber,
    /// Applied but unconfirmed events, ascending. Client-only events stay
    /// here until a confirmed event overtakes them.
    pub(crate) pending: Vec<Event>,
    pub(crate) merge_counter: u64,
    /// Facts as of `upstream_head`.
    pub(crate) upstream_facts: FactsSnapshot,
    pub(crate) pull_metadata: Option<serde_json::Value>,
}

impl SyncState {
    pub(crate) fn new(upstream_head: SequenceNumber) -> Self {
        Self {
            upstream_head,
            local_head: upstream_head,
            pending: Vec::new(),
            merge_counter: 0,
            upstream_facts: FactsSnapshot::new(),
            pull_metadata: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) online: bool,
    pub(crate) attempt: u32,
    pub(crate) next_attempt: Option<Instant>,
}

/// Sole writer of the event log and the state tables.
///
/// Sessions push local events, the processor applies them and forwards the
/// synced ones to the backend; remote events are pulled, merged in front of
/// the pending local ones (rebasing those when needed) and fanned out to every
/// pull queue. All mutation goes through `&mut self`, one operation at a time.
pub struct LeaderSyncProcessor {
    pub(crate) store: SqliteStore,
    pub(crate) backend: Option<Box<dyn SyncBackend>>,
    pub(crate) config: SyncConfig,
    pub(crate) applier: Applier,
    pub(crate) strategy: Box<dyn RebaseStrategy>,
    pub(crate) state: SyncState,
    pub(crate) connection: ConnectionState,
    pub(crate) local_queue: VecDeque<Vec<Event>>,
    pub(crate) subscribers: Vec<Sender<PullItem>>,
    pub(crate) shut_down: bool,
}

impl LeaderSyncProcessor {
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn schema(&self) -> &Schema {
        self.store.schema()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn upstream_head(&self) -> SequenceNumber {
        self.state.upstream_head
    }

    pub fn local_head(&self) -> SequenceNumber {
        self.state.local_head
    }

    pub fn pending_events(&self) -> &[Event] {
        &self.state.pending
    }

    pub fn merge_counter(&self) -> u64 {
        self.state.merge_counter
    }

    pub fn is_online(&self) -> bool {
        self.connection.online
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.connection.online,
            upstream_head: self.state.upstream_head,
            local_head: self.state.local_head,
            pending: self.state.pending.len(),
            queued: self.local_queue.iter().map(Vec::len).sum(),
            merge_counter: self.state.merge_counter,
            retry_attempt: self.connection.attempt,
            shut_down: self.shut_down,
        }
    }

    /// Gives the store back, e.g. to reopen it with another schema.
    pub fn into_store(self) -> SqliteStore {
        self.store
    }

    fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.store
            .conn()
            .execute_batch(sql)
            .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
    }

    /// Runs `f` inside one write transaction. In-memory state must only be
    /// updated once this returns `Ok`.
    pub(crate) fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.exec_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.exec_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.exec_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shut_down {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }

    // ========================================================================
    // Local push
    // ========================================================================

    /// Accepts a batch of locally committed events from one session.
    ///
    /// The batch must hold 1 to 100 events of a single client, chained by
    /// parent and strictly ascending, starting right after the leader's
    /// head (including batches still queued). A batch at or below that head
    /// fails with `LeaderAhead`; the session has to pull and rebase first.
    pub fn push(&mut self, batch: Vec<Event>, options: PushOptions) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.validate_batch(&batch)?;

        let head = self.queued_head();
        let first = &batch[0];
        if first.seq_num <= head {
            debug!(provided = %first.seq_num, head = %head, "rejecting stale push");
            return Err(EngineError::LeaderAhead {
                minimum_expected: head.next(false),
                provided: first.seq_num,
            });
        }
        if first.parent_seq_num != head {
            return Err(EngineError::InvalidBatch(format!(
                "event {} has parent {}, leader head is {head}",
                first.seq_num, first.parent_seq_num
            )));
        }

        if options.wait_for_processing {
            self.drain_local_queue()?;
            self.apply_local(batch)?;
        } else {
            debug!(events = batch.len(), "queued local batch");
            self.local_queue.push_back(batch);
        }
        Ok(())
    }

    fn validate_batch(&self, batch: &[Event]) -> Result<(), EngineError> {
        if batch.is_empty() || batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::InvalidBatch(format!(
                "batch must hold 1 to {MAX_BATCH_SIZE} events, got {}",
                batch.len()
            )));
        }
        let client_id = batch[0].client_id;
        for pair in batch.windows(2) {
            if pair[1].seq_num <= pair[0].seq_num || pair[1].parent_seq_num != pair[0].seq_num {
                return Err(EngineError::InvalidBatch(format!(
                    "event {} does not follow {}",
                    pair[1].seq_num, pair[0].seq_num
                )));
            }
        }
        for event in batch {
            if event.client_id != client_id {
                return Err(EngineError::InvalidBatch(
                    "batch mixes events of several clients".to_string(),
                ));
            }
            let def = self.store.schema().event(&event.name)?;
            if def.client_only != event.is_client_only() {
                return Err(EngineError::InvalidBatch(format!(
                    "event {} ({}) has the wrong kind of sequence number",
                    event.seq_num, event.name
                )));
            }
        }
        Ok(())
    }

    fn queued_head(&self) -> SequenceNumber {
        self.local_queue
            .back()
            .and_then(|batch| batch.last())
            .map(|event| event.seq_num)
            .unwrap_or(self.state.local_head)
    }

    pub(crate) fn drain_local_queue(&mut self) -> Result<usize, EngineError> {
        let mut applied = 0;
        while let Some(batch) = self.local_queue.pop_front() {
            applied += self.apply_local(batch)?;
        }
        Ok(applied)
    }

    fn apply_local(&mut self, batch: Vec<Event>) -> Result<usize, EngineError> {
        let head = self.state.local_head;
        // A merge may have moved the head since the batch was queued.
        let batch = if batch[0].parent_seq_num == head {
            batch
        } else {
            debug!(from = %batch[0].seq_num, head = %head, "rechaining queued batch");
            rebase_events(&batch, head)
        };

        let applied = self.transaction(|this| {
            let mut applied = Vec::with_capacity(batch.len());
            for mut event in batch {
                this.applier.apply(&mut this.store, &mut event, LogMode::Append)?;
                applied.push(event);
            }
            Ok(applied)
        })?;

        let count = applied.len();
        if let Some(last) = applied.last() {
            self.state.local_head = last.seq_num;
        }
        self.state.pending.extend(applied.iter().cloned());
        self.state.merge_counter += 1;
        debug!(events = count, head = %self.state.local_head, "applied local events");
        self.emit(PullPayload::Advance { events: applied });
        Ok(count)
    }

    // ========================================================================
    // Backend sync
    // ========================================================================

    /// One round: apply queued local batches, pull from the backend, push
    /// pending events to it. Transport failures switch to offline mode and
    /// are retried on a later tick according to the retry schedule.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        self.ensure_running()?;
        let mut report = TickReport {
            applied: self.drain_local_queue()?,
            ..TickReport::default()
        };
        if !self.ensure_connected() {
            return Ok(report);
        }
        report.pulled = self.pull_pages(None, |_, _| {})?;
        if self.connection.online {
            report.pushed = self.push_to_backend()?;
        }
        Ok(report)
    }

    /// Ticks until nothing moves or the backend goes offline.
    pub fn run_until_idle(&mut self) -> Result<TickReport, EngineError> {
        let mut total = TickReport::default();
        loop {
            let report = self.tick()?;
            total.absorb(report);
            if report.is_idle() || !self.connection.online {
                return Ok(total);
            }
        }
    }

    pub(crate) fn ensure_connected(&mut self) -> bool {
        let Some(backend) = self.backend.as_mut() else {
            return false;
        };
        if self.connection.online && backend.is_connected() {
            return true;
        }
        if let Some(at) = self.connection.next_attempt
            && Instant::now() < at
        {
            return false;
        }
        match backend.connect() {
            Ok(()) => {
                // attempts are only forgiven once a pull goes through
                self.connection.online = true;
                self.connection.next_attempt = None;
                true
            }
            Err(e) => {
                self.mark_offline(&e);
                false
            }
        }
    }

    fn mark_offline(&mut self, err: &BackendError) {
        self.connection.online = false;
        self.connection.attempt = self.connection.attempt.saturating_add(1);
        let delay = self.config.retry.delay_for_attempt(self.connection.attempt);
        self.connection.next_attempt = Some(Instant::now() + delay);
        warn!(
            error = %err,
            attempt = self.connection.attempt,
            ?delay,
            "backend unavailable, continuing offline"
        );
    }

    /// Pulls pages until caught up, offline, or past `deadline`. `on_page`
    /// sees the running total and the backend's remaining count.
    pub(crate) fn pull_pages(
        &mut self,
        deadline: Option<Instant>,
        mut on_page: impl FnMut(usize, u64),
    ) -> Result<usize, EngineError> {
        let mut pulled = 0;
        loop {
            let cursor = (!self.state.upstream_head.is_root()
                || self.state.pull_metadata.is_some())
            .then(|| PullCursor {
                cursor: self.state.upstream_head,
                metadata: self.state.pull_metadata.clone(),
            });
            let limit = self.config.pull_batch_size;
            let Some(backend) = self.backend.as_mut() else {
                break;
            };
            let page = match backend.pull(cursor.as_ref(), limit) {
                Ok(page) => page,
                Err(e) if e.is_retryable() => {
                    self.mark_offline(&e);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "backend rejected pull");
                    return Err(e.into());
                }
            };
            if page.batch.is_empty() {
                break;
            }

            let count = page.batch.len();
            let remaining = page.remaining;
            match self.merge_remote(page.batch) {
                Ok(()) => {}
                Err(EngineError::Backend(e)) if e.is_retryable() => {
                    self.mark_offline(&e);
                    break;
                }
                Err(e) => return Err(e),
            }
            pulled += count;
            on_page(pulled, remaining);

            if remaining == 0 || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
        if self.connection.online && self.connection.attempt > 0 {
            info!(attempts = self.connection.attempt, "backend reconnected");
            self.connection.attempt = 0;
        }
        Ok(pulled)
    }

    fn push_to_backend(&mut self) -> Result<usize, EngineError> {
        let mut pushed = 0;
        let mut pulled_after_reject = false;
        loop {
            let batch: Vec<EncodedEvent> = self
                .state
                .pending
                .iter()
                .filter(|e| !e.is_client_only())
                .take(self.config.push_batch_size)
                .map(Event::encode)
                .collect();
            let Some(last) = batch.last().map(EncodedEvent::seq_num) else {
                break;
            };
            let Some(backend) = self.backend.as_mut() else {
                break;
            };

            match backend.push(&batch) {
                Ok(()) => {
                    self.confirm_pending(last, Vec::new())?;
                    pushed += batch.len();
                    pulled_after_reject = false;
                    debug!(events = batch.len(), head = %last, "pushed events");
                }
                Err(e) if e.is_server_ahead() => {
                    if pulled_after_reject {
                        warn!(error = %e, "backend still ahead after pulling, retrying next tick");
                        break;
                    }
                    debug!(error = %e, "backend is ahead, pulling before pushing again");
                    pulled_after_reject = true;
                    self.pull_pages(None, |_, _| {})?;
                    if !self.connection.online {
                        break;
                    }
                }
                Err(e) if e.is_retryable() => {
                    self.mark_offline(&e);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "backend rejected push");
                    return Err(e.into());
                }
            }
        }
        Ok(pushed)
    }

    // ========================================================================
    // Merging remote events
    // ========================================================================

    fn merge_remote(&mut self, batch: Vec<PulledEvent>) -> Result<(), EngineError> {
        let upstream = self.state.upstream_head;
        let mut remote: Vec<Event> = batch
            .into_iter()
            .map(|pulled| pulled.event.decode(pulled.metadata))
            .filter(|event| event.seq_num > upstream)
            .collect();
        if remote.is_empty() {
            return Ok(());
        }

        let mut expected_parent = upstream;
        for event in &remote {
            if event.parent_seq_num != expected_parent {
                error!(seq_num = %event.seq_num, expected = %expected_parent, "remote events out of order");
                return Err(BackendError::InvalidPull(format!(
                    "event {} does not follow {expected_parent}",
                    event.seq_num
                ))
                .into());
            }
            expected_parent = event.seq_num;
        }

        // Our own pending events coming back confirmed.
        let echoed = self
            .state
            .pending
            .iter()
            .filter(|e| !e.is_client_only())
            .zip(&remote)
            .take_while(|(local, incoming)| {
                local.seq_num == incoming.seq_num && local.same_payload(incoming)
            })
            .count();
        if echoed > 0 {
            let confirmed: Vec<Event> = remote.drain(..echoed).collect();
            let head = confirmed[echoed - 1].seq_num;
            let metadata = confirmed
                .into_iter()
                .filter_map(|e| e.meta.sync_metadata.map(|m| (e.seq_num, m)))
                .collect();
            self.confirm_pending(head, metadata)?;
            if remote.is_empty() {
                return Ok(());
            }
        }

        if self.state.pending.is_empty() {
            self.fast_forward(remote)
        } else {
            self.rebase_onto(remote)
        }
    }

    /// Marks pending events up to `head` as confirmed.
    fn confirm_pending(
        &mut self,
        head: SequenceNumber,
        metadata: Vec<(SequenceNumber, serde_json::Value)>,
    ) -> Result<(), EngineError> {
        let prune = self.config.prune_confirmed_changesets;
        self.transaction(|this| {
            for (seq_num, value) in &metadata {
                this.store.set_sync_metadata(*seq_num, Some(value))?;
            }
            this.store.update_head(head)?;
            if prune {
                this.store.delete_changesets_up_to(head)?;
            }
            Ok(())
        })?;

        let split = self.state.pending.partition_point(|e| e.seq_num <= head);
        let confirmed: Vec<Event> = self.state.pending.drain(..split).collect();
        self.state.upstream_head = head;
        if let Some((_, value)) = metadata.into_iter().last() {
            self.state.pull_metadata = Some(value);
        }
        self.advance_facts(&confirmed)?;
        debug!(head = %head, confirmed = confirmed.len(), "confirmed pending events");
        Ok(())
    }

    /// No pending events: remote events apply directly.
    fn fast_forward(&mut self, remote: Vec<Event>) -> Result<(), EngineError> {
        let head = remote[remote.len() - 1].seq_num;
        let prune = self.config.prune_confirmed_changesets;
        let applied = self.transaction(|this| {
            let applied = this.apply_all(remote)?;
            this.store.update_head(head)?;
            if prune {
                this.store.delete_changesets_up_to(head)?;
            }
            Ok(applied)
        })?;

        self.state.upstream_head = head;
        self.state.local_head = head;
        self.note_pull_metadata(&applied);
        self.advance_facts(&applied)?;
        self.state.merge_counter += 1;
        info!(head = %head, events = applied.len(), "advanced to remote head");
        self.emit(PullPayload::Advance { events: applied });
        Ok(())
    }

    /// Pending events exist: roll them back, apply the remote events, replay
    /// what the rebase strategy keeps on top.
    fn rebase_onto(&mut self, remote: Vec<Event>) -> Result<(), EngineError> {
        let conflicts = detect_conflicts(
            self.store.schema(),
            &self.state.upstream_facts,
            &self.state.pending,
            &remote,
        )?;
        let replay = match self.strategy.resolve(&self.state.pending, &conflicts) {
            RebaseDecision::Replay(events) => events,
            RebaseDecision::Abort(conflicts) => {
                for conflict in &conflicts {
                    warn!(%conflict, "rebase conflict");
                }
                warn!(
                    pending = self.state.pending.len(),
                    remote = remote.len(),
                    "rebase aborted, pending events kept"
                );
                return Err(EngineError::RebaseConflict(conflicts));
            }
        };
        if !conflicts.is_empty() {
            debug!(conflicts = conflicts.len(), "replaying over conflicting remote events");
        }

        let base = self.state.upstream_head;
        let head = remote[remote.len() - 1].seq_num;
        let replayed = rebase_events(&replay, head);
        let rolled_back = self.state.pending.clone();
        let prune = self.config.prune_confirmed_changesets;

        let (applied_remote, applied_pending) = self.transaction(|this| {
            this.applier.rollback(&mut this.store, &rolled_back)?;
            this.store.delete_events_after(base)?;
            let applied_remote = this.apply_all(remote)?;
            this.store.update_head(head)?;
            let applied_pending = this.apply_all(replayed)?;
            if prune {
                this.store.delete_changesets_up_to(head)?;
            }
            Ok((applied_remote, applied_pending))
        })?;

        self.state.upstream_head = head;
        self.state.local_head = applied_pending.last().map_or(head, |e| e.seq_num);
        self.state.pending = applied_pending.clone();
        self.note_pull_metadata(&applied_remote);
        self.advance_facts(&applied_remote)?;
        self.state.merge_counter += 1;
        info!(
            head = %head,
            remote = applied_remote.len(),
            replayed = applied_pending.len(),
            "rebased pending events"
        );

        let mut new = applied_remote;
        new.extend(applied_pending);
        self.emit(PullPayload::Rebase {
            rollback: rolled_back,
            new,
        });
        Ok(())
    }

    fn apply_all(&mut self, events: Vec<Event>) -> Result<Vec<Event>, EngineError> {
        let mut applied = Vec::with_capacity(events.len());
        for mut event in events {
            self.applier.apply(&mut self.store, &mut event, LogMode::Append)?;
            applied.push(event);
        }
        Ok(applied)
    }

    fn note_pull_metadata(&mut self, events: &[Event]) {
        if let Some(metadata) = events.iter().rev().find_map(|e| e.meta.sync_metadata.clone()) {
            self.state.pull_metadata = Some(metadata);
        }
    }

    fn advance_facts(&mut self, events: &[Event]) -> Result<(), EngineError> {
        for event in events {
            let def = self.store.schema().event(&event.name)?;
            let group = facts_for_event(def, event, &self.state.upstream_facts)?;
            self.state.upstream_facts.apply(&group);
        }
        Ok(())
    }

    // ========================================================================
    // Explicit resolution
    // ========================================================================

    /// Rolls back and removes every pending event at or after `seq_num`.
    /// This is how a conflicting local event is given up.
    pub fn discard_pending_from(
        &mut self,
        seq_num: SequenceNumber,
    ) -> Result<Vec<Event>, EngineError> {
        self.ensure_running()?;
        let Some(idx) = self.state.pending.iter().position(|e| e.seq_num >= seq_num) else {
            return Ok(Vec::new());
        };
        let discarded = self.state.pending[idx..].to_vec();
        let base = discarded[0].parent_seq_num;

        self.transaction(|this| {
            this.applier.rollback(&mut this.store, &discarded)?;
            this.store.delete_events_after(base)?;
            Ok(())
        })?;

        self.state.pending.truncate(idx);
        self.state.local_head = base;
        self.state.merge_counter += 1;
        info!(from = %seq_num, discarded = discarded.len(), "discarded pending events");
        self.emit(PullPayload::Rebase {
            rollback: discarded.clone(),
            new: Vec::new(),
        });
        Ok(discarded)
    }

    /// Compacts the pending events: events whose facts are entirely replaced
    /// by later ones are dropped, the survivors renumbered and re-applied.
    /// Returns how many events were dropped.
    pub fn compact_pending(&mut self) -> Result<usize, EngineError> {
        self.ensure_running()?;
        if self.state.pending.len() < 2 {
            return Ok(0);
        }

        let dag = HistoryDag::from_events(
            self.store.schema(),
            &self.state.pending,
            self.state.upstream_facts.clone(),
        )?;
        let compacted = compact_events(dag);
        let removed = self.state.pending.len() - compacted.len();
        if removed == 0 {
            return Ok(0);
        }

        let base = self.state.pending[0].parent_seq_num;
        let survivors = rebase_events(&compacted.into_events(), base);
        let rolled_back = self.state.pending.clone();

        let applied = self.transaction(|this| {
            this.applier.rollback(&mut this.store, &rolled_back)?;
            this.store.delete_events_after(base)?;
            this.apply_all(survivors)
        })?;

        self.state.local_head = applied.last().map_or(base, |e| e.seq_num);
        self.state.pending = applied.clone();
        self.state.merge_counter += 1;
        info!(removed, kept = applied.len(), "compacted pending events");
        self.emit(PullPayload::Rebase {
            rollback: rolled_back,
            new: applied,
        });
        Ok(removed)
    }

    /// Applies queued batches, closes every pull queue and disconnects the
    /// backend. Further operations fail with `Shutdown`.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.shut_down {
            return Ok(());
        }
        let drained = self.drain_local_queue();
        self.subscribers.clear();
        if let Some(backend) = self.backend.as_mut() {
            backend.disconnect();
        }
        self.connection.online = false;
        self.shut_down = true;
        info!(head = %self.state.local_head, pending = self.state.pending.len(), "leader shut down");
        drained.map(|_| ())
    }
}
