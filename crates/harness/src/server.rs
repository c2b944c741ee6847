use std::sync::Arc;

use eventsync_core::{EncodedEvent, SequenceNumber};
use eventsync_engine::{BackendError, InvalidPushReason, PullCursor, PullPage, PulledEvent, SyncBackend};
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

#[derive(Debug)]
struct ServerState {
    events: Vec<EncodedEvent>,
    online: bool,
    pushes: usize,
}

/// In-memory remote authority shared by every leader of a test. Global
/// sequence numbers are positions in its log, starting at 1.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                events: Vec::new(),
                online: true,
                pushes: 0,
            })),
        }
    }

    /// A backend connection for one leader.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            server: self.clone(),
            connected: false,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    pub fn head(&self) -> SequenceNumber {
        SequenceNumber::global_only(self.state.lock().events.len() as u64)
    }

    pub fn events(&self) -> Vec<EncodedEvent> {
        self.state.lock().events.clone()
    }

    /// Number of accepted push requests.
    pub fn push_count(&self) -> usize {
        self.state.lock().pushes
    }
}

pub struct MemoryBackend {
    server: MemoryServer,
    connected: bool,
}

fn metadata_for(seq_num: u64) -> serde_json::Value {
    json!({ "offset": seq_num })
}

impl SyncBackend for MemoryBackend {
    fn connect(&mut self) -> Result<(), BackendError> {
        if !self.server.state.lock().online {
            self.connected = false;
            return Err(BackendError::IsOffline);
        }
        self.connected = true;
        Ok(())
    }

    fn pull(&mut self, cursor: Option<&PullCursor>, limit: usize) -> Result<PullPage, BackendError> {
        let state = self.server.state.lock();
        if !state.online || !self.connected {
            return Err(BackendError::IsOffline);
        }
        let start = cursor.map_or(0, |c| c.cursor.global()) as usize;
        if start > state.events.len() {
            return Err(BackendError::InvalidPull(format!(
                "cursor e{start} is past the server head e{}",
                state.events.len()
            )));
        }
        let end = (start + limit).min(state.events.len());
        let batch = state.events[start..end]
            .iter()
            .map(|event| PulledEvent {
                event: event.clone(),
                metadata: Some(metadata_for(event.seq_num)),
            })
            .collect();
        Ok(PullPage {
            batch,
            remaining: (state.events.len() - end) as u64,
        })
    }

    fn push(&mut self, batch: &[EncodedEvent]) -> Result<(), BackendError> {
        let mut state = self.server.state.lock();
        if !state.online || !self.connected {
            return Err(BackendError::IsOffline);
        }
        let Some(first) = batch.first() else {
            return Ok(());
        };

        let head = state.events.len() as u64;
        if first.parent_seq_num < head {
            return Err(BackendError::server_ahead(
                SequenceNumber::global_only(head + 1),
                first.seq_num(),
            ));
        }
        let mut expected = head;
        for event in batch {
            if event.parent_seq_num != expected || event.seq_num != expected + 1 {
                return Err(BackendError::InvalidPush(InvalidPushReason::Unexpected(
                    format!("event e{} does not extend e{expected}", event.seq_num),
                )));
            }
            expected = event.seq_num;
        }

        state.events.extend(batch.iter().cloned());
        state.pushes += 1;
        debug!(events = batch.len(), head = expected, "server accepted push");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.server.state.lock().online
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
