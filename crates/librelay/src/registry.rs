use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use relay_protocol::{
    Channel, LifecycleEvent, PresenceData, PresenceStatus, SessionId, SessionInfo, SessionState,
    now_epoch_ms,
};

use crate::error::RelayError;
use crate::lifecycle::Lifecycle;
use crate::log::{EntryStream, EventLog};

const DEFAULT_RETAINED_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Replay window per session (ring buffer length).
    pub retained_entries: usize,
    pub broadcast_capacity: usize,
    pub default_max_participants: usize,
    /// Inactivity threshold that authorizes TIMEOUT.
    pub staleness_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retained_entries: DEFAULT_RETAINED_ENTRIES,
            broadcast_capacity: 1024,
            default_max_participants: 8,
            staleness_ms: 5 * 60 * 1000,
        }
    }
}

struct SessionCell {
    lifecycle: Lifecycle,
    log: EventLog,
}

/// Process-wide registry of live sessions.
///
/// Each session lives in its own cell behind an async mutex, so lifecycle
/// transitions and publishes are serialized per session while sessions
/// never contend with each other. Cells are created on `create_session`
/// and removed when the session reaches `closed`.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionCell>>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Idempotent stream/session initialization: creating an existing
    /// session is a no-op returning its id.
    pub fn create_session(
        &self,
        session_id: Option<SessionId>,
        max_participants: Option<usize>,
    ) -> SessionId {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max = max_participants.unwrap_or(self.config.default_max_participants);
        let mut created = false;

        self.sessions.entry(id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(Mutex::new(SessionCell {
                lifecycle: Lifecycle::new(max, self.config.staleness_ms, now_epoch_ms()),
                log: EventLog::new(
                    self.config.retained_entries,
                    self.config.broadcast_capacity,
                ),
            }))
        });

        if created {
            info!(session_id = %id, max_participants = max, "session created");
        }
        id
    }

    /// The lifecycle control surface: apply one event with the current
    /// clock and return the resulting session view.
    pub async fn send(
        &self,
        session_id: &str,
        event: &LifecycleEvent,
    ) -> Result<SessionInfo, RelayError> {
        self.send_at(session_id, event, now_epoch_ms()).await
    }

    /// Like `send`, with an explicit clock (the reaper and tests own it).
    pub async fn send_at(
        &self,
        session_id: &str,
        event: &LifecycleEvent,
        now_ms: u64,
    ) -> Result<SessionInfo, RelayError> {
        let cell = self.cell(session_id)?;
        let mut guard = cell.lock().await;

        let next = guard
            .lifecycle
            .transition(event, now_ms)
            .map_err(|source| RelayError::Transition {
                session_id: session_id.to_string(),
                source,
            })?;
        let entered = next.state;
        guard.lifecycle = next;

        // Accepted membership/error transitions are themselves facts the
        // log records, so observers replay them like any other event.
        match event {
            LifecycleEvent::Join { participant } => {
                let _ = guard.log.publish(
                    Channel::Presence,
                    presence_payload(participant, PresenceStatus::Joined),
                );
            }
            LifecycleEvent::Leave { participant } => {
                let _ = guard.log.publish(
                    Channel::Presence,
                    presence_payload(participant, PresenceStatus::Left),
                );
            }
            LifecycleEvent::Error { error } => {
                let _ = guard
                    .log
                    .publish(Channel::Error, serde_json::to_value(error).unwrap_or_default());
            }
            _ => {}
        }

        if entered == SessionState::Closed {
            // Terminal control event, then no further publishes; live
            // tails drain and end.
            let _ = guard.log.publish(Channel::Connected, json!({ "closed": true }));
            guard.log.seal();
        }

        let info = session_view(session_id, &guard);
        drop(guard);

        if entered == SessionState::Closed {
            self.sessions.remove(session_id);
            info!(session_id = %session_id, "session closed and removed");
        } else {
            debug!(session_id = %session_id, state = ?entered, "transition applied");
        }

        Ok(info)
    }

    /// Append one event to a session's log and return its offset.
    /// Lifecycle legality is the producer's concern (checked via `send`);
    /// only existence and the sealed flag are enforced here.
    pub async fn publish(
        &self,
        session_id: &str,
        channel: Channel,
        data: serde_json::Value,
    ) -> Result<u64, RelayError> {
        let cell = self.cell(session_id)?;
        let mut guard = cell.lock().await;
        let entry = guard
            .log
            .publish(channel, data)
            .map_err(|_| RelayError::SessionClosed(session_id.to_string()))?;
        Ok(entry.offset)
    }

    /// Replay-then-live subscription. Cursors are independent; dropping
    /// the stream is the unsubscribe.
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
    ) -> Result<EntryStream, RelayError> {
        let cell = self.cell(session_id)?;
        let guard = cell.lock().await;
        guard
            .log
            .subscribe(from_offset)
            .map_err(|err| RelayError::ReplayWindowExceeded {
                session_id: session_id.to_string(),
                requested: err.requested,
                oldest: err.oldest,
            })
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, RelayError> {
        let cell = self.cell(session_id)?;
        let guard = cell.lock().await;
        Ok(session_view(session_id, &guard))
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let cells: Vec<(SessionId, Arc<Mutex<SessionCell>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut infos = Vec::with_capacity(cells.len());
        for (id, cell) in cells {
            let guard = cell.lock().await;
            infos.push(session_view(&id, &guard));
        }
        infos
    }

    /// Explicit teardown without the lifecycle (server shutdown). Appends
    /// the terminal control event and seals the log so live tails end
    /// cleanly, then drops the cell.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, cell)) => {
                let mut guard = cell.lock().await;
                let _ = guard.log.publish(Channel::Connected, json!({ "closed": true }));
                guard.log.seal();
                info!(session_id = %session_id, "session removed");
                true
            }
            None => false,
        }
    }

    fn cell(&self, session_id: &str) -> Result<Arc<Mutex<SessionCell>>, RelayError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }
}

fn presence_payload(participant: &str, status: PresenceStatus) -> serde_json::Value {
    serde_json::to_value(PresenceData {
        participant: participant.to_string(),
        status,
    })
    .unwrap_or_default()
}

fn session_view(session_id: &str, cell: &SessionCell) -> SessionInfo {
    SessionInfo {
        id: session_id.to_string(),
        state: cell.lifecycle.state,
        participants: cell.lifecycle.context.participants.iter().cloned().collect(),
        max_participants: cell.lifecycle.context.max_participants,
        created_at_epoch_ms: cell.lifecycle.context.created_at_epoch_ms,
        last_activity_epoch_ms: cell.lifecycle.context.last_activity_epoch_ms,
        head_offset: cell.log.head_offset(),
        error: cell.lifecycle.context.error.clone(),
    }
}
