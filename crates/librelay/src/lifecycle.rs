use std::collections::BTreeSet;

use thiserror::Error;

use relay_protocol::{ErrorInfo, LifecycleEvent, ParticipantId, SessionState};

/// A rejected transition. The machine never partially applies one: the
/// caller keeps its current `Lifecycle` untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("capacity reached: session already has {max_participants} participants")]
    CapacityReached { max_participants: usize },

    #[error("not a participant: {participant}")]
    NotParticipant { participant: ParticipantId },

    #[error("invalid transition: {event} is not legal in state {state:?}")]
    InvalidTransition {
        state: SessionState,
        event: &'static str,
    },
}

/// Membership/activity context owned by one session's state machine.
/// Compares by value only: the error payload carries arbitrary JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub participants: BTreeSet<ParticipantId>,
    pub max_participants: usize,
    /// Inactivity beyond this authorizes a TIMEOUT transition.
    pub staleness_ms: u64,
    pub created_at_epoch_ms: u64,
    pub last_activity_epoch_ms: u64,
    pub error: Option<ErrorInfo>,
}

/// Explicit state + context pair with a pure transition function. The
/// caller owns the struct and threads it through `transition`; there is
/// no captured mutable state and no I/O here. TIMEOUT is driven by the
/// caller's clock via `now_ms`, never by a timer owned by the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    pub state: SessionState,
    pub context: SessionContext,
}

impl Lifecycle {
    pub fn new(max_participants: usize, staleness_ms: u64, now_ms: u64) -> Self {
        Self {
            state: SessionState::Idle,
            context: SessionContext {
                participants: BTreeSet::new(),
                max_participants: max_participants.max(1),
                staleness_ms,
                created_at_epoch_ms: now_ms,
                last_activity_epoch_ms: now_ms,
                error: None,
            },
        }
    }

    /// Attempt one transition. Returns the successor state+context, or
    /// the rejection with `self` left untouched.
    pub fn transition(
        &self,
        event: &LifecycleEvent,
        now_ms: u64,
    ) -> Result<Lifecycle, TransitionError> {
        use SessionState::*;

        // ERROR is the one universal transition and overrides all guards.
        if let LifecycleEvent::Error { error } = event {
            let mut next = self.clone();
            next.state = Error;
            next.context.error = Some(error.clone());
            return Ok(next);
        }

        let mut next = self.clone();
        match (self.state, event) {
            (Idle, LifecycleEvent::Initialize) => next.state = Initializing,

            (Initializing, LifecycleEvent::Ready) => next.state = Active,

            (Active, LifecycleEvent::Join { participant }) => {
                if !next.context.participants.contains(participant)
                    && next.context.participants.len() >= next.context.max_participants
                {
                    return Err(TransitionError::CapacityReached {
                        max_participants: next.context.max_participants,
                    });
                }
                next.context.participants.insert(participant.clone());
                next.context.last_activity_epoch_ms = now_ms;
            }

            (Active, LifecycleEvent::Leave { participant }) => {
                if !next.context.participants.remove(participant) {
                    return Err(TransitionError::NotParticipant {
                        participant: participant.clone(),
                    });
                }
                next.context.last_activity_epoch_ms = now_ms;
            }

            (Active, LifecycleEvent::Heartbeat) => {
                next.context.last_activity_epoch_ms = now_ms;
            }

            (Active, LifecycleEvent::Pause) => next.state = Paused,

            (Paused, LifecycleEvent::Resume) => {
                next.state = Active;
                next.context.last_activity_epoch_ms = now_ms;
            }

            (Active | Paused, LifecycleEvent::Timeout) => {
                let idle_for = now_ms.saturating_sub(self.context.last_activity_epoch_ms);
                if idle_for <= self.context.staleness_ms {
                    // Not stale yet: a rejection, not a fatal error.
                    return Err(TransitionError::InvalidTransition {
                        state: self.state,
                        event: event_name(event),
                    });
                }
                next.state = Closing;
            }

            // CLOSE forces an orderly shutdown from anywhere but closed,
            // including the absorbing error state.
            (Idle | Initializing | Active | Paused | Error, LifecycleEvent::Close) => {
                next.state = Closing;
            }

            // Idempotent finalize.
            (Closing, LifecycleEvent::Close) => next.state = Closed,

            _ => {
                return Err(TransitionError::InvalidTransition {
                    state: self.state,
                    event: event_name(event),
                });
            }
        }

        Ok(next)
    }
}

fn event_name(event: &LifecycleEvent) -> &'static str {
    match event {
        LifecycleEvent::Initialize => "initialize",
        LifecycleEvent::Ready => "ready",
        LifecycleEvent::Join { .. } => "join",
        LifecycleEvent::Leave { .. } => "leave",
        LifecycleEvent::Heartbeat => "heartbeat",
        LifecycleEvent::Pause => "pause",
        LifecycleEvent::Resume => "resume",
        LifecycleEvent::Timeout => "timeout",
        LifecycleEvent::Close => "close",
        LifecycleEvent::Error { .. } => "error",
    }
}
