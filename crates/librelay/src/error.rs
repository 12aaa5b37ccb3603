use thiserror::Error;

use relay_protocol::{ErrorCode, SessionId};

use crate::lifecycle::TransitionError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("transition rejected for session {session_id}: {source}")]
    Transition {
        session_id: SessionId,
        #[source]
        source: TransitionError,
    },

    #[error(
        "replay window exceeded for session {session_id}: requested offset {requested}, oldest retained {oldest}"
    )]
    ReplayWindowExceeded {
        session_id: SessionId,
        requested: u64,
        oldest: u64,
    },
}

impl RelayError {
    /// Convert to protocol error code and message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            RelayError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            RelayError::SessionClosed(_) => (ErrorCode::SessionClosed, self.to_string()),
            RelayError::Transition { source, .. } => {
                let code = match source {
                    TransitionError::CapacityReached { .. } => ErrorCode::CapacityReached,
                    TransitionError::NotParticipant { .. } => ErrorCode::NotParticipant,
                    TransitionError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                };
                (code, self.to_string())
            }
            RelayError::ReplayWindowExceeded { .. } => {
                (ErrorCode::ReplayWindowExceeded, self.to_string())
            }
        }
    }
}
