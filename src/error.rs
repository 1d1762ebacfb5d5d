use thiserror::Error;

use crate::db::{PersonaId, UserId};

/// Failures of a single client request. Everything except `Protocol` is reported
/// back to the requesting connection as an `error` event.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("join a room first")]
    NotJoined,

    #[error("message is empty")]
    EmptyMessage,

    #[error("already in a room, leave it first")]
    AlreadyJoined,

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("unknown persona {0}")]
    UnknownPersona(PersonaId),

    #[error("persona {0} is still replying, try again in a moment")]
    GenerationBusy(PersonaId),

    #[error("could not save that, try again")]
    Persistence(#[source] anyhow::Error),
}

impl RelayError {
    /// Whether the client should hear about it.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, RelayError::Protocol(_))
    }
}
