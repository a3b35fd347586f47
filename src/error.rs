use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::peer::NegotiationState;

#[derive(Debug, Error)]
pub enum Error {
    /// The presence relay connection is gone.
    #[error("presence channel closed")]
    ChannelClosed,

    /// Broker unreachable, broker error status, or unusable answer.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A join/leave replay. Absorbed by the orchestrator, never surfaced.
    #[error("duplicate event for participant {0}")]
    DuplicateEvent(String),

    #[error("invalid negotiation transition {from} -> {to}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },

    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    #[error("not publishing")]
    NotPublishing,

    #[error("screen share already active")]
    ScreenShareActive,

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_condition() {
        assert_eq!(Error::ChannelClosed.to_string(), "presence channel closed");
        let err = Error::InvalidTransition {
            from: NegotiationState::Created,
            to: NegotiationState::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid negotiation transition Created -> Active"
        );
    }
}
