//! Everything the orchestrator reacts to arrives as an [`Event`] on one
//! unbounded queue, drained by a single scheduler loop.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::{MediaHandle, TrackKind};
use crate::negotiation::NegotiationResponse;
use crate::peer::ConnId;

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

pub type Reply = oneshot::Sender<Result<()>>;

pub enum Event {
    Presence(PresenceEvent),
    Peer {
        conn: ConnId,
        participant: String,
        event: PeerEvent,
    },
    /// Subscribe delay for a joined participant elapsed.
    SubscribeDue { participant: String, ticket: u64 },
    CameraAcquired(Result<MediaHandle>),
    ScreenAcquired {
        result: Result<MediaHandle>,
        reply: Option<Reply>,
    },
    ScreenShareEnded,
    NegotiationDone {
        conn: ConnId,
        result: Result<NegotiationResponse>,
    },
    Command(Command),
}

impl Event {
    pub fn peer(conn: ConnId, participant: &str, event: PeerEvent) -> Self {
        Event::Peer {
            conn,
            participant: participant.to_owned(),
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Relay connection established; the local participant is now announced.
    Opened,
    Join(String),
    Leave(String),
    Chat { participant: String, text: String },
    Closed,
}

#[derive(Debug)]
pub enum PeerEvent {
    ConnectionState(RTCPeerConnectionState),
    SignalingState(RTCSignalingState),
    IceConnectionState(RTCIceConnectionState),
    IceGatheringState(RTCIceGathererState),
    /// The terminal (null) candidate was emitted.
    GatheringComplete,
    Track(RemoteTrack),
    DataChannelOpen,
    DataChannelMessage(Bytes),
    DataChannelClose,
    DataChannelError(String),
}

/// Inbound media track on a subscriber connection.
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    pub stream_id: String,
    pub track: Arc<TrackRemote>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// User-initiated actions.
#[derive(Debug)]
pub enum Command {
    SendChat(String),
    ToggleAudio,
    ToggleVideo,
    StartScreenShare { reply: Option<Reply> },
    StopScreenShare,
    Shutdown,
}

impl Command {
    /// Terminal input: slash commands, anything else is chat.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line {
            "/mute" => Command::ToggleAudio,
            "/hide" => Command::ToggleVideo,
            "/share" => Command::StartScreenShare { reply: None },
            "/unshare" => Command::StopScreenShare,
            "/quit" => Command::Shutdown,
            text => Command::SendChat(text.to_owned()),
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_map_to_actions() {
        assert!(matches!(Command::parse("/mute"), Some(Command::ToggleAudio)));
        assert!(matches!(Command::parse("/hide"), Some(Command::ToggleVideo)));
        assert!(matches!(
            Command::parse(" /share "),
            Some(Command::StartScreenShare { reply: None })
        ));
        assert!(matches!(Command::parse("/unshare"), Some(Command::StopScreenShare)));
        assert!(matches!(Command::parse("/quit"), Some(Command::Shutdown)));
    }

    #[test]
    fn other_input_is_chat() {
        match Command::parse("hello room") {
            Some(Command::SendChat(text)) => assert_eq!(text, "hello room"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Command::parse("   ").is_none());
    }
}
