//! Per-connection negotiation state machine.
//!
//! Every connection walks `Created -> AwaitingLocalDescription ->
//! GatheringCandidates -> AwaitingRemoteDescription -> Active`, one step at
//! a time, and may drop to `Closed` from anywhere. The transport itself sits
//! behind [`PeerLink`] so the state machine is independent of webrtc-rs.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{Error, Result};
use crate::event::EventSender;
use crate::media::{MediaHandle, MediaTrack};
use crate::negotiation::{Action, NegotiationRequest, SessionDescription};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the local media and data channel.
    Publisher,
    /// Receives one remote participant's audio, video and data channel.
    Subscriber,
}

impl Role {
    pub fn action(self) -> Action {
        match self {
            Role::Publisher => Action::Publish,
            Role::Subscriber => Action::Subscribe,
        }
    }

    pub fn data_channel_label(self) -> &'static str {
        match self {
            Role::Publisher => "localDatachannel",
            Role::Subscriber => "remoteDatachannel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Created,
    AwaitingLocalDescription,
    GatheringCandidates,
    AwaitingRemoteDescription,
    Active,
    Closed,
}

impl NegotiationState {
    fn next(self) -> Option<NegotiationState> {
        use NegotiationState::*;
        match self {
            Created => Some(AwaitingLocalDescription),
            AwaitingLocalDescription => Some(GatheringCandidates),
            GatheringCandidates => Some(AwaitingRemoteDescription),
            AwaitingRemoteDescription => Some(Active),
            Active | Closed => None,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Last transport-reported states, for observability only.
#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub peer_state: RTCPeerConnectionState,
    pub signaling_state: RTCSignalingState,
    pub ice_state: RTCIceConnectionState,
    pub gathering_state: RTCIceGathererState,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            peer_state: RTCPeerConnectionState::New,
            signaling_state: RTCSignalingState::Stable,
            ice_state: RTCIceConnectionState::New,
            gathering_state: RTCIceGathererState::New,
        }
    }
}

/// Everything a factory needs to build one transport connection.
pub struct PeerSetup {
    pub conn: ConnId,
    pub participant: String,
    pub role: Role,
    /// Local media to attach; publishers only.
    pub media: Option<MediaHandle>,
    /// Transport callbacks are forwarded here as [`crate::event::Event::Peer`].
    pub events: EventSender,
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates an offer and installs it as the local description, which
    /// starts ICE gathering.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Current local description, including any gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Swaps the track on the outbound video sender in place.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, setup: PeerSetup) -> Result<Box<dyn PeerLink>>;
}

pub struct PeerConnection {
    id: ConnId,
    participant: String,
    role: Role,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    gathering_complete: bool,
    negotiation_requests: u32,
    last_error: Option<String>,
    status: TransportStatus,
    link: Box<dyn PeerLink>,
}

impl PeerConnection {
    pub fn new(
        id: ConnId,
        participant: impl Into<String>,
        role: Role,
        link: Box<dyn PeerLink>,
    ) -> Self {
        Self {
            id,
            participant: participant.into(),
            role,
            state: NegotiationState::Created,
            local_description: None,
            remote_description: None,
            gathering_complete: false,
            negotiation_requests: 0,
            last_error: None,
            status: TransportStatus::default(),
            link,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn gathering_complete(&self) -> bool {
        self.gathering_complete
    }

    pub fn negotiation_requests(&self) -> u32 {
        self.negotiation_requests
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> &TransportStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut TransportStatus {
        &mut self.status
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    fn transition(&mut self, to: NegotiationState) -> Result<()> {
        let allowed = match to {
            NegotiationState::Closed => self.state != NegotiationState::Closed,
            _ => self.state.next() == Some(to),
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(
            conn = self.id,
            participant = %self.participant,
            from = %self.state,
            %to,
            "negotiation state"
        );
        self.state = to;
        Ok(())
    }

    fn expect_state(&self, expected: NegotiationState, to: NegotiationState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        Ok(())
    }

    /// Generates the offer, installs it locally and moves on to gathering.
    pub async fn begin_negotiation(&mut self) -> Result<()> {
        self.transition(NegotiationState::AwaitingLocalDescription)?;
        let offer = self.link.create_offer().await?;
        self.local_description = Some(offer);
        self.transition(NegotiationState::GatheringCandidates)
    }

    /// Called once gathering has finished. Builds the single broker
    /// request for this connection.
    pub async fn negotiation_request(&mut self) -> Result<NegotiationRequest> {
        self.expect_state(
            NegotiationState::GatheringCandidates,
            NegotiationState::AwaitingRemoteDescription,
        )?;
        let sdp = match self.link.local_description().await {
            Some(gathered) => gathered,
            None => self
                .local_description
                .clone()
                .ok_or_else(|| Error::NegotiationFailed("no local description".into()))?,
        };
        self.gathering_complete = true;
        self.transition(NegotiationState::AwaitingRemoteDescription)?;
        self.negotiation_requests += 1;
        Ok(NegotiationRequest {
            action: self.role.action(),
            publisher_id: self.participant.clone(),
            sdp,
        })
    }

    /// Installs the broker's answer. The remote description is set once.
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.expect_state(NegotiationState::AwaitingRemoteDescription, NegotiationState::Active)?;
        if self.remote_description.is_some() {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: NegotiationState::Active,
            });
        }
        self.link.set_remote_description(answer.clone()).await?;
        self.remote_description = Some(answer);
        self.transition(NegotiationState::Active)
    }

    pub async fn replace_video_track(&self, track: &MediaTrack) -> Result<()> {
        if self.is_closed() {
            return Err(Error::UnknownConnection(self.id));
        }
        self.link.replace_video_track(track).await
    }

    pub fn record_failure(&mut self, error: &Error) {
        self.last_error = Some(error.to_string());
    }

    /// Legal in every state; transport errors are logged, not returned.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.link.close().await {
            warn!(
                conn = self.id,
                participant = %self.participant,
                "error closing connection: {}",
                e
            );
        }
        self.state = NegotiationState::Closed;
        debug!(conn = self.id, participant = %self.participant, "connection closed");
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("participant", &self.participant)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("negotiation_requests", &self.negotiation_requests)
            .field("last_error", &self.last_error)
            .finish()
    }
}
