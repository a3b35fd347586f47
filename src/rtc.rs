use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::event::{Event, EventSender, PeerEvent, RemoteTrack};
use crate::media::MediaTrack;
use crate::negotiation::{SdpType, SessionDescription};
use crate::peer::{ConnId, PeerFactory, PeerLink, PeerSetup, Role};

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct RtcPeerFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, setup: PeerSetup) -> Result<Box<dyn PeerLink>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        observe_peer(&peer_connection, &setup);

        match configure(&peer_connection, &setup).await {
            Ok(data_channel) => Ok(Box::new(RtcPeerLink {
                peer_connection,
                data_channel,
            })),
            Err(e) => {
                let _ = peer_connection.close().await;
                Err(e)
            }
        }
    }
}

/// Role-specific media setup plus the single data channel.
async fn configure(pc: &Arc<RTCPeerConnection>, setup: &PeerSetup) -> Result<Arc<RTCDataChannel>> {
    match setup.role {
        Role::Publisher => {
            if let Some(media) = &setup.media {
                for track in media.tracks() {
                    let sender = pc.add_track(track.local()).await?;
                    // Drain RTCP so interceptors keep running
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1500];
                        while sender.read(&mut buf).await.is_ok() {}
                    });
                }
            }
        }
        Role::Subscriber => {
            for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            }
        }
    }

    let data_channel = pc
        .create_data_channel(setup.role.data_channel_label(), None)
        .await?;
    observe_data_channel(&data_channel, setup.conn, &setup.participant, &setup.events);
    Ok(data_channel)
}

fn forward(events: &EventSender, conn: ConnId, participant: &str, event: PeerEvent) {
    let _ = events.send(Event::peer(conn, participant, event));
}

fn observe_peer(pc: &Arc<RTCPeerConnection>, setup: &PeerSetup) {
    let conn = setup.conn;

    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        forward(&events, conn, &participant, PeerEvent::ConnectionState(s));
        Box::pin(async {})
    }));

    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
        forward(&events, conn, &participant, PeerEvent::SignalingState(s));
        Box::pin(async {})
    }));

    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        forward(&events, conn, &participant, PeerEvent::IceConnectionState(s));
        Box::pin(async {})
    }));

    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
        forward(&events, conn, &participant, PeerEvent::IceGatheringState(s));
        Box::pin(async {})
    }));

    // A `None` candidate marks the end of gathering
    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate {
            Some(candidate) => {
                debug!(conn, %participant, address = %candidate.address, "ice candidate")
            }
            None => forward(&events, conn, &participant, PeerEvent::GatheringComplete),
        }
        Box::pin(async {})
    }));

    let (events, participant) = (setup.events.clone(), setup.participant.clone());
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let remote = RemoteTrack {
                kind: track.kind().into(),
                id: track.id(),
                stream_id: track.stream_id(),
                track,
            };
            forward(&events, conn, &participant, PeerEvent::Track(remote));
            Box::pin(async {})
        },
    ));
}

fn observe_data_channel(
    dc: &Arc<RTCDataChannel>,
    conn: ConnId,
    participant: &str,
    events: &EventSender,
) {
    let (tx, who) = (events.clone(), participant.to_owned());
    dc.on_open(Box::new(move || {
        forward(&tx, conn, &who, PeerEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let (tx, who) = (events.clone(), participant.to_owned());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        forward(&tx, conn, &who, PeerEvent::DataChannelMessage(msg.data));
        Box::pin(async {})
    }));

    let (tx, who) = (events.clone(), participant.to_owned());
    dc.on_close(Box::new(move || {
        forward(&tx, conn, &who, PeerEvent::DataChannelClose);
        Box::pin(async {})
    }));

    let (tx, who) = (events.clone(), participant.to_owned());
    dc.on_error(Box::new(move |err: webrtc::Error| {
        forward(&tx, conn, &who, PeerEvent::DataChannelError(err.to_string()));
        Box::pin(async {})
    }));
}

pub struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(to_wire(&offer))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection
            .local_description()
            .await
            .map(|description| to_wire(&description))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Rollback => {
                return Err(Error::NegotiationFailed("rollback is not supported".into()))
            }
        };
        self.peer_connection.set_remote_description(remote).await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<()> {
        for sender in self.peer_connection.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() == RTPCodecType::Video {
                sender.replace_track(Some(track.local())).await?;
                debug!(track = %track.id(), "outbound video replaced");
                return Ok(());
            }
        }
        Err(Error::Other(anyhow::anyhow!("no outbound video sender")))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.data_channel.close().await {
            warn!("data channel close failed: {}", e);
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

fn to_wire(description: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        // create_offer never yields Unspecified
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    }
}
