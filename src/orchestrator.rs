//! Connection lifecycle for the whole room.
//!
//! One publisher connection for the local participant, one subscriber
//! connection per remote participant. All state lives in [`Orchestrator`]
//! and is only mutated from [`Orchestrator::handle`], which the scheduler
//! loop calls for one event at a time. Anything that has to wait (capture,
//! subscribe delay, broker round trip) runs in a spawned task that reports
//! back through the event queue.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Command, Event, EventReceiver, EventSender, PeerEvent, PresenceEvent, Reply};
use crate::media::{Capture, MediaConstraints, MediaHandle, MediaTrack};
use crate::negotiation::{NegotiationBroker, NegotiationResponse};
use crate::peer::{ConnId, NegotiationState, PeerConnection, PeerFactory, PeerSetup, Role};
use crate::presence::PresenceChannel;
use crate::registry::ParticipantRegistry;
use crate::render::Renderer;

#[derive(Debug, Clone)]
pub struct Settings {
    pub local_id: String,
    /// Wait before subscribing to a new joiner so its own publish can land.
    pub subscribe_delay: Duration,
    pub constraints: MediaConstraints,
}

#[derive(Clone)]
pub struct Collaborators {
    pub factory: Arc<dyn PeerFactory>,
    pub broker: Arc<dyn NegotiationBroker>,
    pub capture: Arc<dyn Capture>,
    pub renderer: Arc<dyn Renderer>,
}

enum Publishing {
    Idle,
    Acquiring,
    Live(PeerConnection),
}

pub struct Orchestrator {
    settings: Settings,
    collaborators: Collaborators,
    events: EventSender,
    presence: Option<PresenceChannel>,
    publishing: Publishing,
    camera: Option<MediaHandle>,
    screen: Option<MediaHandle>,
    screen_pending: bool,
    registry: ParticipantRegistry,
    /// Joins waiting out the subscribe delay, with the ticket that is due.
    pending: HashMap<String, u64>,
    next_ticket: u64,
    next_conn: ConnId,
}

impl Orchestrator {
    pub fn new(settings: Settings, collaborators: Collaborators, events: EventSender) -> Self {
        Self {
            settings,
            collaborators,
            events,
            presence: None,
            publishing: Publishing::Idle,
            camera: None,
            screen: None,
            screen_pending: false,
            registry: ParticipantRegistry::new(),
            pending: HashMap::new(),
            next_ticket: 0,
            next_conn: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.settings.local_id
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> Option<&PeerConnection> {
        match &self.publishing {
            Publishing::Live(conn) => Some(conn),
            _ => None,
        }
    }

    /// Connection for any participant, the local one included.
    pub fn connection(&self, participant: &str) -> Option<&PeerConnection> {
        if participant == self.settings.local_id {
            self.publisher()
        } else {
            self.registry.get(participant)
        }
    }

    pub fn is_subscribe_pending(&self, participant: &str) -> bool {
        self.pending.contains_key(participant)
    }

    pub fn camera(&self) -> Option<&MediaHandle> {
        self.camera.as_ref()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Keeps the first open channel; a second one is closed right away.
    pub fn attach_presence(&mut self, channel: PresenceChannel) {
        if let Some(current) = &self.presence {
            if !current.is_closed() {
                warn!("presence channel already open");
                channel.close();
                return;
            }
        }
        self.presence = Some(channel);
    }

    pub async fn run(mut self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await.is_break() {
                break;
            }
        }
        self.shutdown().await;
    }

    pub async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Presence(event) => self.on_presence(event).await,
            Event::Peer {
                conn,
                participant,
                event,
            } => self.on_peer_event(conn, &participant, event).await,
            Event::SubscribeDue {
                participant,
                ticket,
            } => self.on_subscribe_due(participant, ticket).await,
            Event::CameraAcquired(result) => self.on_camera_acquired(result).await,
            Event::ScreenAcquired { result, reply } => {
                self.on_screen_acquired(result, reply).await
            }
            Event::ScreenShareEnded => self.on_screen_share_ended().await,
            Event::NegotiationDone { conn, result } => {
                self.on_negotiation_done(conn, result).await
            }
            Event::Command(Command::Shutdown) => return ControlFlow::Break(()),
            Event::Command(command) => self.on_command(command),
        }
        ControlFlow::Continue(())
    }

    async fn on_presence(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Opened => {
                info!(participant = %self.settings.local_id, "presence channel open");
                self.start_publishing();
            }
            PresenceEvent::Join(participant) => self.on_join(participant),
            PresenceEvent::Leave(participant) => self.on_leave(&participant).await,
            PresenceEvent::Chat { participant, text } => {
                self.collaborators.renderer.append_chat(&participant, &text);
            }
            PresenceEvent::Closed => warn!("presence channel closed"),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendChat(text) => {
                if let Err(e) = self.send_chat(&text) {
                    warn!("chat not sent: {}", e);
                }
            }
            Command::ToggleAudio => {
                self.toggle_audio();
            }
            Command::ToggleVideo => {
                self.toggle_video();
            }
            Command::StartScreenShare { reply } => self.start_screen_share(reply),
            Command::StopScreenShare => self.stop_screen_share(),
            Command::Shutdown => {}
        }
    }

    /// Acquires the camera and then builds the publisher connection. A
    /// no-op once publishing has started.
    pub fn start_publishing(&mut self) {
        if !matches!(self.publishing, Publishing::Idle) {
            debug!("already publishing");
            return;
        }
        self.publishing = Publishing::Acquiring;

        let capture = self.collaborators.capture.clone();
        let events = self.events.clone();
        let constraints = self.settings.constraints;
        tokio::spawn(async move {
            let result = capture.acquire_camera(constraints).await;
            let _ = events.send(Event::CameraAcquired(result));
        });
    }

    async fn on_camera_acquired(&mut self, result: Result<MediaHandle>) {
        if !matches!(self.publishing, Publishing::Acquiring) {
            if let Ok(media) = result {
                media.stop();
            }
            return;
        }
        let media = match result {
            Ok(media) => media,
            Err(e) => {
                error!("camera capture failed: {}", e);
                self.publishing = Publishing::Idle;
                self.collaborators.renderer.alert(&e.to_string());
                return;
            }
        };

        let local_id = self.settings.local_id.clone();
        match self
            .open_connection(local_id, Role::Publisher, Some(media.clone()))
            .await
        {
            Ok(conn) => {
                info!(conn = conn.id(), "publish connection created");
                self.collaborators.renderer.show_local(&media);
                self.camera = Some(media);
                self.publishing = Publishing::Live(conn);
            }
            Err(e) => {
                error!("failed to start publishing: {}", e);
                media.stop();
                self.publishing = Publishing::Idle;
                self.collaborators.renderer.alert(&e.to_string());
            }
        }
    }

    /// Schedules a subscription after the subscribe delay. Duplicates of a
    /// participant we already track are ignored.
    pub fn on_join(&mut self, participant: String) {
        if participant == self.settings.local_id {
            debug!(%participant, "ignoring join for local participant");
            return;
        }
        if self.registry.contains(&participant) || self.pending.contains_key(&participant) {
            debug!("{}", Error::DuplicateEvent(participant));
            return;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.pending.insert(participant.clone(), ticket);
        info!(%participant, "participant joined");

        let events = self.events.clone();
        let delay = self.settings.subscribe_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::SubscribeDue {
                participant,
                ticket,
            });
        });
    }

    async fn on_subscribe_due(&mut self, participant: String, ticket: u64) {
        if self.pending.get(&participant) != Some(&ticket) {
            debug!(%participant, ticket, "stale subscribe");
            return;
        }
        self.pending.remove(&participant);

        if self.registry.contains(&participant) {
            debug!("{}", Error::DuplicateEvent(participant));
            return;
        }
        match self
            .open_connection(participant.clone(), Role::Subscriber, None)
            .await
        {
            Ok(conn) => {
                info!(%participant, conn = conn.id(), "subscribe connection created");
                if let Err(e) = self.registry.add(conn) {
                    debug!("{}", e);
                    return;
                }
                self.collaborators.renderer.mount_participant(&participant);
            }
            Err(e) => error!(%participant, "failed to subscribe: {}", e),
        }
    }

    /// Cancels a pending subscribe or closes the live one. Unknown
    /// participants are ignored.
    pub async fn on_leave(&mut self, participant: &str) {
        if self.pending.remove(participant).is_some() {
            info!(%participant, "participant left before subscribing");
        }
        let Some(mut conn) = self.registry.remove(participant) else {
            debug!(%participant, "leave for unknown participant");
            return;
        };
        conn.close().await;
        self.collaborators.renderer.remove_participant(participant);
        info!(%participant, conn = conn.id(), "participant left");
    }

    async fn open_connection(
        &mut self,
        participant: String,
        role: Role,
        media: Option<MediaHandle>,
    ) -> Result<PeerConnection> {
        self.next_conn += 1;
        let id = self.next_conn;
        let link = self
            .collaborators
            .factory
            .create(PeerSetup {
                conn: id,
                participant: participant.clone(),
                role,
                media,
                events: self.events.clone(),
            })
            .await?;

        let mut conn = PeerConnection::new(id, participant, role, link);
        if let Err(e) = conn.begin_negotiation().await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    fn connection_mut(&mut self, id: ConnId) -> Option<&mut PeerConnection> {
        if let Publishing::Live(conn) = &mut self.publishing {
            if conn.id() == id {
                return Some(conn);
            }
        }
        self.registry.find_by_conn_mut(id)
    }

    async fn on_peer_event(&mut self, id: ConnId, participant: &str, event: PeerEvent) {
        match event {
            PeerEvent::GatheringComplete => self.on_gathering_complete(id).await,
            PeerEvent::Track(track) => {
                if self.connection_mut(id).is_some() {
                    self.collaborators.renderer.attach_track(participant, &track);
                } else {
                    debug!(conn = id, %participant, "track for closed connection");
                }
            }
            event => self.record_transport_event(id, participant, event),
        }
    }

    fn record_transport_event(&mut self, id: ConnId, participant: &str, event: PeerEvent) {
        let Some(conn) = self.connection_mut(id) else {
            debug!(conn = id, %participant, ?event, "event for closed connection");
            return;
        };
        let status = conn.status_mut();
        match event {
            PeerEvent::ConnectionState(state) => {
                status.peer_state = state;
                info!(conn = id, %participant, %state, "peer connection state changed");
            }
            PeerEvent::SignalingState(state) => {
                status.signaling_state = state;
                info!(conn = id, %participant, %state, "signaling state changed");
            }
            PeerEvent::IceConnectionState(state) => {
                status.ice_state = state;
                info!(conn = id, %participant, %state, "ice connection state changed");
            }
            PeerEvent::IceGatheringState(state) => {
                status.gathering_state = state;
                debug!(conn = id, %participant, %state, "ice gathering state changed");
            }
            PeerEvent::DataChannelOpen => {
                info!(conn = id, %participant, "datachannel state: open")
            }
            PeerEvent::DataChannelMessage(data) => {
                info!(
                    conn = id,
                    %participant,
                    message = %String::from_utf8_lossy(&data),
                    "datachannel message"
                );
            }
            PeerEvent::DataChannelClose => {
                info!(conn = id, %participant, "datachannel state: closed")
            }
            PeerEvent::DataChannelError(e) => {
                warn!(conn = id, %participant, error = %e, "datachannel error")
            }
            PeerEvent::GatheringComplete | PeerEvent::Track(_) => {}
        }
    }

    /// Issues the one broker request for this connection.
    async fn on_gathering_complete(&mut self, id: ConnId) {
        let Some(conn) = self.connection_mut(id) else {
            debug!(conn = id, "gathering complete for closed connection");
            return;
        };
        if conn.state() != NegotiationState::GatheringCandidates {
            debug!(conn = id, state = %conn.state(), "duplicate gathering completion");
            return;
        }
        let request = match conn.negotiation_request().await {
            Ok(request) => request,
            Err(e) => {
                error!(conn = id, participant = %conn.participant(), "cannot negotiate: {}", e);
                conn.record_failure(&e);
                return;
            }
        };
        info!(
            conn = id,
            participant = %conn.participant(),
            action = %request.action,
            "ice gathering complete, negotiating"
        );

        let broker = self.collaborators.broker.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = broker.negotiate(request).await;
            let _ = events.send(Event::NegotiationDone { conn: id, result });
        });
    }

    async fn on_negotiation_done(&mut self, id: ConnId, result: Result<NegotiationResponse>) {
        let Some(conn) = self.connection_mut(id) else {
            debug!(conn = id, "discarding negotiation response for closed connection");
            return;
        };
        if conn.state() != NegotiationState::AwaitingRemoteDescription {
            debug!(conn = id, state = %conn.state(), "discarding unexpected negotiation response");
            return;
        }
        let participant = conn.participant().to_owned();
        let outcome = match result {
            Ok(response) => conn.apply_answer(response.sdp).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => info!(conn = id, %participant, "connection active"),
            Err(e) => {
                error!(conn = id, %participant, "negotiation failed: {}", e);
                conn.record_failure(&e);
            }
        }
    }

    pub fn send_chat(&self, text: &str) -> Result<bool> {
        match &self.presence {
            Some(presence) => presence.send_chat(text),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Mute/unmute. Returns the new enabled state of the camera audio.
    pub fn toggle_audio(&self) -> Option<bool> {
        let enabled = self.camera.as_ref()?.toggle_audio()?;
        info!(enabled, "local audio toggled");
        Some(enabled)
    }

    /// Hide/unhide. Returns the new enabled state of the camera video.
    pub fn toggle_video(&self) -> Option<bool> {
        let enabled = self.camera.as_ref()?.toggle_video()?;
        info!(enabled, "local video toggled");
        Some(enabled)
    }

    /// Swaps the track on the publisher's video sender. Never renegotiates.
    pub async fn replace_outbound_video(&self, track: &MediaTrack) -> Result<()> {
        match &self.publishing {
            Publishing::Live(conn) => conn.replace_video_track(track).await,
            _ => Err(Error::NotPublishing),
        }
    }

    /// Puts the camera video back on the publisher's video sender.
    pub async fn restore_outbound_video(&self) -> Result<()> {
        let Some(track) = self.camera.as_ref().and_then(|camera| camera.video_track()) else {
            return Ok(());
        };
        self.replace_outbound_video(track).await
    }

    pub fn start_screen_share(&mut self, reply: Option<Reply>) {
        let refusal = if !matches!(self.publishing, Publishing::Live(_)) {
            Some(Error::NotPublishing)
        } else if self.screen.is_some() || self.screen_pending {
            Some(Error::ScreenShareActive)
        } else {
            None
        };
        if let Some(e) = refusal {
            warn!("screen share not started: {}", e);
            respond(reply, Err(e));
            return;
        }
        self.screen_pending = true;

        let capture = self.collaborators.capture.clone();
        let events = self.events.clone();
        let constraints = self.settings.constraints;
        tokio::spawn(async move {
            let result = capture.acquire_screen(constraints).await;
            let _ = events.send(Event::ScreenAcquired { result, reply });
        });
    }

    async fn on_screen_acquired(&mut self, result: Result<MediaHandle>, reply: Option<Reply>) {
        self.screen_pending = false;
        let screen = match result {
            Ok(screen) => screen,
            Err(e) => {
                error!("screen capture failed: {}", e);
                self.collaborators.renderer.alert(&e.to_string());
                respond(reply, Err(e));
                return;
            }
        };
        let Some(track) = screen.video_track().cloned() else {
            screen.stop();
            respond(reply, Err(Error::PermissionDenied("screen capture has no video".into())));
            return;
        };
        if let Err(e) = self.replace_outbound_video(&track).await {
            warn!("screen share failed: {}", e);
            screen.stop();
            respond(reply, Err(e));
            return;
        }

        self.collaborators.renderer.show_local(&screen);
        self.screen = Some(screen);
        let events = self.events.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = events.send(Event::ScreenShareEnded);
        });
        info!("screen share started");
        respond(reply, Ok(()));
    }

    /// Ends the screen share; the camera comes back once the track-ended
    /// notification is processed.
    pub fn stop_screen_share(&self) {
        if let Some(screen) = &self.screen {
            screen.stop();
        }
    }

    async fn on_screen_share_ended(&mut self) {
        let Some(screen) = self.screen.take() else {
            return;
        };
        screen.stop();
        if let Err(e) = self.restore_outbound_video().await {
            warn!("failed to restore camera video: {}", e);
        }
        if let Some(camera) = &self.camera {
            self.collaborators.renderer.show_local(camera);
        }
        info!("screen share ended");
    }

    /// Closes every connection, stops local media and the presence channel.
    pub async fn shutdown(&mut self) {
        info!("shutting down");
        self.pending.clear();
        let peers: Vec<PeerConnection> = self.registry.drain().collect();
        for mut conn in peers {
            conn.close().await;
            self.collaborators
                .renderer
                .remove_participant(conn.participant());
        }
        if let Publishing::Live(mut conn) =
            std::mem::replace(&mut self.publishing, Publishing::Idle)
        {
            conn.close().await;
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        if let Some(presence) = &self.presence {
            presence.close();
        }
    }
}

fn respond(reply: Option<Reply>, result: Result<()>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
