#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use mesh_room::event::{self, Event, EventReceiver, EventSender, PeerEvent, RemoteTrack};
use mesh_room::media::{
    Capture, MediaConstraints, MediaHandle, MediaSourceKind, MediaTrack, TrackKind,
};
use mesh_room::negotiation::{
    NegotiationBroker, NegotiationRequest, NegotiationResponse, SessionDescription,
};
use mesh_room::peer::{ConnId, PeerFactory, PeerLink, PeerSetup, Role};
use mesh_room::render::Renderer;
use mesh_room::{Collaborators, Error, Orchestrator, Result, Settings};

pub const LOCAL: &str = "p1";
pub const DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
pub struct LinkRecord {
    pub conn: ConnId,
    pub participant: String,
    pub role: Option<Role>,
    pub attached_tracks: Vec<String>,
    pub remote: Option<SessionDescription>,
    pub replaced: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
pub struct FakeFactory {
    /// Links that never report gathering completion.
    pub stall_gathering: bool,
    /// Roles the factory refuses to build.
    pub failing_roles: Vec<Role>,
    pub links: Mutex<Vec<Arc<Mutex<LinkRecord>>>>,
}

impl FakeFactory {
    pub fn records_for(&self, participant: &str) -> Vec<Arc<Mutex<LinkRecord>>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.lock().unwrap().participant == participant)
            .cloned()
            .collect()
    }

    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

struct FakeLink {
    record: Arc<Mutex<LinkRecord>>,
    events: EventSender,
    gather: bool,
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let (conn, participant) = {
            let record = self.record.lock().unwrap();
            (record.conn, record.participant.clone())
        };
        if self.gather {
            let _ = self
                .events
                .send(Event::peer(conn, &participant, PeerEvent::GatheringComplete));
        }
        Ok(SessionDescription::offer(format!("offer-{}", participant)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let participant = self.record.lock().unwrap().participant.clone();
        Some(SessionDescription::offer(format!("offer-{}", participant)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record.lock().unwrap().remote = Some(description);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<()> {
        self.record.lock().unwrap().replaced.push(track.id().to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record.lock().unwrap().closed = true;
        Ok(())
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, setup: PeerSetup) -> Result<Box<dyn PeerLink>> {
        if self.failing_roles.contains(&setup.role) {
            return Err(Error::Other(anyhow::anyhow!("transport unavailable")));
        }
        let record = Arc::new(Mutex::new(LinkRecord {
            conn: setup.conn,
            participant: setup.participant.clone(),
            role: Some(setup.role),
            attached_tracks: setup
                .media
                .iter()
                .flat_map(|media| media.tracks().map(|track| track.id().to_owned()))
                .collect(),
            ..Default::default()
        }));
        self.links.lock().unwrap().push(record.clone());
        Ok(Box::new(FakeLink {
            record,
            events: setup.events,
            gather: !self.stall_gathering,
        }))
    }
}

pub struct FakeBroker {
    pub requests: Mutex<Vec<NegotiationRequest>>,
    pub failing: HashSet<String>,
    /// Each response waits for one permit.
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            gate: None,
        }
    }

    pub fn requests(&self) -> Vec<NegotiationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, publisher: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.publisher_id == publisher)
            .count()
    }
}

#[async_trait]
impl NegotiationBroker for FakeBroker {
    async fn negotiate(&self, request: NegotiationRequest) -> Result<NegotiationResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| Error::NegotiationFailed(e.to_string()))?;
            permit.forget();
        }
        if self.failing.contains(&request.publisher_id) {
            return Err(Error::NegotiationFailed("broker returned 502".into()));
        }
        Ok(NegotiationResponse {
            sdp: SessionDescription::answer(format!("answer-{}", request.publisher_id)),
        })
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub deny_camera: bool,
    pub deny_screen: bool,
    /// Every handle handed out, camera and screen.
    pub acquired: Mutex<Vec<MediaHandle>>,
}

impl FakeCapture {
    pub fn acquired(&self) -> Vec<MediaHandle> {
        self.acquired.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capture for FakeCapture {
    async fn acquire_camera(&self, constraints: MediaConstraints) -> Result<MediaHandle> {
        if self.deny_camera {
            return Err(Error::PermissionDenied("no permission to access camera".into()));
        }
        let media = MediaHandle::new(
            MediaSourceKind::Camera,
            "camera",
            constraints
                .audio
                .then(|| MediaTrack::new(TrackKind::Audio, "camera-audio", "camera")),
            constraints
                .video
                .then(|| MediaTrack::new(TrackKind::Video, "camera-video", "camera")),
        );
        self.acquired.lock().unwrap().push(media.clone());
        Ok(media)
    }

    async fn acquire_screen(&self, _constraints: MediaConstraints) -> Result<MediaHandle> {
        if self.deny_screen {
            return Err(Error::PermissionDenied("no permission to access screen".into()));
        }
        let media = MediaHandle::new(
            MediaSourceKind::Screen,
            "screen",
            None,
            Some(MediaTrack::new(TrackKind::Video, "screen-video", "screen")),
        );
        self.acquired.lock().unwrap().push(media.clone());
        Ok(media)
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    pub calls: Mutex<Vec<String>>,
    pub mounted: Mutex<HashMap<String, usize>>,
}

impl FakeRenderer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Renderer for FakeRenderer {
    fn mount_participant(&self, participant: &str) {
        *self
            .mounted
            .lock()
            .unwrap()
            .entry(participant.to_owned())
            .or_default() += 1;
        self.record(format!("mount {}", participant));
    }

    fn attach_track(&self, participant: &str, track: &RemoteTrack) {
        self.record(format!("track {} {}", participant, track.kind));
    }

    fn remove_participant(&self, participant: &str) {
        self.mounted.lock().unwrap().remove(participant);
        self.record(format!("remove {}", participant));
    }

    fn append_chat(&self, participant: &str, text: &str) {
        self.record(format!("chat {}: {}", participant, text));
    }

    fn show_local(&self, media: &MediaHandle) {
        self.record(format!("local {}", media.stream_id()));
    }

    fn alert(&self, message: &str) {
        self.record(format!("alert {}", message));
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub rx: EventReceiver,
    pub factory: Arc<FakeFactory>,
    pub broker: Arc<FakeBroker>,
    pub capture: Arc<FakeCapture>,
    pub renderer: Arc<FakeRenderer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeFactory::default(), FakeBroker::new(), FakeCapture::default())
    }

    pub fn with(factory: FakeFactory, broker: FakeBroker, capture: FakeCapture) -> Self {
        let (tx, rx) = event::channel();
        let factory = Arc::new(factory);
        let broker = Arc::new(broker);
        let capture = Arc::new(capture);
        let renderer = Arc::new(FakeRenderer::default());
        let orchestrator = Orchestrator::new(
            Settings {
                local_id: LOCAL.into(),
                subscribe_delay: DELAY,
                constraints: MediaConstraints::default(),
            },
            Collaborators {
                factory: factory.clone(),
                broker: broker.clone(),
                capture: capture.clone(),
                renderer: renderer.clone(),
            },
            tx,
        );
        Self {
            orchestrator,
            rx,
            factory,
            broker,
            capture,
            renderer,
        }
    }

    /// Processes queued events until spawned work has gone quiet.
    pub async fn settle(&mut self) {
        let mut idle = 0;
        while idle < 32 {
            tokio::task::yield_now().await;
            match self.rx.try_recv() {
                Ok(event) => {
                    idle = 0;
                    let _ = self.orchestrator.handle(event).await;
                }
                Err(_) => idle += 1,
            }
        }
    }

    pub async fn deliver(&mut self, event: Event) {
        let _ = self.orchestrator.handle(event).await;
        self.settle().await;
    }

    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.settle().await;
    }
}
