use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn capability(self) -> RTCRtpCodecCapability {
        let mime_type = match self {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A local track shared between the capture side and any sender it is
/// attached to. Enablement and end-of-track are shared across clones.
#[derive(Clone)]
pub struct MediaTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: Arc<watch::Sender<bool>>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            kind.capability(),
            id.to_owned(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(ended),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    /// The transport-level track to attach to a sender.
    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Writes one encoded frame. Returns `false` when the track is
    /// disabled or ended and the frame was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(false);
        }
        self.track.write_sample(sample).await?;
        Ok(true)
    }

    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the track has been stopped.
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSourceKind {
    Camera,
    Screen,
}

/// A local stream: at most one audio and one video track.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    source: MediaSourceKind,
    stream_id: String,
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
}

impl MediaHandle {
    pub fn new(
        source: MediaSourceKind,
        stream_id: impl Into<String>,
        audio: Option<MediaTrack>,
        video: Option<MediaTrack>,
    ) -> Self {
        Self {
            source,
            stream_id: stream_id.into(),
            audio,
            video,
        }
    }

    pub fn source(&self) -> MediaSourceKind {
        self.source
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Flips audio enablement; `None` without an audio track.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.audio.as_ref().map(toggle)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.video.as_ref().map(toggle)
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

fn toggle(track: &MediaTrack) -> bool {
    let enabled = !track.is_enabled();
    track.set_enabled(enabled);
    enabled
}

#[async_trait]
pub trait Capture: Send + Sync {
    async fn acquire_camera(&self, constraints: MediaConstraints) -> Result<MediaHandle>;
    async fn acquire_screen(&self, constraints: MediaConstraints) -> Result<MediaHandle>;
}

/// Hands out sample-fed tracks; frames are pushed through
/// [`MediaTrack::write_sample`] by whatever device feeder is attached.
pub struct TrackCapture {
    stream_prefix: String,
    allow_camera: bool,
    allow_screen: bool,
}

impl TrackCapture {
    pub fn new(stream_prefix: impl Into<String>, allow_camera: bool, allow_screen: bool) -> Self {
        Self {
            stream_prefix: stream_prefix.into(),
            allow_camera,
            allow_screen,
        }
    }
}

#[async_trait]
impl Capture for TrackCapture {
    async fn acquire_camera(&self, constraints: MediaConstraints) -> Result<MediaHandle> {
        if !self.allow_camera {
            return Err(Error::PermissionDenied("no permission to access camera".into()));
        }
        let stream_id = format!("{}-camera", self.stream_prefix);
        let audio = constraints
            .audio
            .then(|| MediaTrack::new(TrackKind::Audio, "camera-audio", &stream_id));
        let video = constraints
            .video
            .then(|| MediaTrack::new(TrackKind::Video, "camera-video", &stream_id));
        info!(
            stream = %stream_id,
            audio = constraints.audio,
            video = constraints.video,
            "camera acquired"
        );
        Ok(MediaHandle::new(MediaSourceKind::Camera, stream_id, audio, video))
    }

    async fn acquire_screen(&self, _constraints: MediaConstraints) -> Result<MediaHandle> {
        if !self.allow_screen {
            return Err(Error::PermissionDenied("no permission to access screen".into()));
        }
        let stream_id = format!("{}-screen", self.stream_prefix);
        let video = MediaTrack::new(TrackKind::Video, "screen-video", &stream_id);
        debug!(stream = %stream_id, "screen acquired");
        Ok(MediaHandle::new(MediaSourceKind::Screen, stream_id, None, Some(video)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn camera_honours_constraints() {
        let capture = TrackCapture::new("p1", true, true);
        let media = capture
            .acquire_camera(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(media.source(), MediaSourceKind::Camera);
        assert!(media.audio_track().is_some());
        assert!(media.video_track().is_none());
        assert_eq!(media.tracks().count(), 1);
    }

    #[tokio::test]
    async fn refused_capture_is_permission_denied() {
        let capture = TrackCapture::new("p1", false, false);
        let err = capture.acquire_camera(MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        let err = capture.acquire_screen(MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn toggles_are_independent_and_shared_across_clones() {
        let capture = TrackCapture::new("p1", true, true);
        let media = capture.acquire_camera(MediaConstraints::default()).await.unwrap();
        let shared = media.clone();

        assert_eq!(media.toggle_audio(), Some(false));
        assert!(!shared.audio_track().unwrap().is_enabled());
        assert!(shared.video_track().unwrap().is_enabled());

        assert_eq!(shared.toggle_video(), Some(false));
        assert_eq!(media.toggle_audio(), Some(true));
        assert!(!media.video_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn disabled_track_drops_samples() {
        let track = MediaTrack::new(TrackKind::Audio, "a", "s");
        track.set_enabled(false);
        let sample = Sample {
            data: Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(!track.write_sample(&sample).await.unwrap());
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, "v", "s");
        let watcher = track.clone();
        let waiting = tokio::spawn(async move { watcher.ended().await });
        tokio::task::yield_now().await;
        assert!(!track.is_ended());
        track.stop();
        waiting.await.unwrap();
        assert!(track.is_ended());
    }
}
