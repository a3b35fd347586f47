use tracing::{info, warn};

use crate::event::RemoteTrack;
use crate::media::MediaHandle;

/// Presentation side of the room: video sinks per participant, chat log,
/// local preview and user-facing alerts.
pub trait Renderer: Send + Sync {
    /// Creates the video sink for a participant.
    fn mount_participant(&self, participant: &str);

    fn attach_track(&self, participant: &str, track: &RemoteTrack);

    fn remove_participant(&self, participant: &str);

    fn append_chat(&self, participant: &str, text: &str);

    fn show_local(&self, media: &MediaHandle);

    fn alert(&self, message: &str);
}

/// Renders to the log; used by the terminal client.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn mount_participant(&self, participant: &str) {
        info!(%participant, "participant video mounted");
    }

    fn attach_track(&self, participant: &str, track: &RemoteTrack) {
        info!(
            %participant,
            kind = %track.kind,
            track = %track.id,
            stream = %track.stream_id,
            "remote track attached"
        );
    }

    fn remove_participant(&self, participant: &str) {
        info!(%participant, "participant video removed");
    }

    fn append_chat(&self, participant: &str, text: &str) {
        println!("{}: {}", participant, text);
    }

    fn show_local(&self, media: &MediaHandle) {
        info!(source = ?media.source(), stream = %media.stream_id(), "local preview");
    }

    fn alert(&self, message: &str) {
        warn!("{}", message);
        eprintln!("{}", message);
    }
}
