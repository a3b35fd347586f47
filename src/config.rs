use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::media::MediaConstraints;

/// Mesh room client
///
/// Joins a room on the presence relay, publishes the local camera and
/// subscribes to every other participant.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Presence relay WebSocket URL
    #[arg(
        long,
        default_value = "wss://chat-room-websocket-backend.herokuapp.com/",
        env = "MESH_RELAY_URL"
    )]
    pub relay_url: String,

    /// Negotiation broker HTTP endpoint
    #[arg(long, default_value = "https://freewebrtcserver.com", env = "MESH_BROKER_URL")]
    pub broker_url: String,

    /// Room to join
    #[arg(short, long, default_value = "testRoom", env = "MESH_ROOM")]
    pub room: String,

    /// Local participant id (random when omitted)
    #[arg(short, long, env = "MESH_PARTICIPANT_ID")]
    pub participant_id: Option<String>,

    /// STUN/TURN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "MESH_ICE_SERVERS"
    )]
    pub ice_servers: Vec<String>,

    /// Delay before subscribing to a newly joined participant
    #[arg(long, default_value_t = 1000, env = "MESH_SUBSCRIBE_DELAY_MS")]
    pub subscribe_delay_ms: u64,

    /// Do not capture the microphone
    #[arg(long)]
    pub no_audio: bool,

    /// Do not capture the camera
    #[arg(long)]
    pub no_video: bool,

    /// Permit screen capture for screen sharing
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "MESH_ALLOW_SCREEN")]
    pub allow_screen: bool,
}

impl Config {
    pub fn participant_id(&self) -> String {
        self.participant_id
            .clone()
            .unwrap_or_else(|| format!("user-{}", rand::random::<u32>()))
    }

    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: !self.no_audio,
            video: !self.no_video,
        }
    }

    /// Relay URL with the room and participant carried as query parameters.
    pub fn presence_url(&self, participant_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.relay_url).map_err(|e| {
            Error::Other(anyhow::anyhow!("invalid relay url {}: {}", self.relay_url, e))
        })?;
        url.query_pairs_mut()
            .append_pair("room", &self.room)
            .append_pair("name", participant_id);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_public_services() {
        let config = Config::parse_from(["mesh-room"]);
        assert_eq!(config.room, "testRoom");
        assert_eq!(config.subscribe_delay(), Duration::from_secs(1));
        assert_eq!(config.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.allow_screen);
        assert_eq!(
            config.constraints(),
            MediaConstraints {
                audio: true,
                video: true
            }
        );
    }

    #[test]
    fn presence_url_carries_room_and_name() {
        let config = Config::parse_from([
            "mesh-room",
            "--relay-url",
            "ws://relay.local:8080/",
            "--room",
            "standup",
        ]);
        let url = config.presence_url("p1").unwrap();
        assert_eq!(url.as_str(), "ws://relay.local:8080/?room=standup&name=p1");
    }

    #[test]
    fn generated_participant_id_is_prefixed() {
        let config = Config::parse_from(["mesh-room"]);
        assert!(config.participant_id().starts_with("user-"));
        let fixed = Config::parse_from(["mesh-room", "--participant-id", "alice"]);
        assert_eq!(fixed.participant_id(), "alice");
    }

    #[test]
    fn screen_capture_can_be_refused() {
        let config = Config::parse_from(["mesh-room", "--allow-screen", "false", "--no-video"]);
        assert!(!config.allow_screen);
        assert!(!config.constraints().video);
    }
}
