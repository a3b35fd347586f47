use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_room::config::Config;
use mesh_room::event::{self, Command, Event, EventSender};
use mesh_room::media::TrackCapture;
use mesh_room::negotiation::HttpBroker;
use mesh_room::presence::PresenceChannel;
use mesh_room::render::LogRenderer;
use mesh_room::rtc::RtcPeerFactory;
use mesh_room::{Collaborators, Orchestrator, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mesh_room=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    let participant_id = config.participant_id();
    info!(room = %config.room, participant = %participant_id, "starting mesh room client");

    let (events_tx, events_rx) = event::channel();

    let collaborators = Collaborators {
        factory: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())?),
        broker: Arc::new(HttpBroker::new(config.broker_url.clone())),
        capture: Arc::new(TrackCapture::new(participant_id.clone(), true, config.allow_screen)),
        renderer: Arc::new(LogRenderer),
    };
    let settings = Settings {
        local_id: participant_id.clone(),
        subscribe_delay: config.subscribe_delay(),
        constraints: config.constraints(),
    };
    let mut orchestrator = Orchestrator::new(settings, collaborators, events_tx.clone());

    let presence_url = config.presence_url(&participant_id)?;
    let presence = PresenceChannel::connect(presence_url, events_tx.clone())
        .await
        .map_err(|e| {
            error!("Failed to connect to presence relay: {}", e);
            e
        })?;
    orchestrator.attach_presence(presence);

    tokio::spawn(read_commands(events_tx.clone()));
    tokio::spawn(shutdown_on_ctrl_c(events_tx));

    orchestrator.run(events_rx).await;
    info!("bye");
    Ok(())
}

/// Terminal input: chat lines plus /mute, /hide, /share, /unshare, /quit.
async fn read_commands(events: EventSender) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(command) = Command::parse(&line) {
                    if events.send(Event::Command(command)).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("stdin read failed: {}", e);
                break;
            }
        }
    }
}

async fn shutdown_on_ctrl_c(events: EventSender) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let _ = events.send(Event::Command(Command::Shutdown));
    }
}
