use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventSender, PresenceEvent};

/// Inbound relay frame: `{action, participantID, message?}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum RelayMessage {
    Join {
        #[serde(rename = "participantID")]
        participant_id: String,
    },
    Leave {
        #[serde(rename = "participantID")]
        participant_id: String,
    },
    Chat {
        #[serde(rename = "participantID")]
        participant_id: String,
        #[serde(default)]
        message: String,
    },
}

impl From<RelayMessage> for PresenceEvent {
    fn from(msg: RelayMessage) -> Self {
        match msg {
            RelayMessage::Join { participant_id } => PresenceEvent::Join(participant_id),
            RelayMessage::Leave { participant_id } => PresenceEvent::Leave(participant_id),
            RelayMessage::Chat {
                participant_id,
                message,
            } => PresenceEvent::Chat {
                participant: participant_id,
                text: message,
            },
        }
    }
}

pub fn parse_frame(text: &str) -> Result<PresenceEvent> {
    let msg: RelayMessage = serde_json::from_str(text)?;
    Ok(msg.into())
}

/// Duplex connection to the presence relay.
///
/// Inbound frames become [`PresenceEvent`]s on the orchestrator queue,
/// starting with `Opened` and ending with `Closed`. Outbound chat goes out
/// as raw text frames.
pub struct PresenceChannel {
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl PresenceChannel {
    pub async fn connect(url: Url, events: EventSender) -> Result<Self> {
        info!(%url, "connecting to presence relay");
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(AtomicBool::new(false));

        // Handle outgoing messages
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("presence send failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        // Handle incoming messages
        let reader_closed = closed.clone();
        let _ = events.send(Event::Presence(PresenceEvent::Opened));
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        debug!(frame = %text, "presence message");
                        match parse_frame(&text) {
                            Ok(event) => {
                                if events.send(Event::Presence(event)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(frame = %text, "ignoring presence frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("presence connection error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            info!("presence channel closed");
            let _ = events.send(Event::Presence(PresenceEvent::Closed));
        });

        Ok(Self { tx, closed })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends chat text as-is. Empty text is skipped (`Ok(false)`).
    pub fn send_chat(&self, text: &str) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if text.is_empty() {
            return Ok(false);
        }
        self.tx.send(Message::Text(text.to_owned())).map_err(|_| {
            self.closed.store(true, Ordering::SeqCst);
            Error::ChannelClosed
        })?;
        Ok(true)
    }

    pub fn close(&self) {
        if !self.is_closed() {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}
