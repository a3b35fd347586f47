//! Full-mesh media room client.
//!
//! Each participant publishes one outbound media + data stream and
//! subscribes to every other participant. Presence (join/leave/chat) comes
//! over a relay WebSocket; SDP is exchanged once per connection with an
//! HTTP negotiation broker after ICE gathering finishes.

pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod negotiation;
pub mod orchestrator;
pub mod peer;
pub mod presence;
pub mod registry;
pub mod render;
pub mod rtc;

pub use error::{Error, Result};
pub use orchestrator::{Collaborators, Orchestrator, Settings};
