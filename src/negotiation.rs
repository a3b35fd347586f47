//! Client for the out-of-band negotiation broker.
//!
//! One POST per connection: the gathered local offer goes up, the
//! counterpart answer comes back.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as it travels on the wire: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Subscribe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => write!(f, "publish"),
            Action::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRequest {
    pub action: Action,
    /// Publisher being negotiated: ourselves for `publish`, the remote
    /// participant for `subscribe`.
    #[serde(rename = "publisherID")]
    pub publisher_id: String,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub sdp: SessionDescription,
}

#[async_trait]
pub trait NegotiationBroker: Send + Sync {
    async fn negotiate(&self, request: NegotiationRequest) -> Result<NegotiationResponse>;
}

pub struct HttpBroker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBroker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NegotiationBroker for HttpBroker {
    async fn negotiate(&self, request: NegotiationRequest) -> Result<NegotiationResponse> {
        info!(
            action = %request.action,
            publisher = %request.publisher_id,
            "sending negotiation request"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::NegotiationFailed(format!("broker unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::NegotiationFailed(format!("broker rejected request: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("failed to read broker response: {}", e))
            })?;
        let answer = parse_response(&body)?;
        debug!(
            publisher = %request.publisher_id,
            sdp_type = ?answer.sdp.sdp_type,
            "negotiation response"
        );
        Ok(answer)
    }
}

pub fn parse_response(body: &str) -> Result<NegotiationResponse> {
    serde_json::from_str(body)
        .map_err(|e| Error::NegotiationFailed(format!("malformed broker response: {}", e)))
}
