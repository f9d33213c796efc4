//! autodisco fleet: remote hints dispatch to a fleet-management server.
//!
//! [`HintsCmd`] is a stateless request/response wrapper over any [`Sender`];
//! [`FleetClient`] is the reqwest-backed sender used in production.

#![forbid(unsafe_code)]

mod client;
mod hints;

pub use client::{extract_error, ApiError, BoxError, ClientOptions, FleetClient, SendError, Sender};
pub use hints::{HintsCmd, HintsContainer, HintsKubernetes, HintsPod, HintsRequest, HintsResponse, HINTS_PATH};

/// Failures of a hints round trip.
///
/// Sentinels ([`FleetError::ConnRefused`], [`FleetError::TooManyRequests`]) are
/// meant to be matched on; retry policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid hints request: {0}")]
    InvalidRequest(String),
    #[error("fail to encode the hints request")]
    Encode(#[source] serde_json::Error),
    #[error("connection refused")]
    ConnRefused,
    #[error("too many requests")]
    TooManyRequests,
    /// Inner cause of a URL-level transport failure.
    #[error("{0}")]
    Transport(BoxError),
    #[error(transparent)]
    Send(SendError),
    #[error(transparent)]
    Api(ApiError),
    #[error("unexpected response (status {status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
    #[error("fail to decode hints response")]
    Decode(#[source] serde_json::Error),
    #[error("invalid hints response: {0}")]
    InvalidResponse(String),
}

impl FleetError {
    /// Local validation or decode failure; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::InvalidRequest(_) | FleetError::Encode(_) | FleetError::Decode(_) | FleetError::InvalidResponse(_)
        )
    }
}

/// Identity of the local agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    agent_id: String,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>) -> Self { Self { agent_id: agent_id.into() } }

    /// Fresh random identity, for agents that were never enrolled.
    pub fn generate() -> Self { Self::new(uuid::Uuid::new_v4().to_string()) }

    pub fn agent_id(&self) -> &str { &self.agent_id }
}
