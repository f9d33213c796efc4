//! Hints request/response wire types and the hints command.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{Method, StatusCode};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{extract_error, SendError, Sender};
use crate::{AgentInfo, FleetError};

/// Endpoint template; `{}` is the agent id.
pub const HINTS_PATH: &str = "/api/fleet/agents/{}/hints";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintsContainer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_name: String,
    #[serde(default)]
    pub runtime: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintsPod {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintsKubernetes {
    #[serde(default)]
    pub container: HintsContainer,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pod: HintsPod,
}

/// Body of `POST /api/fleet/agents/{agent_id}/hints`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintsRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    /// Event type tag, e.g. `Start`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    #[serde(default)]
    pub kubernetes: HintsKubernetes,
}

impl HintsRequest {
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.event_type.is_empty() {
            return Err(FleetError::InvalidRequest("missing hints type".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintsResponse {
    #[serde(default)]
    pub action: String,
}

impl HintsResponse {
    /// Only `created` is an accepted outcome.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.action != "created" {
            return Err(FleetError::InvalidResponse(format!("hints not created (action: '{}')", self.action)));
        }
        Ok(())
    }
}

/// Sends hints for the local agent. No retries and no internal timeout: the
/// cancellation token bounds the call and the caller owns retry policy.
#[derive(Clone)]
pub struct HintsCmd {
    client: Arc<dyn Sender>,
    info: AgentInfo,
}

impl HintsCmd {
    pub fn new(info: AgentInfo, client: Arc<dyn Sender>) -> Self { Self { client, info } }

    pub fn agent_info(&self) -> &AgentInfo { &self.info }

    pub async fn execute(&self, cancel: &CancellationToken, req: &HintsRequest) -> Result<HintsResponse, FleetError> {
        req.validate()?;
        let body = serde_json::to_vec(req).map_err(FleetError::Encode)?;
        let path = HINTS_PATH.replace("{}", self.info.agent_id());
        debug!(path = %path, event_type = %req.event_type, "sending hints");

        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            r = self.client.send(Method::POST, &path, &[], None, Bytes::from(body)) => r,
        };
        histogram!("fleet_hints_request_ms", started.elapsed().as_secs_f64() * 1000.0);

        let resp = match sent {
            Ok(r) => r,
            Err(SendError::Url { source, .. }) => return Err(FleetError::Transport(source)),
            Err(SendError::Network(_)) => return Err(FleetError::ConnRefused),
            Err(e) => return Err(FleetError::Send(e)),
        };

        let status = resp.status();
        counter!("fleet_hints_responses_total", 1u64, "status" => status.as_u16().to_string());
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FleetError::TooManyRequests);
        }
        if status != StatusCode::OK {
            return Err(extract_error(status.as_u16(), resp.body()));
        }

        let hints: HintsResponse = serde_json::from_slice(resp.body()).map_err(FleetError::Decode)?;
        hints.validate()?;
        Ok(hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_requires_type() {
        let mut r = HintsRequest::default();
        assert!(matches!(r.validate(), Err(FleetError::InvalidRequest(_))));
        r.event_type = "Start".into();
        assert!(r.validate().is_ok());
    }

    #[test]
    fn only_created_action_is_accepted() {
        assert!(HintsResponse { action: "created".into() }.validate().is_ok());
        for action in ["", "exists", "failed", "Created"] {
            let err = HintsResponse { action: action.into() }.validate().unwrap_err();
            assert!(matches!(err, FleetError::InvalidResponse(_)), "action {action:?}");
        }
    }

    #[test]
    fn request_wire_shape() {
        let mut r = HintsRequest { agent_id: "a1".into(), event_type: "Start".into(), ..Default::default() };
        r.kubernetes.namespace = "default".into();
        r.kubernetes.container = HintsContainer { id: "c1".into(), image: "nginx".into(), name: "web".into(), runtime: "containerd".into(), ..Default::default() };
        r.kubernetes.pod = HintsPod { ip: "10.0.0.1".into(), name: "web-0".into(), uid: "abc".into() };
        r.kubernetes.labels.insert("app".into(), "web".into());
        let v = serde_json::to_value(&r).expect("encode");
        assert_eq!(
            v,
            serde_json::json!({
                "agent_id": "a1",
                "type": "Start",
                "kubernetes": {
                    "container": {"id": "c1", "image": "nginx", "name": "web", "runtime": "containerd"},
                    "namespace": "default",
                    "annotations": {},
                    "labels": {"app": "web"},
                    "pod": {"ip": "10.0.0.1", "name": "web-0", "uid": "abc"}
                }
            })
        );
    }
}
