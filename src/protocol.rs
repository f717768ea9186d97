//! Wire protocol for function runs.
//!
//! ## Wire Format: NDJSON (Newline-Delimited JSON)
//!
//! Each message is a single JSON object terminated by `\n` (0x0A).
//!
//! - **Request**: one [`RunFunctionRequest`] NDJSON line.
//! - **Response**: exactly one terminal [`WireMessage`] NDJSON line, either
//!   `Ok` carrying the function's response or `Error` naming the failing
//!   pipeline stage.
//!
//! ## Ownership
//!
//! The request/response payload schemas are externally owned. The runner
//! reads only the fields it needs (image, pull policy, auth, resource
//! limits, network policy, timeout); the rest of the request round-trips
//! through `#[serde(flatten)]` capture, and the response is carried as the
//! raw bytes the function wrote so the caller receives them untouched.

use std::time::Duration;

use serde::{de, Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::constants::DEFAULT_RUN_TIMEOUT;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Requests (caller → runner)
// ---------------------------------------------------------------------------

/// A request to run a function packaged as an OCI image.
///
/// Only `config` is interpreted; all other fields are opaque payload that
/// must reach the function byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFunctionRequest {
    /// Per-run configuration consumed by the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunFunctionRequestConfig>,

    /// Opaque payload owned by the caller's schema.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// The runner-consumed section of a [`RunFunctionRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionRequestConfig {
    /// Image to run. Falls back to the configured default image when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// How (and whether) the image may be pulled from a registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_config: Option<ImagePullConfig>,

    /// Execution configuration for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_function_config: Option<RunFunctionConfig>,
}

/// Image pull policy and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullConfig {
    /// Pull policy. Defaults to `IfNotPresent`.
    #[serde(default)]
    pub pull_policy: ImagePullPolicy,

    /// Registry credentials, resolved by the caller before the request
    /// enters the sandbox. The sandboxed process never reads ambient
    /// credential state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ImagePullAuth>,
}

/// Whether an image may be pulled from a remote registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    /// Always contact the registry, updating the digest cache on success.
    Always,
    /// Resolve purely from the digest cache; never contact the registry.
    Never,
    /// Use the cache when its content is present; otherwise pull.
    #[default]
    IfNotPresent,
}

/// Registry credentials passed as explicit structured fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Opaque auth string (typically base64 `user:pass`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_token: String,
}

impl ImagePullAuth {
    /// True when no credential field is populated.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.auth.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

/// Execution configuration for a single run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionConfig {
    /// Maximum time the function may run before being killed, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Per-run resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceConfig>,

    /// Network policy for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}

impl RunFunctionConfig {
    /// The run deadline: the request's timeout, or the fixed default.
    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_RUN_TIMEOUT,
        }
    }
}

/// Resource limits for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
}

/// Kubernetes-style resource quantities. Empty means unset/unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU, in cores (`500m` = 0.5 cores).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory, in bytes (`500Mi` = 500 * 1024 * 1024 bytes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Network configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub policy: NetworkPolicy,
}

/// Whether a function is isolated from the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkPolicy {
    /// Share the runner's network namespace.
    Runner,
    /// Private, unconfigured network namespace: no reachable interfaces.
    #[default]
    Isolated,
}

// ---------------------------------------------------------------------------
// Responses (function → runner → caller)
// ---------------------------------------------------------------------------

/// A function's response: the raw JSON text the function wrote, validated
/// as one object but otherwise untouched. Serializing embeds that text
/// verbatim, so the caller receives exactly the bytes the function said.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunFunctionResponse {
    pub payload: Box<RawValue>,
}

/// Terminal server message for one request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WireMessage {
    /// The run succeeded; `response` is the function's payload.
    Ok { response: RunFunctionResponse },
    /// The run failed at `stage` with `message`.
    Error { stage: String, message: String },
}

impl WireMessage {
    /// Builds the error message for a failed run.
    pub fn from_error(err: &Error) -> Self {
        Self::Error {
            stage: err.stage().to_string(),
            message: err.to_string(),
        }
    }
}

// Deserialized by hand: the internally-tagged derive buffers field values
// before matching the tag, and buffering loses `RawValue`'s span over the
// input text.
impl<'de> Deserialize<'de> for WireMessage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "lowercase")]
        enum Status {
            Ok,
            Error,
        }

        #[derive(Deserialize)]
        struct Envelope {
            status: Status,
            #[serde(default)]
            response: Option<RunFunctionResponse>,
            #[serde(default)]
            stage: Option<String>,
            #[serde(default)]
            message: Option<String>,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        match envelope.status {
            Status::Ok => Ok(WireMessage::Ok {
                response: envelope
                    .response
                    .ok_or_else(|| de::Error::missing_field("response"))?,
            }),
            Status::Error => Ok(WireMessage::Error {
                stage: envelope
                    .stage
                    .ok_or_else(|| de::Error::missing_field("stage"))?,
                message: envelope
                    .message
                    .ok_or_else(|| de::Error::missing_field("message"))?,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Decodes a request from serialized bytes.
pub fn decode_request(bytes: &[u8]) -> Result<RunFunctionRequest> {
    serde_json::from_slice(bytes).map_err(|e| Error::ResponseDecode(format!("request: {}", e)))
}

/// Encodes a request to serialized bytes.
pub fn encode_request(req: &RunFunctionRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(req).map_err(|e| Error::ResponseDecode(format!("request: {}", e)))
}

/// Validates that `bytes` holds exactly one JSON object and captures it as
/// the response payload.
///
/// The payload is not otherwise interpreted; its raw text travels through
/// every later re-serialization unchanged.
pub fn decode_response(bytes: &[u8]) -> Result<RunFunctionResponse> {
    let payload: Box<RawValue> = serde_json::from_slice(bytes)
        .map_err(|e| Error::ResponseDecode(format!("response: {}", e)))?;
    if !payload.get().starts_with('{') {
        return Err(Error::ResponseDecode(
            "response is not a JSON object".to_string(),
        ));
    }
    Ok(RunFunctionResponse { payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = br#"{"observed":{"a":1},"desired":{"b":[2,3]},"config":{"image":"example.com/fn:v1"}}"#;
        let req = decode_request(raw).unwrap();
        assert_eq!(
            req.config.as_ref().unwrap().image.as_deref(),
            Some("example.com/fn:v1")
        );
        assert!(req.payload.contains_key("observed"));
        assert!(req.payload.contains_key("desired"));

        let encoded = encode_request(&req).unwrap();
        let again = decode_request(&encoded).unwrap();
        assert_eq!(req.payload, again.payload);
    }

    #[test]
    fn test_defaults() {
        let cfg = RunFunctionConfig::default();
        assert_eq!(cfg.timeout(), DEFAULT_RUN_TIMEOUT);
        assert_eq!(ImagePullPolicy::default(), ImagePullPolicy::IfNotPresent);
        assert_eq!(NetworkPolicy::default(), NetworkPolicy::Isolated);
    }

    #[test]
    fn test_timeout_from_request() {
        let cfg = RunFunctionConfig {
            timeout_seconds: Some(5),
            ..Default::default()
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_response_must_be_one_json_object() {
        assert!(decode_response(br#"{"results":[]}"#).is_ok());
        assert!(decode_response(b"not json").is_err());
        assert!(decode_response(b"").is_err());
        assert!(decode_response(b"[1,2]").is_err());
        assert!(decode_response(b"42").is_err());
    }

    #[test]
    fn test_response_bytes_survive_reencoding() {
        // Key order, number formatting and spacing are the function's
        // business; the wire must carry its text verbatim.
        let raw = br#"{"b": 1, "a": {"x": 1.10, "y": 3e2}}"#;
        let message = WireMessage::Ok {
            response: decode_response(raw).unwrap(),
        };

        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains(r#"{"b": 1, "a": {"x": 1.10, "y": 3e2}}"#));

        match serde_json::from_str::<WireMessage>(&encoded).unwrap() {
            WireMessage::Ok { response } => {
                assert_eq!(response.payload.get().as_bytes(), raw);
            }
            WireMessage::Error { .. } => panic!("round trip changed the message kind"),
        }
    }

    #[test]
    fn test_anonymous_auth() {
        assert!(ImagePullAuth::default().is_anonymous());
        let auth = ImagePullAuth {
            username: "u".into(),
            ..Default::default()
        };
        assert!(!auth.is_anonymous());
    }
}
