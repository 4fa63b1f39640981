//! Wire frames and handshake payloads.
//!
//! Every message on the socket is a JSON text frame tagged by `type`:
//!
//! - `{"type":"req","id":"…","method":"…","params":{…}}`
//! - `{"type":"res","id":"…","ok":true,"payload":{…}}` or `{"type":"res","id":"…","ok":false,"error":{…}}`
//! - `{"type":"event","event":"…","payload":{…},"seq":42}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by this client (sent as both min and max bound).
pub const PROTOCOL_VERSION: u32 = 3;

/// Name of the challenge event sent by servers before the handshake.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Payload on success, error shape otherwise. A failed response without an
    /// error body gets a synthetic one.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorShape {
                code: "UNKNOWN".to_string(),
                message: "request failed without error details".to_string(),
                details: None,
                retryable: None,
                retry_after_ms: None,
            }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Client identity announced in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    /// Echo of the `connect.challenge` nonce, when one was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Static handshake configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub client_id: String,
    pub client_version: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub token: Option<String>,
    pub password: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            client_id: "gateway-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            display_name: None,
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
            role: "operator".to_string(),
            scopes: vec![
                "operator.admin".to_string(),
                "operator.approvals".to_string(),
            ],
            caps: Vec::new(),
            token: None,
            password: None,
        }
    }
}

impl HandshakeConfig {
    /// Build the `connect` params. `device_token` (from a previous hello)
    /// takes precedence over the configured token.
    pub fn connect_params(
        &self,
        nonce: Option<String>,
        device_token: Option<String>,
    ) -> ConnectParams {
        let token = device_token.or_else(|| self.token.clone());
        let auth = (token.is_some() || self.password.is_some()).then(|| AuthParams {
            token,
            password: self.password.clone(),
        });

        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.client_id.clone(),
                version: self.client_version.clone(),
                platform: self.platform.clone(),
                mode: self.mode.clone(),
                display_name: self.display_name.clone(),
                instance_id: None,
            },
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            caps: self.caps.clone(),
            auth,
            nonce,
            locale: None,
            user_agent: Some(format!("helix-gateway/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

/// Successful handshake response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
    #[serde(default)]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
}

impl HelloOk {
    pub fn device_token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .and_then(|auth| auth.device_token.as_deref())
            .filter(|token| !token.is_empty())
    }
}

pub fn decode_frame(text: &str) -> serde_json::Result<Frame> {
    serde_json::from_str(text)
}

pub fn encode_frame(frame: &Frame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}
