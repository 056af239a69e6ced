// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Handshake — the `connect` request that must open every connection.
//!
//! The gateway parks a freshly accepted connection in an unauthenticated
//! state with a short read deadline; until a `connect` succeeds, every other
//! frame is rejected. `connect` carries the client's protocol window, its
//! identity, and (for non-loopback binds) a token or password.
//!
//! Protocol versioning is a single integer. The connection fails with
//! `VERSION_MISMATCH` when the client's `[min_protocol, max_protocol]`
//! window does not contain the server's version.

use serde::{Deserialize, Serialize};

use crate::frame::{ErrorCode, WireError};

/// The protocol version this gateway speaks.
pub const PROTOCOL_VERSION: u32 = 3;

// ── Roles & scopes ────────────────────────────────────────────────────────────

/// What kind of client sits on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Control-plane UI: dashboard, CLI, mobile app.
    Operator,
    /// Remote capability host (exec, camera, screen).
    Node,
    /// A transport bridge feeding inbound messages and delivering outbound.
    ChannelPlugin,
}

/// Capability granted to a connection. Checked per method by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    Read,
    Write,
    Admin,
    Approvals,
    Pairing,
}

/// Scopes a role receives when the handshake names none.
///
/// Nodes get nothing on the control plane (they answer invokes, they do not
/// issue them); operators get `read` unless elevated by configuration.
pub fn default_scopes(role: Role) -> Vec<Scope> {
    match role {
        Role::Operator => vec![Scope::Read],
        Role::Node => vec![],
        Role::ChannelPlugin => vec![Scope::Read, Scope::Write],
    }
}

// ── Connect request ───────────────────────────────────────────────────────────

/// Client identity block inside `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// Shared-secret credentials. Exactly one of the fields is expected for
/// non-loopback binds; tunnel-identity mode presents neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Params of the `connect` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub client: ClientInfo,
    pub min_protocol: u32,
    pub max_protocol: u32,
    #[serde(default)]
    pub auth: Option<ConnectAuth>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub scope: Option<Vec<Scope>>,
    #[serde(default)]
    pub device_id: Option<String>,
}

// ── Hello reply ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Method and event names the server exposes, for client feature detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Payload of the successful `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    /// Always the literal `"hello-ok"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

impl HelloOk {
    pub fn new(server_version: impl Into<String>, host: Option<String>) -> Self {
        Self {
            kind: "hello-ok".into(),
            protocol: PROTOCOL_VERSION,
            server: ServerInfo {
                version: server_version.into(),
                host,
            },
            features: None,
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = Some(features);
        self
    }
}

/// Check the client's protocol window against [`PROTOCOL_VERSION`].
pub fn negotiate(min_protocol: u32, max_protocol: u32) -> Result<u32, WireError> {
    if min_protocol <= PROTOCOL_VERSION && PROTOCOL_VERSION <= max_protocol {
        Ok(PROTOCOL_VERSION)
    } else {
        Err(WireError::new(
            ErrorCode::VersionMismatch,
            format!(
                "server speaks protocol {PROTOCOL_VERSION}, client window is [{min_protocol}, {max_protocol}]"
            ),
        ))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_accepts_window_containing_version() {
        assert_eq!(negotiate(1, 5).unwrap(), PROTOCOL_VERSION);
        assert_eq!(negotiate(3, 3).unwrap(), PROTOCOL_VERSION);
    }

    #[test]
    fn negotiate_rejects_window_below() {
        let err = negotiate(1, 2).unwrap_err();
        assert_eq!(err.code, ErrorCode::VersionMismatch);
    }

    #[test]
    fn negotiate_rejects_window_above() {
        assert!(negotiate(4, 9).is_err());
    }

    #[test]
    fn role_serializes_kebab_case() {
        let s = serde_json::to_string(&Role::ChannelPlugin).unwrap();
        assert_eq!(s, "\"channel-plugin\"");
    }

    #[test]
    fn operator_defaults_to_read_scope() {
        assert_eq!(default_scopes(Role::Operator), vec![Scope::Read]);
    }

    #[test]
    fn node_defaults_to_no_scopes() {
        assert!(default_scopes(Role::Node).is_empty());
    }

    #[test]
    fn connect_params_round_trip() {
        let json = r#"{
            "client": {"id": "cli-1", "displayName": "porter cli", "version": "1.0"},
            "minProtocol": 1,
            "maxProtocol": 3,
            "auth": {"token": "t"},
            "role": "operator",
            "deviceId": "dev-7"
        }"#;
        let p: ConnectParams = serde_json::from_str(json).unwrap();
        assert_eq!(p.client.id, "cli-1");
        assert_eq!(p.role, Some(Role::Operator));
        assert_eq!(p.device_id.as_deref(), Some("dev-7"));
        assert_eq!(p.auth.unwrap().token.as_deref(), Some("t"));
    }

    #[test]
    fn hello_ok_has_literal_type_tag() {
        let hello = HelloOk::new("1.0.0", Some("gw-host".into()));
        let v = serde_json::to_value(&hello).unwrap();
        assert_eq!(v["type"], "hello-ok");
        assert_eq!(v["protocol"], PROTOCOL_VERSION);
        assert_eq!(v["server"]["host"], "gw-host");
    }
}
