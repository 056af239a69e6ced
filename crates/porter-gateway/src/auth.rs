// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Handshake authentication and identity binding.
//!
//! Three ways into the gateway, by bind mode:
//!
//! - **loopback** — a local process already has local access; no shared
//!   secret required.
//! - **lan** — the `connect` frame must present the control-plane secret
//!   (as `auth.token`) or the configured password. Neither →
//!   `UNAUTHORIZED`.
//! - **tunnel** — a fronting identity proxy injects a trusted header; when
//!   `trustTunnelIdentity` is enabled that header stands in for a token.
//!
//! Failed attempts are rate limited per source IP with the `governor`
//! GCRA limiter. Successful auth consumes no quota, and loopback is
//! exempt — a local process that can reach the socket already has the
//! machine.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use porter_config::{BindMode, GatewayConfig};
use porter_proto::{default_scopes, ConnectParams, ErrorCode, Role, Scope, WireError};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::secret::SecretRecord;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// How a connection proved itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVia {
    Loopback,
    Token,
    Password,
    TunnelIdentity,
}

/// The bound identity of an authenticated connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub role: Role,
    pub scopes: Vec<Scope>,
    pub device_id: String,
    pub via: AuthVia,
    /// Identity asserted by the tunnel header, when present.
    pub identity: Option<String>,
}

/// Shared auth state for the accept path.
pub struct AuthState {
    mode: BindMode,
    secret: Option<SecretRecord>,
    password: Option<String>,
    trust_tunnel_identity: bool,
    limiter: Arc<IpLimiter>,
}

impl AuthState {
    /// A secret is required for non-loopback modes unless a password or
    /// tunnel identity is configured; that check happens at boot, not
    /// here.
    pub fn new(config: &GatewayConfig, secret: Option<SecretRecord>) -> Self {
        // 5 failed attempts per minute, burst of 2 — then lockout.
        let quota = Quota::per_minute(NonZeroU32::new(5).expect("quota > 0"))
            .allow_burst(NonZeroU32::new(2).expect("burst > 0"));
        Self {
            mode: config.mode,
            secret,
            password: config.password.clone(),
            trust_tunnel_identity: config.trust_tunnel_identity,
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Validate a `connect` request and bind the connection's identity.
    ///
    /// `tunnel_identity` is the value of the configured tunnel header on
    /// the upgrade request, when one was present.
    pub fn authenticate(
        &self,
        params: &ConnectParams,
        ip: IpAddr,
        tunnel_identity: Option<&str>,
    ) -> Result<Principal, WireError> {
        let via = self.check_credentials(params, ip, tunnel_identity)?;

        let role = params.role.unwrap_or(Role::Operator);
        // Requested scopes are honored for authenticated connections;
        // absent a request, scopes default by role.
        let scopes = match &params.scope {
            Some(requested) if !requested.is_empty() => requested.clone(),
            _ => default_scopes(role),
        };
        let device_id = params
            .device_id
            .clone()
            .unwrap_or_else(|| params.client.id.clone());

        Ok(Principal {
            role,
            scopes,
            device_id,
            via,
            identity: tunnel_identity.map(String::from),
        })
    }

    fn check_credentials(
        &self,
        params: &ConnectParams,
        ip: IpAddr,
        tunnel_identity: Option<&str>,
    ) -> Result<AuthVia, WireError> {
        if is_loopback(ip) && self.mode == BindMode::Loopback {
            return Ok(AuthVia::Loopback);
        }

        if self.mode == BindMode::Tunnel && self.trust_tunnel_identity {
            if let Some(id) = tunnel_identity {
                if !id.is_empty() {
                    return Ok(AuthVia::TunnelIdentity);
                }
            }
        }

        let auth = params.auth.clone().unwrap_or_default();
        if let (Some(presented), Some(record)) = (auth.token.as_deref(), self.secret.as_ref()) {
            if record.matches(presented) {
                return Ok(AuthVia::Token);
            }
        }
        if let (Some(presented), Some(configured)) =
            (auth.password.as_deref(), self.password.as_deref())
        {
            if passwords_match(presented, configured) {
                return Ok(AuthVia::Password);
            }
        }

        // Failed auth consumes rate-limit quota; loopback is exempt so
        // local tooling can never lock itself out.
        if !is_loopback(ip) && self.limiter.check_key(&ip).is_err() {
            warn!(%ip, "rate limit exceeded after repeated auth failures");
            return Err(WireError::new(
                ErrorCode::Unauthorized,
                "too many failed attempts, retry later",
            ));
        }
        warn!(%ip, client = %params.client.id, "authentication failed");
        Err(WireError::new(
            ErrorCode::Unauthorized,
            "token or password required",
        ))
    }
}

/// Compare the configured password against a presented one without
/// leaking length or shared-prefix timing: both sides are widened to a
/// fixed 32-byte digest first, then compared in constant time.
fn passwords_match(presented: &str, configured: &str) -> bool {
    let a: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    let b: [u8; 32] = Sha256::digest(configured.as_bytes()).into();
    a.ct_eq(&b).into()
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
