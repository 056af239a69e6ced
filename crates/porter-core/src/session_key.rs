// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session key resolution — the deterministic mapping from an inbound
//! `(channel, account, peer, thread)` tuple to the canonical session key.
//!
//! ```text
//! sessionKey = lower(channel : accountId : peerKindTag : canonicalPeerId
//!                    [ : thread : topicId ])
//! ```
//!
//! The resolver is a pure function of its inputs and the configuration
//! snapshot it was built from. Two processes with identical config must
//! derive identical keys — routing has to survive restarts. Nothing in
//! here performs I/O or touches shared state.
//!
//! Two configuration inputs alter keying:
//!
//! - `dmScope`: `shared` folds every DM on an account to one key
//!   (`channel:account:dm:_`); `peer` (default) keys per peer.
//! - `identityLinks`: explicitly linked peer groups. A peer that is a
//!   member of a group resolves to the key of the group's first member.
//!   Peers outside an explicit group are never folded.

use std::collections::HashMap;

use porter_config::{Config, DmScope};
use porter_proto::{PeerKind, PeerRef, Target};
use serde::{Deserialize, Serialize};

/// Canonical lowercase session key. Immutable once minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an already-canonical key (e.g. one read back from disk or a
    /// `chat.send` that addresses a session directly). Lowercased on entry
    /// so lookups never miss on case.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound addressing tuple, pre-canonicalization.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    pub channel: String,
    pub account: String,
    pub peer: PeerRef,
    pub thread: Option<String>,
}

impl From<Target> for PeerAddress {
    fn from(t: Target) -> Self {
        Self {
            channel: t.channel,
            account: t.account,
            peer: t.peer,
            thread: t.thread,
        }
    }
}

/// Immutable resolver snapshot. Built once from a `Config`; sessions minted
/// under one snapshot keep their keys even after a reload (new sessions are
/// resolved against the new snapshot).
#[derive(Debug, Clone)]
pub struct KeyResolver {
    /// channel → effective DM scope.
    dm_scopes: HashMap<String, DmScope>,
    global_dm_scope: DmScope,
    /// `channel:account:canonicalPeerId` → canonical member of its group.
    links: HashMap<String, LinkTarget>,
}

#[derive(Debug, Clone)]
struct LinkTarget {
    channel: String,
    account: String,
    peer_id: String,
}

impl KeyResolver {
    pub fn from_config(config: &Config) -> Self {
        let dm_scopes = config
            .channels
            .iter()
            .filter_map(|(name, c)| c.dm_scope.map(|s| (name.to_lowercase(), s)))
            .collect();

        let mut links = HashMap::new();
        for group in &config.identity_links {
            // The first member is the group's canonical identity. Malformed
            // members (not channel:account:peer) are ignored rather than
            // poisoning the whole group.
            let Some(canon) = group.members.first().and_then(|m| parse_member(m)) else {
                continue;
            };
            for member in &group.members {
                let Some(parsed) = parse_member(member) else {
                    continue;
                };
                let key = format!(
                    "{}:{}:{}",
                    parsed.channel,
                    parsed.account,
                    canonical_peer_id(&parsed.channel, PeerKind::Dm, &parsed.peer_id)
                );
                links.insert(key, canon.clone());
            }
        }

        Self {
            dm_scopes,
            global_dm_scope: config.dm_scope,
            links,
        }
    }

    fn dm_scope_for(&self, channel: &str) -> DmScope {
        self.dm_scopes
            .get(channel)
            .copied()
            .unwrap_or(self.global_dm_scope)
    }

    /// Resolve an address to its canonical session key.
    pub fn resolve(&self, addr: &PeerAddress) -> SessionKey {
        let channel = addr.channel.trim().to_lowercase();
        let account = addr.account.trim().to_lowercase();
        let peer_id = canonical_peer_id(&channel, addr.peer.kind, &addr.peer.id);

        // Identity links fold explicitly linked DM peers onto the group's
        // canonical member. Group/channel peers are never folded.
        if addr.peer.kind == PeerKind::Dm {
            let lookup = format!("{channel}:{account}:{peer_id}");
            if let Some(canon) = self.links.get(&lookup) {
                let canon_peer = canonical_peer_id(&canon.channel, PeerKind::Dm, &canon.peer_id);
                return SessionKey::from_raw(format!(
                    "{}:{}:dm:{}",
                    canon.channel, canon.account, canon_peer
                ));
            }

            if self.dm_scope_for(&channel) == DmScope::Shared {
                return SessionKey::from_raw(format!("{channel}:{account}:dm:_"));
            }
        }

        let mut key = format!("{channel}:{account}:{}:{peer_id}", addr.peer.kind.tag());
        if let Some(topic) = &addr.thread {
            let topic = topic.trim().to_lowercase();
            if !topic.is_empty() {
                key.push_str(":thread:");
                key.push_str(&topic);
            }
        }
        SessionKey::from_raw(key)
    }
}

/// Channel-specific peer id canonicalization.
///
/// The raw transport id is surfaced only in audit logs; everything else in
/// the gateway sees the canonical form produced here.
pub fn canonical_peer_id(channel: &str, kind: PeerKind, raw: &str) -> String {
    let id = raw.trim().to_lowercase();
    match (channel, kind) {
        // Mattermost DM usernames arrive with a leading '@'.
        ("mattermost", PeerKind::Dm) => id.strip_prefix('@').unwrap_or(&id).to_string(),
        // BlueBubbles group ids carry a redundant `chat_` prefix.
        ("bluebubbles", PeerKind::Group) => id.strip_prefix("chat_").unwrap_or(&id).to_string(),
        _ => id,
    }
}

fn parse_member(member: &str) -> Option<LinkTarget> {
    let mut parts = member.splitn(3, ':');
    let channel = parts.next()?.trim().to_lowercase();
    let account = parts.next()?.trim().to_lowercase();
    let peer_id = parts.next()?.trim().to_lowercase();
    if channel.is_empty() || account.is_empty() || peer_id.is_empty() {
        return None;
    }
    Some(LinkTarget {
        channel,
        account,
        peer_id,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
