// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Outbound router — maps agent output back onto transports.
//!
//! The target argument is authoritative: the router derives the session
//! key from the *target* peer (post-canonicalization), never from the
//! session the agent happens to be running in, and it never picks a
//! channel itself. That is the property that keeps a model from
//! exfiltrating a conversation across channels: the only channel it can
//! reach is the one its caller explicitly named.
//!
//! Sends to a peer with no session mint one, with a session-context note,
//! so future inbound from that peer attaches to the same key.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use porter_channels::{
    ChannelAdapter, ChannelLimits, ChannelRegistry, DeliveryError, DeliveryReceipt,
    OutboundPayload,
};
use porter_config::Config;
use porter_core::{KeyResolver, PeerAddress, SessionKey, SessionStore};
use porter_proto::Target;
use serde_json::json;
use tracing::{debug, info};

use crate::registry::{ConnId, ConnectionRegistry};

pub struct OutboundRouter {
    config: RwLock<Arc<Config>>,
    resolver: RwLock<Arc<KeyResolver>>,
    channels: ChannelRegistry,
    store: Arc<SessionStore>,
    default_agent: String,
}

impl OutboundRouter {
    pub fn new(
        config: Arc<Config>,
        channels: ChannelRegistry,
        store: Arc<SessionStore>,
    ) -> Self {
        let resolver = Arc::new(KeyResolver::from_config(&config));
        Self {
            config: RwLock::new(config),
            resolver: RwLock::new(resolver),
            channels,
            store,
            default_agent: "default".into(),
        }
    }

    pub fn update_config(&self, config: Arc<Config>) {
        *self.resolver.write().unwrap() = Arc::new(KeyResolver::from_config(&config));
        *self.config.write().unwrap() = config;
    }

    /// The session key outbound to `target` lands on.
    pub fn target_key(&self, target: &Target) -> SessionKey {
        let resolver = self.resolver.read().unwrap().clone();
        resolver.resolve(&PeerAddress::from(target.clone()))
    }

    /// Deliver a payload to `target`, minting the target session if it
    /// does not exist. Returns the target session key alongside the
    /// receipt so callers can surface failures on both sessions.
    pub async fn deliver(
        &self,
        target: &Target,
        payload: OutboundPayload,
        source: Option<&SessionKey>,
    ) -> (SessionKey, Result<DeliveryReceipt, DeliveryError>) {
        let key = self.target_key(target);

        let origin = match source {
            Some(src) if *src != key => format!("created by outbound send from {src}"),
            _ => "created by outbound send".to_string(),
        };
        let (_, created) = self
            .store
            .ensure_with_origin(&key, &self.default_agent, origin)
            .await;
        if created {
            info!(%key, "target session minted by outbound send");
        }

        let adapter = match self.channels.get(&target.channel) {
            Some(a) => a,
            None => {
                return (key, Err(DeliveryError::NoAdapter(target.channel.clone())));
            }
        };

        let config = self.config.read().unwrap().clone();
        let limits = ChannelLimits::from(&config.channel(&target.channel));
        let frames = adapter.format(&payload, &limits);
        if frames.is_empty() {
            debug!(%key, "nothing to deliver after formatting");
            return (
                key,
                Ok(DeliveryReceipt {
                    message_ids: Vec::new(),
                }),
            );
        }
        // Audit sees the raw transport id; routing used the canonical key.
        debug!(channel = %target.channel, raw_peer = %target.peer.id, %key, frames = frames.len(), "delivering");
        let result = adapter.send(target, &frames).await;
        (key, result)
    }
}

// ── Plugin-backed adapter ─────────────────────────────────────────────────────

/// Adapter for channels served by an external plugin process connected
/// with role `channel-plugin`. Delivery is a `channel.send` request over
/// that connection; the plugin answers with the transport message id.
pub struct PluginChannelAdapter {
    channel: String,
    registry: Arc<ConnectionRegistry>,
}

impl PluginChannelAdapter {
    pub fn new(channel: impl Into<String>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            channel: channel.into().to_lowercase(),
            registry,
        }
    }

    async fn plugin_conn(&self) -> Result<ConnId, DeliveryError> {
        self.registry
            .channel_plugin(&self.channel)
            .await
            .ok_or_else(|| DeliveryError::NotConnected(self.channel.clone()))
    }
}

#[async_trait]
impl ChannelAdapter for PluginChannelAdapter {
    fn name(&self) -> &str {
        &self.channel
    }

    async fn send(
        &self,
        target: &Target,
        frames: &[String],
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let conn = self.plugin_conn().await?;
        let mut message_ids = Vec::with_capacity(frames.len());
        for frame in frames {
            let result = self
                .registry
                .request(conn, "channel.send", json!({"target": target, "text": frame}))
                .await
                .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
            message_ids.push(
                result
                    .get("messageId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            );
        }
        Ok(DeliveryReceipt { message_ids })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use porter_channels::RecordingAdapter;
    use porter_proto::{PeerKind, PeerRef};

    fn target(channel: &str, peer: &str) -> Target {
        Target {
            channel: channel.into(),
            account: "a".into(),
            peer: PeerRef {
                kind: PeerKind::Dm,
                id: peer.into(),
            },
            thread: None,
        }
    }

    fn router_with(config_json: &str) -> (Arc<OutboundRouter>, Arc<RecordingAdapter>) {
        let config: Arc<Config> = Arc::new(serde_json::from_str(config_json).unwrap());
        let channels = ChannelRegistry::new();
        let adapter = Arc::new(RecordingAdapter::new("slack"));
        channels.register(adapter.clone());
        let store = Arc::new(SessionStore::new());
        (
            Arc::new(OutboundRouter::new(config, channels, store)),
            adapter,
        )
    }

    #[tokio::test]
    async fn delivers_to_target_derived_session() {
        let (router, adapter) = router_with("{}");
        let src = SessionKey::from_raw("web:default:dm:u1");
        let (key, result) = router
            .deliver(&target("slack", "u2"), OutboundPayload::text("hi"), Some(&src))
            .await;
        assert_eq!(key.as_str(), "slack:a:dm:u2", "key derives from the target");
        result.unwrap();
        assert_eq!(adapter.sent_frames(), vec!["hi"]);

        // The target session exists with a context note; the source is untouched.
        let meta = router.store.get(&key).await.unwrap();
        assert!(meta.origin_note.unwrap().contains("web:default:dm:u1"));
        assert!(router.store.get(&src).await.is_none());
    }

    #[tokio::test]
    async fn second_send_does_not_remint_session() {
        let (router, _adapter) = router_with("{}");
        let t = target("slack", "u2");
        let (key, _) = router.deliver(&t, OutboundPayload::text("one"), None).await;
        let before = router.store.get(&key).await.unwrap().created_at_ms;
        let (_, _) = router.deliver(&t, OutboundPayload::text("two"), None).await;
        assert_eq!(router.store.get(&key).await.unwrap().created_at_ms, before);
    }

    #[tokio::test]
    async fn unknown_channel_is_no_adapter() {
        let (router, _adapter) = router_with("{}");
        let (_, result) = router
            .deliver(&target("discord", "u9"), OutboundPayload::text("x"), None)
            .await;
        assert!(matches!(result, Err(DeliveryError::NoAdapter(c)) if c == "discord"));
    }

    #[tokio::test]
    async fn chunking_respects_channel_limit() {
        let (router, adapter) = router_with(
            r#"{"channels": {"slack": {"textLimit": 10, "markdown": true}}}"#,
        );
        let (_, result) = router
            .deliver(
                &target("slack", "u2"),
                OutboundPayload::text("aaaaaaaaaa bbbbbbbbbb cccccccccc"),
                None,
            )
            .await;
        result.unwrap();
        let frames = adapter.sent_frames();
        assert!(frames.len() >= 3);
        assert!(frames.iter().all(|f| f.chars().count() <= 10));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_with_target_key() {
        let (router, adapter) = router_with("{}");
        adapter.fail_next_sends(true);
        let (key, result) = router
            .deliver(&target("slack", "u2"), OutboundPayload::text("x"), None)
            .await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
        // Session was still minted — future inbound attaches.
        assert!(router.store.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn target_key_uses_post_canonicalization_id() {
        let (router, _adapter) = router_with("{}");
        let mut t = target("mattermost", "@Alice");
        t.channel = "mattermost".into();
        assert_eq!(router.target_key(&t).as_str(), "mattermost:a:dm:alice");
    }

    #[tokio::test]
    async fn empty_payload_delivers_nothing() {
        let (router, adapter) = router_with("{}");
        let (_, result) = router
            .deliver(&target("slack", "u2"), OutboundPayload::text("   "), None)
            .await;
        assert!(result.unwrap().message_ids.is_empty());
        assert!(adapter.sent_frames().is_empty());
    }
}
