// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Built-in web-chat channel.
//!
//! The web chat has no external transport: deliveries are published on a
//! broadcast stream that the gateway bridges to connected control-plane
//! clients (the dashboard renders them). That makes `web` a zero-setup
//! channel that always exists, which is also what the test suite drives
//! end-to-end scenarios through.

use async_trait::async_trait;
use porter_proto::Target;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::adapter::{ChannelAdapter, DeliveryError, DeliveryReceipt, OutboundPayload};

/// One delivery on the web-chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebChatDelivery {
    pub target: Target,
    pub frames: Vec<String>,
}

pub struct WebChatAdapter {
    deliveries: broadcast::Sender<WebChatDelivery>,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        let (deliveries, _) = broadcast::channel(256);
        Self { deliveries }
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to deliveries (the gateway's ws bridge and tests).
    pub fn subscribe(&self) -> broadcast::Receiver<WebChatDelivery> {
        self.deliveries.subscribe()
    }
}

#[async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn name(&self) -> &str {
        "web"
    }

    async fn send(
        &self,
        target: &Target,
        frames: &[String],
    ) -> Result<DeliveryReceipt, DeliveryError> {
        // No subscribers is fine: the dashboard may not be open. The
        // transcript already holds the message; the stream is live view.
        let _ = self.deliveries.send(WebChatDelivery {
            target: target.clone(),
            frames: frames.to_vec(),
        });
        let message_ids = (0..frames.len()).map(|i| format!("web-{i}")).collect();
        Ok(DeliveryReceipt { message_ids })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use porter_proto::{PeerKind, PeerRef};

    fn target() -> Target {
        Target {
            channel: "web".into(),
            account: "default".into(),
            peer: PeerRef {
                kind: PeerKind::Dm,
                id: "u1".into(),
            },
            thread: None,
        }
    }

    #[tokio::test]
    async fn delivery_reaches_subscribers() {
        let a = WebChatAdapter::new();
        let mut rx = a.subscribe();
        a.send(&target(), &["hello".to_string()]).await.unwrap();
        let d = rx.recv().await.unwrap();
        assert_eq!(d.frames, vec!["hello"]);
        assert_eq!(d.target.peer.id, "u1");
    }

    #[tokio::test]
    async fn send_without_subscribers_is_ok() {
        let a = WebChatAdapter::new();
        let receipt = a.send(&target(), &["hi".to_string()]).await.unwrap();
        assert_eq!(receipt.message_ids.len(), 1);
    }
}
