// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use porter_config::ChannelConfig;
use porter_proto::Target;
use thiserror::Error;

use crate::format::{chunk_text, flatten_markdown};

/// One outbound message before formatting.
#[derive(Debug, Clone, Default)]
pub struct OutboundPayload {
    pub text: String,
    /// Media attachment references (URLs or file ids); adapters that cannot
    /// carry media append the references as text.
    pub media: Vec<String>,
    /// Transport message id this replies to, when threading is supported.
    pub reply_to: Option<String>,
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Per-channel formatting limits, derived from the channel config.
#[derive(Debug, Clone)]
pub struct ChannelLimits {
    /// Hard per-message character limit of the transport.
    pub text_limit: usize,
    /// Whether the transport renders markdown.
    pub markdown: bool,
}

impl From<&ChannelConfig> for ChannelLimits {
    fn from(c: &ChannelConfig) -> Self {
        Self {
            text_limit: c.text_limit,
            markdown: c.markdown,
        }
    }
}

/// Acknowledgement of a delivered payload.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Transport message ids, one per delivered frame.
    pub message_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("channel '{0}' has no registered adapter")]
    NoAdapter(String),

    #[error("no live plugin connection for channel '{0}'")]
    NotConnected(String),

    #[error("transport rejected the message: {0}")]
    Rejected(String),
}

/// Capability interface a transport implements.
///
/// `format` has a default implementation (markdown flattening + chunking)
/// that fits most text transports; adapters with native dialects override
/// it. `send` delivers pre-formatted frames in order.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name this adapter serves (lowercase, e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Split and convert an outbound payload into transport frames.
    fn format(&self, payload: &OutboundPayload, limits: &ChannelLimits) -> Vec<String> {
        let mut text = if limits.markdown {
            payload.text.clone()
        } else {
            flatten_markdown(&payload.text)
        };
        for media in &payload.media {
            text.push('\n');
            text.push_str(media);
        }
        chunk_text(&text, limits.text_limit)
    }

    /// Deliver frames to the target peer, in order.
    async fn send(
        &self,
        target: &Target,
        frames: &[String],
    ) -> Result<DeliveryReceipt, DeliveryError>;
}
