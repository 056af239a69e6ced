// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use porter_proto::Target;

use crate::adapter::{ChannelAdapter, DeliveryError, DeliveryReceipt, OutboundPayload};

/// One recorded delivery.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub target: Target,
    pub frames: Vec<String>,
}

/// Test adapter that records every delivery and can be told to fail.
pub struct RecordingAdapter {
    name: String,
    pub sends: Mutex<Vec<RecordedSend>>,
    fail: AtomicBool,
}

impl RecordingAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            sends: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent sends fail with a transport rejection.
    pub fn fail_next_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .flat_map(|s| s.frames.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        target: &Target,
        frames: &[String],
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("simulated transport failure".into()));
        }
        self.sends.lock().unwrap().push(RecordedSend {
            target: target.clone(),
            frames: frames.to_vec(),
        });
        let message_ids = (0..frames.len()).map(|i| format!("m{i}")).collect();
        Ok(DeliveryReceipt { message_ids })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChannelLimits, OutboundPayload};
    use porter_proto::{PeerKind, PeerRef};

    fn target() -> Target {
        Target {
            channel: "rec".into(),
            account: "a".into(),
            peer: PeerRef {
                kind: PeerKind::Dm,
                id: "u1".into(),
            },
            thread: None,
        }
    }

    #[tokio::test]
    async fn records_frames_in_order() {
        let a = RecordingAdapter::new("rec");
        let frames = vec!["one".to_string(), "two".to_string()];
        let receipt = a.send(&target(), &frames).await.unwrap();
        assert_eq!(receipt.message_ids.len(), 2);
        assert_eq!(a.sent_frames(), frames);
    }

    #[tokio::test]
    async fn simulated_failure_rejects() {
        let a = RecordingAdapter::new("rec");
        a.fail_next_sends(true);
        let err = a.send(&target(), &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
        assert!(a.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn default_format_flattens_and_chunks() {
        let a = RecordingAdapter::new("rec");
        let limits = ChannelLimits {
            text_limit: 20,
            markdown: false,
        };
        let frames = a.format(&OutboundPayload::text("# Big\n\nhello **world**"), &limits);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| !f.contains('#') && !f.contains("**")));
    }
}
