// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::adapter::ChannelAdapter;

/// Registry of channel adapters, keyed by lowercase channel name.
///
/// Adapters register at boot; lookups are read-mostly. A channel-plugin
/// connection may later re-register its channel (reconnect) — last one
/// wins, which is what a reconnecting plugin wants.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_lowercase();
        info!(channel = %name, "channel adapter registered");
        self.inner.write().unwrap().insert(name, adapter);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.inner
            .read()
            .unwrap()
            .get(&channel.to_lowercase())
            .cloned()
    }

    pub fn deregister(&self, channel: &str) -> bool {
        self.inner
            .write()
            .unwrap()
            .remove(&channel.to_lowercase())
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingAdapter;

    #[test]
    fn register_and_get_is_case_insensitive() {
        let reg = ChannelRegistry::new();
        reg.register(Arc::new(RecordingAdapter::new("Slack")));
        assert!(reg.get("slack").is_some());
        assert!(reg.get("SLACK").is_some());
        assert!(reg.get("telegram").is_none());
    }

    #[test]
    fn reregister_replaces_previous_adapter() {
        let reg = ChannelRegistry::new();
        reg.register(Arc::new(RecordingAdapter::new("web")));
        reg.register(Arc::new(RecordingAdapter::new("web")));
        assert_eq!(reg.names(), vec!["web"]);
    }

    #[test]
    fn deregister_removes() {
        let reg = ChannelRegistry::new();
        reg.register(Arc::new(RecordingAdapter::new("web")));
        assert!(reg.deregister("web"));
        assert!(!reg.deregister("web"));
        assert!(reg.get("web").is_none());
    }
}
