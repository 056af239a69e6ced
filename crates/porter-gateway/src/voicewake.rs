// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Voice wake-trigger store — `voicewake.json`.
//!
//! The gateway only stores the trigger phrases and broadcasts
//! `voicewake.changed` when they mutate; actual wake-word detection lives
//! in the voice transport, which reads this store over the control plane.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicewakeFile {
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: i64,
}

pub struct VoicewakeStore {
    path: PathBuf,
    file: Mutex<VoicewakeFile>,
}

impl VoicewakeStore {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let file = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            VoicewakeFile::default()
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn get(&self) -> VoicewakeFile {
        self.file.lock().unwrap().clone()
    }

    /// Replace the trigger list and persist. Returns the new state for the
    /// `voicewake.changed` broadcast.
    pub fn set(&self, triggers: Vec<String>) -> anyhow::Result<VoicewakeFile> {
        let mut file = self.file.lock().unwrap();
        file.triggers = triggers;
        file.updated_at_ms = Utc::now().timestamp_millis();
        let text = serde_json::to_string_pretty(&*file).context("serializing voicewake")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(file.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
