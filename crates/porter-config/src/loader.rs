// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Config loading and hot reload.
//!
//! `load` is fail-closed: a present-but-invalid `config.json` is an error
//! the caller must treat as fatal (exit code 2) *before* binding sockets.
//! A missing file yields defaults — a loopback gateway with no channels is
//! a valid first-boot state.
//!
//! `watch` installs a filesystem watcher on the config file and delivers a
//! freshly parsed `Config` on every clean change. Parse failures are logged
//! and skipped — a half-written file must never tear down a running
//! gateway. Reload is non-destructive by design: consumers swap the shared
//! `Arc<Config>` and only *new* sessions observe the change.

use std::path::Path;
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::schema::Config;
use crate::state_dir::StateDir;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Load `config.json` from the state directory.
///
/// Missing file → `Config::default()`. Invalid file → `ConfigError` which
/// the boot path maps to exit code 2.
pub fn load(state: &StateDir) -> Result<Config, ConfigError> {
    let path = state.config_file();
    load_path(&path)
}

fn load_path(path: &Path) -> Result<Config, ConfigError> {
    if !path.is_file() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config = serde_json::from_str(&text).map_err(|source| ConfigError::Invalid {
        path: path.display().to_string(),
        source,
    })?;
    Ok(config)
}

/// Watch the config file and publish each clean reload.
///
/// Returns a `watch::Receiver` holding the current config; the background
/// watcher task (and the `notify` watcher it owns) runs until the returned
/// receiver and all its clones are dropped.
pub fn watch(state: &StateDir, initial: Config) -> watch::Receiver<Arc<Config>> {
    let (tx, rx) = watch::channel(Arc::new(initial));
    let path = state.config_file();

    let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(ev) = res {
            let _ = fs_tx.send(ev);
        }
    });

    let mut watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            warn!("config watcher unavailable: {e}; hot reload disabled");
            return rx;
        }
    };
    // Watch the parent directory: editors replace files by rename, which a
    // file-level watch loses track of.
    let watch_root = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    if let Err(e) = watcher.watch(&watch_root, RecursiveMode::NonRecursive) {
        warn!("cannot watch {}: {e}; hot reload disabled", watch_root.display());
        return rx;
    }

    tokio::spawn(async move {
        // Keep the watcher alive inside the task.
        let _watcher = watcher;
        while let Some(ev) = fs_rx.recv().await {
            if !ev.paths.iter().any(|p| p.ends_with("config.json")) {
                continue;
            }
            match load_path(&path) {
                Ok(config) => {
                    info!("config reloaded");
                    if tx.send(Arc::new(config)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("config reload skipped: {e}"),
            }
        }
    });

    rx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
