// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Control-plane shared secret — minting, storage, verification.
//!
//! Porter's auth is bind-mode driven (see `auth.rs`): loopback clients
//! need no secret at all, LAN clients present this secret or the
//! configured password in their `connect` frame, and tunnel mode may
//! substitute the proxy's identity header. This module owns the secret
//! itself: where it comes from, how it is stored, how a presented value
//! is checked.
//!
//! The raw secret exists in exactly two places — the operator's hands and
//! the `connect` frame. What lands in `secret.json` is a per-secret salt
//! plus the salted SHA-256 digest, so a leaked state directory gives an
//! attacker neither the secret nor a precomputed-table shortcut.
//! Rotation mints a fresh salt and secret together; the previous secret
//! stops verifying the moment the new record hits disk.

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Random bytes behind a minted secret.
const SECRET_BYTES: usize = 24;
/// Salt length for the stored digest.
const SALT_BYTES: usize = 16;
/// On-disk format version; bumped if the digest scheme ever changes.
const RECORD_VERSION: u32 = 1;

/// A freshly minted secret, alive only long enough to be shown once.
///
/// There is no other way at the raw value: [`SecretRecord`] keeps only
/// the salted digest, and `Debug` prints a placeholder so the secret
/// cannot leak through logs or panic messages.
#[must_use = "show this secret to the operator; it cannot be recovered later"]
pub struct IssuedSecret(String);

impl IssuedSecret {
    /// The raw secret, for the one-time display and the dashboard URL.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for IssuedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IssuedSecret(…)")
    }
}

/// The persisted form of the secret: salt and salted digest, never the
/// secret itself.
#[derive(Clone)]
pub struct SecretRecord {
    salt: Vec<u8>,
    digest: [u8; 32],
    created_at_ms: i64,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

/// JSON shape of `secret.json`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretFile {
    version: u32,
    salt: String,
    digest: String,
    created_at_ms: i64,
}

impl SecretRecord {
    /// Mint a new secret together with the record that verifies it.
    pub fn issue() -> (IssuedSecret, SecretRecord) {
        let mut raw = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut raw);
        let secret = format!("prt-{}", base64_url(&raw));

        let mut salt = vec![0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let digest = salted_digest(&salt, secret.as_bytes());

        (
            IssuedSecret(secret),
            SecretRecord {
                salt,
                digest,
                created_at_ms: chrono::Utc::now().timestamp_millis(),
            },
        )
    }

    /// Constant-time check of a secret presented in a `connect` frame.
    pub fn matches(&self, presented: &str) -> bool {
        let candidate = salted_digest(&self.salt, presented.as_bytes());
        candidate.ct_eq(&self.digest).into()
    }

    /// When this secret was minted, for status display.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// Load the record; `None` when no secret has been minted yet.
    ///
    /// A present-but-unreadable file is an error, not `None` — silently
    /// treating a corrupt record as "no secret" would let a LAN gateway
    /// boot without the credential its operator believes is in force.
    pub fn load(path: &Path) -> anyhow::Result<Option<SecretRecord>> {
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: SecretFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if file.version != RECORD_VERSION {
            bail!(
                "{}: unsupported secret record version {}",
                path.display(),
                file.version
            );
        }
        let salt = hex::decode(&file.salt)
            .with_context(|| format!("{}: salt is not hex", path.display()))?;
        let digest: [u8; 32] = hex::decode(&file.digest)
            .with_context(|| format!("{}: digest is not hex", path.display()))?
            .try_into()
            .map_err(|_| anyhow!("{}: digest must be 32 bytes", path.display()))?;
        Ok(Some(SecretRecord {
            salt,
            digest,
            created_at_ms: file.created_at_ms,
        }))
    }

    /// Persist the record, readable by the owner only.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = SecretFile {
            version: RECORD_VERSION,
            salt: hex::encode(&self.salt),
            digest: hex::encode(self.digest),
            created_at_ms: self.created_at_ms,
        };
        let json = serde_json::to_string_pretty(&file).context("serializing secret record")?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        write_owner_only(path, json.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Mint and persist in one step, handing back the raw secret for its one
/// display. Used by first boot, `regenerate-token`, and `dashboard`.
pub fn rotate(path: &Path) -> anyhow::Result<(IssuedSecret, SecretRecord)> {
    let (issued, record) = SecretRecord::issue();
    record.save(path)?;
    Ok((issued, record))
}

fn salted_digest(salt: &[u8], secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Write with mode 0o600 on Unix so only the gateway's user can read the
/// salt+digest pair.
fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write as _;
        use std::os::unix::fs::OpenOptionsExt as _;
        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true).mode(0o600);
        options.open(path)?.write_all(bytes)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, bytes)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_secret_is_prefixed_and_unique() {
        let (a, _) = SecretRecord::issue();
        let (b, _) = SecretRecord::issue();
        assert!(a.expose().starts_with("prt-"));
        assert!(a.expose().len() > SECRET_BYTES, "encodes 24 random bytes");
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn record_matches_only_its_own_secret() {
        let (issued, record) = SecretRecord::issue();
        assert!(record.matches(issued.expose()));
        assert!(!record.matches("prt-somebody-elses-guess"));
        assert!(!record.matches(""));
    }

    #[test]
    fn salting_makes_equal_secrets_store_differently() {
        // Two records derived from the same raw value must not share a
        // digest; otherwise the store would be rainbow-table friendly.
        let (issued, first) = SecretRecord::issue();
        let mut salt = vec![0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let second = SecretRecord {
            digest: salted_digest(&salt, issued.expose().as_bytes()),
            salt,
            created_at_ms: 0,
        };
        assert!(second.matches(issued.expose()));
        assert_ne!(first.digest, second.digest);
    }

    #[test]
    fn load_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = SecretRecord::load(&dir.path().join("secret.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn save_then_load_still_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let (issued, record) = SecretRecord::issue();
        record.save(&path).unwrap();

        let loaded = SecretRecord::load(&path).unwrap().expect("record present");
        assert!(loaded.matches(issued.expose()));
        assert_eq!(loaded.created_at_ms(), record.created_at_ms());
    }

    #[test]
    fn rotation_invalidates_the_previous_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let (old, _) = rotate(&path).unwrap();
        let (new, _) = rotate(&path).unwrap();

        let current = SecretRecord::load(&path).unwrap().unwrap();
        assert!(!current.matches(old.expose()), "old secret must stop working");
        assert!(current.matches(new.expose()));
    }

    #[test]
    fn corrupt_record_is_an_error_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        std::fs::write(&path, r#"{"version": 1, "salt": "zz", "digest": "zz", "createdAtMs": 0}"#)
            .unwrap();
        assert!(SecretRecord::load(&path).is_err());
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let (_, record) = SecretRecord::issue();
        record.save(&path).unwrap();
        let text = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"version\": 1", "\"version\": 9");
        std::fs::write(&path, text).unwrap();
        assert!(SecretRecord::load(&path).is_err());
    }

    #[test]
    fn debug_output_leaks_nothing() {
        let (issued, record) = SecretRecord::issue();
        assert!(!format!("{issued:?}").contains(issued.expose()));
        assert!(!format!("{record:?}").contains(&hex::encode(record.digest)));
    }
}
