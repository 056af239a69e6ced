// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway-local command runner.
//!
//! Runs `bash -c <command>` detached from any terminal, captures combined
//! stdout/stderr, and enforces the hard output cap: on overflow only the
//! trailing window is kept, with an explicit truncation marker prepended
//! for the transcript. The full output may be persisted out-of-band by the
//! caller before capping.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Marker prepended when output exceeded the cap.
pub const TRUNCATION_MARKER: &str = "…(truncated)…";

/// Result of one command run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Combined stdout + stderr, already capped.
    pub output: String,
    /// Whether the cap fired.
    pub truncated: bool,
}

/// Cap `output` to `cap` bytes by keeping the trailing `tail` bytes behind
/// a truncation marker. Cuts land on char boundaries.
pub fn cap_output(output: &str, cap: usize, tail: usize) -> (String, bool) {
    if output.len() <= cap {
        return (output.to_string(), false);
    }
    let tail = tail.min(cap).max(1);
    let mut start = output.len() - tail;
    while start < output.len() && !output.is_char_boundary(start) {
        start += 1;
    }
    (format!("{TRUNCATION_MARKER}\n{}", &output[start..]), true)
}

/// Runs commands in the gateway process's own host.
pub struct GatewayRunner {
    pub timeout: Duration,
    pub output_cap: usize,
    pub output_tail: usize,
}

impl Default for GatewayRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            output_cap: 200 * 1024,
            output_tail: 20 * 1024,
        }
    }
}

impl GatewayRunner {
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> RunOutcome {
        debug!(cmd = %command, "running gateway-local command");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        // Detach from the gateway's stdio so a child can never read our
        // stdin or scribble on the operator terminal.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }

        let result = tokio::time::timeout(self.timeout, cmd.output()).await;
        match result {
            Ok(Ok(output)) => {
                let mut combined = String::new();
                combined.push_str(&String::from_utf8_lossy(&output.stdout));
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str("[stderr]\n");
                    combined.push_str(&stderr);
                }
                let (capped, truncated) = cap_output(&combined, self.output_cap, self.output_tail);
                RunOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    output: capped,
                    truncated,
                }
            }
            Ok(Err(e)) => RunOutcome {
                exit_code: -1,
                output: format!("spawn error: {e}"),
                truncated: false,
            },
            Err(_) => RunOutcome {
                exit_code: -1,
                output: format!("timeout after {:?}", self.timeout),
                truncated: false,
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── cap_output ────────────────────────────────────────────────────────────

    #[test]
    fn small_output_is_untouched() {
        let (out, truncated) = cap_output("hello", 100, 10);
        assert_eq!(out, "hello");
        assert!(!truncated);
    }

    #[test]
    fn overflow_keeps_trailing_window_with_marker() {
        let text = format!("{}{}", "a".repeat(1000), "THE END");
        let (out, truncated) = cap_output(&text, 100, 50);
        assert!(truncated);
        assert!(out.starts_with(TRUNCATION_MARKER));
        assert!(out.ends_with("THE END"), "tail must be preserved: {out}");
        assert!(out.len() < text.len());
    }

    #[test]
    fn cap_respects_char_boundaries() {
        let text = "ö".repeat(200);
        let (out, truncated) = cap_output(&text, 100, 33);
        assert!(truncated);
        // Must not panic and must be valid UTF-8 by construction.
        assert!(out.contains('ö'));
    }

    // ── GatewayRunner ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_captures_stdout_and_exit_zero() {
        let r = GatewayRunner::default();
        let out = r.run("echo hello", None, &[]).await;
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn stderr_is_captured_and_labelled() {
        let r = GatewayRunner::default();
        let out = r.run("echo oops >&2", None, &[]).await;
        assert!(out.output.contains("[stderr]"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let r = GatewayRunner::default();
        let out = r.run("exit 3", None, &[]).await;
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let r = GatewayRunner::default();
        let out = r.run("pwd", Some("/tmp"), &[]).await;
        assert!(out.output.contains("/tmp"));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let r = GatewayRunner::default();
        let out = r
            .run(
                "echo $PORTER_TEST_VAR",
                None,
                &[("PORTER_TEST_VAR".into(), "xyzzy".into())],
            )
            .await;
        assert!(out.output.contains("xyzzy"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let r = GatewayRunner {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let out = r.run("sleep 30", None, &[]).await;
        assert_eq!(out.exit_code, -1);
        assert!(out.output.contains("timeout"));
    }

    #[tokio::test]
    async fn oversized_output_is_capped() {
        let r = GatewayRunner {
            output_cap: 1024,
            output_tail: 256,
            ..Default::default()
        };
        let out = r.run("yes x | head -c 10000", None, &[]).await;
        assert!(out.truncated);
        assert!(out.output.starts_with(TRUNCATION_MARKER));
        assert!(out.output.len() < 10_000);
    }
}
