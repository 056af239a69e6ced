// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Compile a pattern list, dropping patterns that fail to compile.
pub fn compile_globs(patterns: &[String]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
}

/// True when any compiled pattern matches `candidate` in full.
pub fn any_match(patterns: &[Regex], candidate: &str) -> bool {
    patterns.iter().any(|re| re.is_match(candidate))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_anything() {
        let re = glob_to_regex("*").unwrap();
        assert!(re.is_match(""));
        assert!(re.is_match("exec"));
    }

    #[test]
    fn prefix_glob_matches_suffix_only() {
        let re = glob_to_regex("read_*").unwrap();
        assert!(re.is_match("read_file"));
        assert!(!re.is_match("write_file"));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        let re = glob_to_regex("v?").unwrap();
        assert!(re.is_match("v1"));
        assert!(!re.is_match("v10"));
    }

    #[test]
    fn literal_dots_are_escaped() {
        let re = glob_to_regex("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("aXb"));
    }

    #[test]
    fn match_is_anchored_both_ends() {
        let re = glob_to_regex("exec").unwrap();
        assert!(!re.is_match("exec_extra"));
        assert!(!re.is_match("pre_exec"));
    }

    #[test]
    fn any_match_over_compiled_list() {
        let globs = compile_globs(&["read_*".to_string(), "send".to_string()]);
        assert!(any_match(&globs, "read_file"));
        assert!(any_match(&globs, "send"));
        assert!(!any_match(&globs, "exec"));
    }
}
