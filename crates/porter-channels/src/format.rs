// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Outbound text formatting: chunking to transport limits and markdown
//! flattening for transports that render plain text only.
//!
//! Chunking prefers paragraph breaks, then line breaks, then a hard cut at
//! a char boundary. A messenger with a 1000-character ceiling gets N tidy
//! messages instead of one rejected oversized one.

use pulldown_cmark::{Event, Parser, Tag, TagEnd};

/// Split `text` into chunks of at most `limit` characters.
///
/// Preference order for the cut point inside an oversized span: the last
/// paragraph break, the last line break, then a hard character cut.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= limit {
            push_chunk(&mut chunks, &chars[start..]);
            break;
        }
        let window = &chars[start..start + limit];
        let cut = find_cut(window);
        push_chunk(&mut chunks, &chars[start..start + cut]);
        start += cut;
        // Skip the separator the cut landed on.
        while start < chars.len() && chars[start] == '\n' {
            start += 1;
        }
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, chars: &[char]) {
    let s: String = chars.iter().collect();
    let s = s.trim_end().to_string();
    if !s.trim().is_empty() {
        chunks.push(s);
    }
}

fn find_cut(window: &[char]) -> usize {
    // Last paragraph break in the window.
    for i in (1..window.len()).rev() {
        if window[i] == '\n' && window[i - 1] == '\n' {
            return i;
        }
    }
    // Last line break.
    if let Some(i) = window.iter().rposition(|c| *c == '\n') {
        if i > 0 {
            return i;
        }
    }
    // Last space, so words survive.
    if let Some(i) = window.iter().rposition(|c| *c == ' ') {
        if i > 0 {
            return i;
        }
    }
    window.len()
}

/// Flatten markdown to plain text for transports without a renderer.
///
/// Headings, emphasis, and code fences lose their markers; list items get
/// a `- ` prefix; links collapse to `text (url)`; unsupported constructs
/// (images, HTML) are dropped.
pub fn flatten_markdown(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut link_url: Option<String> = None;

    for event in Parser::new(markdown) {
        match event {
            Event::Text(t) | Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Start(Tag::Item) => out.push_str("- "),
            Event::Start(Tag::Link { dest_url, .. }) => {
                link_url = Some(dest_url.to_string());
            }
            Event::End(TagEnd::Link) => {
                if let Some(url) = link_url.take() {
                    out.push_str(" (");
                    out.push_str(&url);
                    out.push(')');
                }
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    out.trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── chunk_text ────────────────────────────────────────────────────────────

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn empty_text_is_no_chunks() {
        assert!(chunk_text("", 100).is_empty());
        assert!(chunk_text("   \n", 100).is_empty());
    }

    #[test]
    fn every_chunk_respects_the_limit() {
        let text = "word ".repeat(500);
        for chunk in chunk_text(&text, 120) {
            assert!(chunk.chars().count() <= 120, "chunk too long: {chunk:?}");
        }
    }

    #[test]
    fn chunks_preserve_all_content_in_order() {
        let text = (0..50)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text, 80);
        let rejoined = chunks.join("\n");
        for i in 0..50 {
            assert!(rejoined.contains(&format!("line number {i}")));
        }
        // Order preserved.
        let a = rejoined.find("line number 3").unwrap();
        let b = rejoined.find("line number 42").unwrap();
        assert!(a < b);
    }

    #[test]
    fn paragraph_break_is_preferred_cut() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn hard_cut_on_unbreakable_text() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn multibyte_text_cuts_on_char_boundaries() {
        let text = "ö".repeat(150);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 100);
    }

    // ── flatten_markdown ──────────────────────────────────────────────────────

    #[test]
    fn heading_markers_are_dropped() {
        let flat = flatten_markdown("# Title\n\nBody text");
        assert!(flat.contains("Title"));
        assert!(!flat.contains('#'));
    }

    #[test]
    fn emphasis_markers_are_dropped() {
        let flat = flatten_markdown("this is **bold** and *italic*");
        assert_eq!(flat, "this is bold and italic");
    }

    #[test]
    fn list_items_get_dashes() {
        let flat = flatten_markdown("- one\n- two");
        assert!(flat.contains("- one"));
        assert!(flat.contains("- two"));
    }

    #[test]
    fn links_collapse_to_text_and_url() {
        let flat = flatten_markdown("see [the docs](https://example.com)");
        assert_eq!(flat, "see the docs (https://example.com)");
    }

    #[test]
    fn code_fences_keep_content_only() {
        let flat = flatten_markdown("```rust\nlet x = 1;\n```");
        assert!(flat.contains("let x = 1;"));
        assert!(!flat.contains("```"));
    }

    #[test]
    fn inline_code_keeps_content() {
        let flat = flatten_markdown("run `porter gateway` now");
        assert_eq!(flat, "run porter gateway now");
    }
}
