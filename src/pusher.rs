//! Outbound message delivery.
//!
//! Transports cap message size, so long replies and reports are split into
//! chunks, preferring the line boundary nearest the limit over a mid-line
//! cut. `CliPusher` is the console stand-in used by the CLI adapter and in
//! local testing of scheduled jobs.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait MessagePusher: Send + Sync {
    async fn send_private(&self, user_id: i64, message: &str) -> Result<()>;
    async fn send_group(&self, group_id: i64, message: &str) -> Result<()>;
}

/// Split `message` into chunks of at most `max_len` bytes, cutting at the
/// last newline inside the window when one exists. Always cuts on a char
/// boundary; never returns an empty chunk.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0);
    let mut parts = Vec::new();
    let mut rest = message;

    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let window = &rest[..cut];
        let (end, skip) = match window.rfind('\n') {
            // A newline at position 0 would make no progress; fall through
            // to the hard cut instead.
            Some(nl) if nl > 0 => (nl, 1),
            _ => (cut, 0),
        };
        parts.push(rest[..end].to_string());
        rest = &rest[end + skip..];
    }

    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

pub struct CliPusher {
    prefix: String,
}

impl CliPusher {
    pub fn new() -> Self {
        Self {
            prefix: "[Pusher]".to_string(),
        }
    }
}

impl Default for CliPusher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePusher for CliPusher {
    async fn send_private(&self, user_id: i64, message: &str) -> Result<()> {
        println!(
            "\n{} ==> private message to user <{}>:\n---\n{}\n---",
            self.prefix, user_id, message
        );
        Ok(())
    }

    async fn send_group(&self, group_id: i64, message: &str) -> Result<()> {
        println!(
            "\n{} ==> group message to <{}>:\n---\n{}\n---",
            self.prefix, group_id, message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn empty_message_yields_no_chunks() {
        assert!(split_message("", 100).is_empty());
    }

    #[test]
    fn splits_at_line_boundary_nearest_the_limit() {
        let text = "first line\nsecond line\nthird";
        let parts = split_message(text, 15);
        assert_eq!(parts, vec!["first line", "second line", "third"]);
    }

    #[test]
    fn long_line_without_newline_is_hard_cut() {
        let text = "a".repeat(25);
        let parts = split_message(&text, 10);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() <= 10));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn leading_newline_does_not_stall_the_split() {
        let text = format!("\n{}", "b".repeat(20));
        let parts = split_message(&text, 8);
        assert!(parts.iter().all(|p| !p.is_empty() && p.len() <= 8));
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = "日本語のテキストです".repeat(4);
        let parts = split_message(&text, 10);
        assert!(parts.iter().all(|p| p.len() <= 10));
        assert_eq!(parts.concat(), text);
    }
}
