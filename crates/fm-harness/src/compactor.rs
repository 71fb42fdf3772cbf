use async_trait::async_trait;

use crate::backend::Result;

// ---------------------------------------------------------------------------
// Compactor
// ---------------------------------------------------------------------------

/// Shrinks an over-long payload so a context-overflowed call can be retried.
///
/// The production compactor is an external summarization service; the engine
/// only needs this seam. [`TruncatingCompactor`] is the deterministic
/// fallback wired in when no summarizer is registered.
#[async_trait]
pub trait Compactor: Send + Sync {
    async fn compact(&self, payload: &str) -> Result<String>;
}

/// Keeps the head and tail of the payload and drops the middle.
///
/// The head carries the task statement, the tail carries the most recent
/// feedback; the middle is the bulk that overflowed.
pub struct TruncatingCompactor {
    pub keep_head: usize,
    pub keep_tail: usize,
}

impl Default for TruncatingCompactor {
    fn default() -> Self {
        Self {
            keep_head: 4_000,
            keep_tail: 4_000,
        }
    }
}

#[async_trait]
impl Compactor for TruncatingCompactor {
    async fn compact(&self, payload: &str) -> Result<String> {
        if payload.len() <= self.keep_head + self.keep_tail {
            return Ok(payload.to_string());
        }
        let head_end = floor_char_boundary(payload, self.keep_head);
        let tail_start = ceil_char_boundary(payload, payload.len() - self.keep_tail);
        Ok(format!(
            "{}\n\n[... {} bytes elided ...]\n\n{}",
            &payload[..head_end],
            tail_start - head_end,
            &payload[tail_start..],
        ))
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_payload_passes_through() {
        let c = TruncatingCompactor {
            keep_head: 100,
            keep_tail: 100,
        };
        let out = c.compact("short payload").await.unwrap();
        assert_eq!(out, "short payload");
    }

    #[tokio::test]
    async fn long_payload_keeps_head_and_tail() {
        let c = TruncatingCompactor {
            keep_head: 10,
            keep_tail: 10,
        };
        let payload = format!("HEAD{}TAIL______", "x".repeat(500));
        let out = c.compact(&payload).await.unwrap();
        assert!(out.starts_with("HEAD"));
        assert!(out.ends_with("TAIL______"));
        assert!(out.contains("elided"));
        assert!(out.len() < payload.len());
    }

    #[tokio::test]
    async fn multibyte_payload_respects_char_boundaries() {
        let c = TruncatingCompactor {
            keep_head: 5,
            keep_tail: 5,
        };
        let payload = "가나다라마바사아자차카타파하".repeat(10);
        // Must not panic on a non-boundary slice.
        let out = c.compact(&payload).await.unwrap();
        assert!(out.contains("elided"));
    }
}
