//! Shared utility functions used across the codebase.

use std::time::Duration;

use rand::Rng;

/// Find the largest valid UTF-8 char boundary at or before `pos`.
///
/// Polyfill for `str::floor_char_boundary` (nightly-only). Use when
/// truncating strings by byte position to avoid panicking on multi-byte
/// characters.
pub fn floor_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut i = pos;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cap `text` at `max_bytes`, appending a marker with the number of bytes
/// dropped. Cuts on a char boundary.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, max_bytes);
    format!(
        "{}\n... [output truncated, {} bytes omitted]",
        &text[..cut],
        text.len() - cut
    )
}

/// Output buffer that stops growing at a byte limit but keeps counting what
/// it drops.
#[derive(Debug)]
pub struct CappedOutput {
    text: String,
    limit: usize,
    omitted: u64,
}

impl CappedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            omitted: 0,
        }
    }

    pub fn push_str(&mut self, s: &str) {
        let room = self.limit.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let cut = floor_char_boundary(s, room);
        self.text.push_str(&s[..cut]);
        self.omitted += (s.len() - cut) as u64;
    }

    /// Account for bytes that were discarded without being read into text.
    pub fn add_omitted(&mut self, bytes: u64) {
        self.omitted += bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.omitted == 0
    }

    /// The kept text, followed by a truncation notice if anything was dropped.
    pub fn into_string(self) -> String {
        if self.omitted == 0 {
            return self.text;
        }
        format!(
            "{}\n... [output truncated, {} bytes omitted]",
            self.text, self.omitted
        )
    }
}

/// Exponential backoff with 25% jitter, capped at `max`.
///
/// `base * 2^attempt`, then uniform jitter in [-25%, +25%], with a 100ms floor.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = exp_ms.min(max.as_millis() as u64);

    let jitter_range = capped_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range.saturating_mul(2));
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    Duration::from_millis((capped_ms as i64 + jitter).max(100) as u64)
}
