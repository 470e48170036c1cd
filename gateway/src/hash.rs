//! Chunked prompt fingerprinting for KV-cache affinity lookups.
//!
//! The prompt is digested in fixed-size chunks with MurmurHash3 (x64). Each
//! emitted value covers all bytes from the start of the prompt through the
//! end of its chunk, so two prompts sharing a chunk-aligned prefix produce
//! fingerprints that agree element-by-element up to the first divergence.
//! The Metadata Center answers longest-prefix-match queries by comparing the
//! sequences positionally.

use std::io::Cursor;

/// Default chunk length in bytes.
pub const DEFAULT_CHUNK_LEN: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct PromptHasher {
    chunk_len: usize,
}

impl PromptHasher {
    /// A zero chunk length falls back to [`DEFAULT_CHUNK_LEN`].
    pub fn new(chunk_len: usize) -> Self {
        let chunk_len = if chunk_len == 0 {
            DEFAULT_CHUNK_LEN
        } else {
            chunk_len
        };
        Self { chunk_len }
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Compute the cumulative chunk fingerprint of `prompt`.
    ///
    /// Returns one digest per chunk (`ceil(len / chunk_len)` values); the
    /// digest at position `i` covers bytes `[0, (i + 1) * chunk_len)`. Text
    /// is treated as raw bytes with no normalization.
    pub fn fingerprint(&self, prompt: &[u8]) -> Vec<u64> {
        if prompt.is_empty() {
            return Vec::new();
        }

        let num_chunks = prompt.len().div_ceil(self.chunk_len);
        if num_chunks == 1 {
            return vec![digest64(prompt)];
        }

        let mut buf = Vec::with_capacity(num_chunks);
        for i in 1..=num_chunks {
            let end = (i * self.chunk_len).min(prompt.len());
            buf.push(digest64(&prompt[..end]));
        }
        buf
    }
}

impl Default for PromptHasher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_LEN)
    }
}

fn digest64(bytes: &[u8]) -> u64 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_x64_128(&mut Cursor::new(bytes), 0)
        .map(|d| d as u64)
        .unwrap_or_default()
}
