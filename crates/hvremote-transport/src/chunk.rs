//! Chunk sizing for the append-to-temp-file command.
//!
//! Each chunk travels as `echo <base64> >> "<target>"`. Base64 turns every
//! 3 bytes into 4 characters, so the largest chunk whose encoding still fits
//! the command-length limit is `floor((limit - scaffold) / 4) * 3` bytes.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

const APPEND_PREFIX: &str = "echo ";
const APPEND_REDIRECT: &str = " >> \"";
const APPEND_SUFFIX: &str = "\"";

/// Bytes per chunk for a given limit and scaffold, or `None` if the
/// scaffold leaves no room for data.
#[must_use]
pub const fn chunk_size(max_command_len: usize, scaffold_len: usize) -> Option<usize> {
    match max_command_len.checked_sub(scaffold_len) {
        Some(room) if room >= 4 => Some(room / 4 * 3),
        _ => None,
    }
}

/// Length of the append command without its data.
#[must_use]
pub const fn scaffold_len(target: &str) -> usize {
    APPEND_PREFIX.len() + APPEND_REDIRECT.len() + target.len() + APPEND_SUFFIX.len()
}

/// Append commands for one resolved temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    target: String,
    max_command_len: usize,
    chunk_size: usize,
}

impl ChunkPlan {
    /// Plan chunks appending to `target`.
    ///
    /// Returns `None` if `max_command_len` cannot fit a single data byte.
    #[must_use]
    pub fn new(max_command_len: usize, target: &str) -> Option<Self> {
        chunk_size(max_command_len, scaffold_len(target)).map(|chunk_size| Self {
            target: target.to_string(),
            max_command_len,
            chunk_size,
        })
    }

    /// Bytes carried per command.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Command-length limit this plan was sized for.
    #[must_use]
    pub const fn max_command_len(&self) -> usize {
        self.max_command_len
    }

    /// Number of commands needed for `len` bytes.
    #[must_use]
    pub const fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Append command for one chunk.
    #[must_use]
    pub fn command(&self, chunk: &[u8]) -> String {
        format!(
            "{APPEND_PREFIX}{}{APPEND_REDIRECT}{}{APPEND_SUFFIX}",
            BASE64.encode(chunk),
            self.target
        )
    }

    /// Append commands for a whole payload, in order.
    pub fn commands<'a>(&'a self, payload: &'a [u8]) -> impl Iterator<Item = String> + 'a {
        payload.chunks(self.chunk_size).map(|chunk| self.command(chunk))
    }
}
