//! File transfer for remote shells.
//!
//! Provides:
//! - Chunk sizing for length-limited command lines
//! - `Uploader` - Base64 chunked upload with remote reconstruction

pub mod chunk;
pub mod upload;

pub use chunk::ChunkPlan;
pub use upload::{UploadConfig, UploadError, UploadStep, Uploader};
