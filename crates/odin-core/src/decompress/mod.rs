//! Streaming decompression.
//!
//! LZ4 frames are decoded by the in-crate frame decoder; GZIP members go
//! through flate2. Both expose the same pull-stream of bounded blocks.

pub mod gzip;
pub mod lz4;

use thiserror::Error;

pub use gzip::{GzipStream, isize_hint};
pub use lz4::{Lz4Error, Lz4FrameDecoder, decoded_size};

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error(transparent)]
    Lz4(#[from] Lz4Error),

    #[error("gzip error after {position} decompressed bytes: {source}")]
    Gzip {
        position: u64,
        source: std::io::Error,
    },
}
