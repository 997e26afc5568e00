//! Unified error type for the image pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown image format")]
    UnknownFormat,

    /// The magic bytes matched but the decoder rejected the stream.
    /// This is distinct from "not my format": no other loader is tried.
    #[error("{format} decode failed: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },

    /// The format was recognized but no decoder is compiled in.
    #[error("{format} is recognized but no decoder is available")]
    DecoderUnavailable { format: &'static str },

    #[error("invalid blurhash string")]
    BadBlurhash,

    #[error("output size ({width}, {height}) is too small")]
    TooSmall { width: u32, height: u32 },

    #[error("operation requires {expected:?} input")]
    FormatMismatch { expected: crate::PixelFormat },
}
