//! Configuration errors reported by the attention kernel before any output is written.

/// Largest head dimension handled by the kernel, same limit as the CUDA kernels.
pub const MAX_HEAD_DIM: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("number of k/v heads {num_heads_k} must divide number of heads in query {num_heads}")]
    HeadCount { num_heads: usize, num_heads_k: usize },

    #[error("only supports head dimension at most {MAX_HEAD_DIM} (got {0})")]
    UnsupportedHeadDim(usize),

    #[error("{arg} must be positive")]
    ZeroExtent { arg: &'static str },

    #[error("{arg}_rounded ({rounded}) is smaller than {arg} ({value})")]
    RoundedExtent {
        arg: &'static str,
        value: usize,
        rounded: usize,
    },

    #[error("{arg}: {reason}")]
    CuSeqlens { arg: &'static str, reason: String },

    #[error("{arg} for batch {batch} has length {len}, larger than the declared maximum {max}")]
    SeqlenTooLong {
        arg: &'static str,
        batch: usize,
        len: usize,
        max: usize,
    },

    #[error("{arg} buffer too small: {required} elements required, got {len}")]
    BufferTooSmall {
        arg: &'static str,
        required: usize,
        len: usize,
    },

    #[error("{arg}: strides and extents address more than usize::MAX elements")]
    ExtentOverflow { arg: &'static str },
}

pub type Result<T> = std::result::Result<T, FlashError>;

impl From<FlashError> for candle::Error {
    fn from(err: FlashError) -> Self {
        candle::Error::wrap(err)
    }
}
