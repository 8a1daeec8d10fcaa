use thiserror::Error;

/// All errors produced by onboard-vad.
#[derive(Debug, Error)]
pub enum VadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid sample range [{from}, {to})")]
    InvalidRange { from: u64, to: u64 },

    #[error("sample range [{from}, {to}) is longer than the ring capacity {capacity}")]
    RangeTooLong { from: u64, to: u64, capacity: usize },

    #[error("sample range [{from}, {to}) is outside the buffered window [{oldest}, {newest})")]
    IndexOutOfBounds {
        from: u64,
        to: u64,
        oldest: u64,
        newest: u64,
    },

    #[error("channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("recorder is missing samples: needs data up to {needed}, has up to {written}")]
    RecorderMissingData { needed: u64, written: u64 },

    #[error("allocation failure while growing the recorder buffer")]
    ResourceExhaustion,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VadError>;
