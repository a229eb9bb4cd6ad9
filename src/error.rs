use thiserror::Error;

/// Error taxonomy for the acquisition pipeline.
///
/// `Validation` is returned before any network I/O. `SequenceGap` and
/// `Overflow` are recoverable: the driver counts and logs them and keeps
/// streaming. Everything else aborts the current measurement.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter set: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("server refused command: {0}")]
    Refused(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("sequence gap: expected packet {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("receive queue overflow: {dropped} packets dropped")]
    Overflow { dropped: u64 },

    #[error("container write failed: {0}")]
    Write(#[from] hdf5::Error),
}

impl Error {
    /// True for conditions the streaming loop survives.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SequenceGap { .. } | Error::Overflow { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
