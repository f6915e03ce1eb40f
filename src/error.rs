use std::path::PathBuf;

use thiserror::Error;


pub type TilingResult<T> = Result<T, TilingError>;

#[derive(Error, Debug)]
pub enum TilingError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("no splat source found: {0}")]
    MissingSource(String),

    #[error("no codec backend available (neither in-process nor external)")]
    CodecUnavailable,

    #[error("codec process timed out after {seconds}s")]
    CodecTimeout {
        seconds: u64,
    },

    #[error("codec process failed: {stderr}")]
    CodecProcessFailed {
        stderr: String,
    },

    #[error("tile subset is empty")]
    EmptySubset,

    #[error("tile buffer of {bytes} bytes exceeds 32-bit addressing")]
    BufferOverflow {
        bytes: u64,
    },

    #[error("program invariant violated: {0}")]
    ProgramInvariant(String),

    #[error("conversion already running for block `{block_id}`")]
    AlreadyRunning {
        block_id: String,
    },

    #[error("conversion cancelled")]
    Cancelled,

    #[error("io error on `{path}`: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TilingError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(message.into())
    }

    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Codec bridge failures, as opposed to bad input or packaging errors.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            Self::CodecUnavailable | Self::CodecTimeout { .. } | Self::CodecProcessFailed { .. },
        )
    }
}
