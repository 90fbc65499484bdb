//! Error types for waveformer-rs.

use candle_core::DType;

use crate::registry::BufferRole;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid registry/session configuration, or the engine could not be
    /// constructed at session init. Fatal to the session.
    #[error("config: {0}")]
    Config(String),

    /// A tensor does not match its registry-declared shape. Local to the
    /// offending call; no state mutation occurs.
    #[error("shape mismatch for {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A tensor does not match its registry-declared element type.
    #[error("dtype mismatch for {context}: expected {expected:?}, got {got:?}")]
    DtypeMismatch {
        context: String,
        expected: DType,
        got: DType,
    },

    /// The engine succeeded but omitted an expected next-state or
    /// audible-output entry. Engine contract violation; no state mutation.
    #[error("engine output missing expected entry `{0}`")]
    MissingOutput(String),

    /// The engine adapter itself failed. No state mutation; the caller
    /// decides whether to skip the chunk or abort the stream.
    #[error("engine: {0}")]
    Engine(String),

    /// Operation attempted after session teardown.
    #[error("session is closed")]
    SessionClosed,

    /// A role was requested that the registry does not declare.
    #[error("unknown buffer role: {0}")]
    UnknownRole(BufferRole),

    /// Candle tensor error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
