//! Engine adapter — the opaque per-chunk model evaluator.
//!
//! The trained separation model lives behind [`Engine`]: named tensors in,
//! named tensors out, or a clean failure. The controller assumes nothing
//! else — no determinism, no particular backend. Key names are supplied by
//! the [`ShapeRegistry`](crate::registry::ShapeRegistry)'s role→key table,
//! never hardcoded here.

use std::collections::HashMap;
use std::fmt;

use candle_core::Tensor;

/// Named tensor set exchanged with the engine.
pub type TensorMap = HashMap<String, Tensor>;

/// Engine-specific failure, carried as a human-readable message. The
/// controller wraps it into [`Error::Engine`](crate::Error::Engine).
#[derive(Debug)]
pub struct EngineError(pub String);

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EngineError {}

impl From<String> for EngineError {
    fn from(message: String) -> Self {
        EngineError(message)
    }
}

impl From<&str> for EngineError {
    fn from(message: &str) -> Self {
        EngineError(message.to_string())
    }
}

impl From<candle_core::Error> for EngineError {
    fn from(error: candle_core::Error) -> Self {
        EngineError(error.to_string())
    }
}

/// One synchronous model evaluation per call. The only blocking point in a
/// chunk's processing; callers with real-time deadlines run it on a
/// dedicated worker.
pub trait Engine: Send {
    fn run(&mut self, inputs: TensorMap) -> std::result::Result<TensorMap, EngineError>;
}

/// Owned engine handle as sessions store it.
pub type BoxedEngine = Box<dyn Engine>;

impl<F> Engine for F
where
    F: FnMut(TensorMap) -> std::result::Result<TensorMap, EngineError> + Send,
{
    fn run(&mut self, inputs: TensorMap) -> std::result::Result<TensorMap, EngineError> {
        self(inputs)
    }
}
