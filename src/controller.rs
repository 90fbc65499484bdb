//! Streaming inference controller — one chunk in, one separated chunk out.
//!
//! Owns the recurrent state for a stream and threads it through the engine:
//!
//! 1. validate the incoming mixture chunk against the registry
//! 2. assemble the engine inputs from the current state, with the `Mixture`
//!    slot replaced by the new chunk
//! 3. run the engine (the only blocking point)
//! 4. validate every expected next-state output and the audible output
//! 5. commit the next state atomically and return the audible chunk
//!
//! A failed call — engine error, missing output, shape mismatch — commits
//! nothing: the store stays at its last known-good state and the next
//! successful chunk continues from there.
//!
//! Calls on one controller must be strictly serialized, because chunk *k+1*
//! consumes the state committed by chunk *k*. `&mut self` enforces this for
//! direct users; across threads the session worker
//! ([`StreamSession`](crate::session::StreamSession)) is the serialization
//! boundary.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;

use crate::engine::{BoxedEngine, TensorMap};
use crate::instrument::{ChunkRecord, ChunkSink};
use crate::registry::{BufferRole, ShapeRegistry};
use crate::store::{BufferStore, SessionState};
use crate::{Error, Result};

/// Stateful controller for one audio stream.
pub struct StreamController {
    registry: Arc<ShapeRegistry>,
    store: BufferStore,
    engine: BoxedEngine,
    chunk_index: u64,
    sink: Option<Box<dyn ChunkSink>>,
}

impl StreamController {
    /// Build a controller with zero-initialized state.
    pub fn new(registry: Arc<ShapeRegistry>, engine: BoxedEngine) -> Result<Self> {
        let store = BufferStore::new(registry.clone())?;
        Ok(Self {
            registry,
            store,
            engine,
            chunk_index: 0,
            sink: None,
        })
    }

    /// Attach a per-chunk instrumentation sink.
    pub fn with_sink(mut self, sink: Box<dyn ChunkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<ShapeRegistry> {
        &self.registry
    }

    /// Number of `infer` calls made so far, successful or not.
    pub fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    /// Immutable copy of the current recurrent state.
    pub fn snapshot(&self) -> SessionState {
        self.store.snapshot()
    }

    /// Process one mixture chunk and return the separated-audio chunk.
    ///
    /// On any error the recurrent state is left exactly as it was before
    /// the call.
    pub fn infer(&mut self, mixture_chunk: Tensor) -> Result<Tensor> {
        let start = Instant::now();
        let result = self.infer_inner(mixture_chunk);
        let end = Instant::now();
        if let Some(sink) = &mut self.sink {
            sink.record(ChunkRecord {
                chunk_index: self.chunk_index,
                start,
                end,
                duration: end - start,
                ok: result.is_ok(),
            });
        }
        self.chunk_index += 1;
        result
    }

    fn infer_inner(&mut self, mixture_chunk: Tensor) -> Result<Tensor> {
        self.registry.validate(BufferRole::Mixture, &mixture_chunk)?;

        // Current state with the mixture slot replaced by the new chunk.
        let mut inputs = TensorMap::with_capacity(self.registry.len());
        for (role, spec) in self.registry.shapes() {
            let value = if role == BufferRole::Mixture {
                mixture_chunk.clone()
            } else {
                self.store.get(role)?.clone()
            };
            inputs.insert(spec.input_key.clone(), value);
        }

        let mut outputs = self
            .engine
            .run(inputs)
            .map_err(|e| Error::Engine(e.to_string()))?;

        // Validate the full output set before touching the store; any
        // failure below returns with the pre-call state intact.
        let mut next = self.store.snapshot();
        for role in self.registry.state_roles() {
            let spec = self.registry.spec(role)?;
            let key = spec.output_key.as_deref().unwrap_or_default();
            let tensor = outputs
                .remove(key)
                .ok_or_else(|| Error::MissingOutput(key.to_string()))?;
            self.registry.validate(role, &tensor)?;
            next.insert(role, tensor);
        }
        let audible = outputs
            .remove(self.registry.audible_key())
            .ok_or_else(|| Error::MissingOutput(self.registry.audible_key().to_string()))?;
        self.registry.validate_audible(&audible)?;
        for key in outputs.keys() {
            tracing::warn!(key = %key, "ignoring unexpected engine output");
        }

        self.store.commit(next);
        tracing::debug!(chunk = self.chunk_index, "committed recurrent state");
        Ok(audible)
    }

    /// Replace the enrolled-speaker embedding, leaving every other role
    /// untouched. Not produced by per-chunk inference; changing it
    /// mid-stream is a deliberate caller decision.
    pub fn set_embedding(&mut self, vector: Tensor) -> Result<()> {
        self.registry.validate(BufferRole::Embedding, &vector)?;
        let mut next = self.store.snapshot();
        next.insert(BufferRole::Embedding, vector);
        self.store.commit(next);
        Ok(())
    }

    /// Back to the registry's zero defaults.
    pub fn reset(&mut self) -> Result<()> {
        self.store.reset()
    }
}
