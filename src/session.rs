//! Session lifecycle manager — owns one stream's controller on a worker.
//!
//! [`StreamSession`] is a cloneable handle to a dedicated blocking worker
//! that exclusively owns the [`StreamController`]. Commands arrive over an
//! `mpsc` queue and are processed one at a time, which is the serialization
//! guarantee the controller requires: at most one `infer`, `set_embedding`,
//! or `reset` runs against the session's state at any time, and nothing
//! interleaves with an in-flight commit.
//!
//! Abandoning a pending call (dropping its future) is the supported form of
//! cancellation: the worker still finishes the call, and its commit is
//! all-or-nothing either way. No automatic retries — re-running a stateful
//! model call against possibly-drifted state is the caller's policy
//! decision.
//!
//! Independent sessions share no mutable state and run in parallel freely.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waveformer_rs::engine::BoxedEngine;
//! use waveformer_rs::registry::ShapeRegistry;
//! use waveformer_rs::session::StreamSession;
//!
//! # async fn demo(engine: BoxedEngine, chunk: candle_core::Tensor) -> waveformer_rs::Result<()> {
//! let registry = Arc::new(ShapeRegistry::waveformer(
//!     &[1, 2, 192],
//!     &[1, 256],
//!     &[1, 4, 2, 97],
//!     &[1, 4, 2, 97],
//!     &[1, 2, 96],
//!     &[1, 2, 192],
//! )?);
//! let session = StreamSession::start(registry, move || Ok(engine)).await?;
//! let separated = session.infer(chunk).await?;
//! session.close().await;
//! # Ok(()) }
//! ```

use std::sync::Arc;

use candle_core::Tensor;
use tokio::sync::{mpsc, oneshot};

use crate::controller::StreamController;
use crate::engine::BoxedEngine;
use crate::instrument::ChunkSink;
use crate::registry::ShapeRegistry;
use crate::store::SessionState;
use crate::{Error, Result};

enum Command {
    Infer {
        chunk: Tensor,
        reply: oneshot::Sender<Result<Tensor>>,
    },
    SetEmbedding {
        vector: Tensor,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionState>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one streaming session. Cloning shares the same worker; all
/// clones observe the same serialized state.
#[derive(Clone)]
pub struct StreamSession {
    tx: mpsc::Sender<Command>,
}

impl StreamSession {
    /// Start a session: construct the engine, zero-initialize the state,
    /// spawn the worker. A factory failure is a terminal
    /// [`Error::Config`] — the session never becomes usable.
    pub async fn start<F>(registry: Arc<ShapeRegistry>, engine_factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<BoxedEngine> + Send + 'static,
    {
        Self::start_inner(registry, engine_factory, None).await
    }

    /// Like [`start`](Self::start), with a per-chunk instrumentation sink.
    pub async fn start_with_sink<F>(
        registry: Arc<ShapeRegistry>,
        engine_factory: F,
        sink: Box<dyn ChunkSink>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<BoxedEngine> + Send + 'static,
    {
        Self::start_inner(registry, engine_factory, Some(sink)).await
    }

    async fn start_inner<F>(
        registry: Arc<ShapeRegistry>,
        engine_factory: F,
        sink: Option<Box<dyn ChunkSink>>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<BoxedEngine> + Send + 'static,
    {
        // Engine construction may do synchronous I/O (loading the model
        // resource), so it runs off the async executor.
        let controller = tokio::task::spawn_blocking(move || -> Result<StreamController> {
            let engine = engine_factory().map_err(|e| match e {
                Error::Config(_) => e,
                other => Error::Config(format!("engine construction failed: {other}")),
            })?;
            let controller = StreamController::new(registry, engine)?;
            Ok(match sink {
                Some(sink) => controller.with_sink(sink),
                None => controller,
            })
        })
        .await
        .map_err(|join_error| Error::Config(format!("engine init task panicked: {join_error}")))??;

        let (tx, rx) = mpsc::channel::<Command>(16);
        tokio::task::spawn_blocking(move || run_session(controller, rx));
        Ok(Self { tx })
    }

    /// Process one mixture chunk; resolves once the worker has finished it.
    pub async fn infer(&self, chunk: Tensor) -> Result<Tensor> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Infer {
                chunk,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Replace the enrolled-speaker embedding. Serialized with in-flight
    /// `infer` calls by the worker queue.
    pub async fn set_embedding(&self, vector: Tensor) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::SetEmbedding {
                vector,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Zero the recurrent state. Safe between chunks at any time.
    pub async fn reset(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Reset { reply: reply_tx })
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Immutable copy of the current recurrent state.
    pub async fn snapshot(&self) -> Result<SessionState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Tear the session down, releasing the engine. Subsequent operations
    /// on any clone of this handle fail with [`Error::SessionClosed`].
    /// Idempotent.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// The worker loop — exclusive owner of the controller, one command at a
/// time. Dropping every handle ends the loop and releases the engine.
fn run_session(mut controller: StreamController, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        // Ignore reply-send errors: the caller may have abandoned the call.
        match command {
            Command::Infer { chunk, reply } => {
                let _ = reply.send(controller.infer(chunk));
            }
            Command::SetEmbedding { vector, reply } => {
                let _ = reply.send(controller.set_embedding(vector));
            }
            Command::Reset { reply } => {
                let _ = reply.send(controller.reset());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(controller.snapshot());
            }
            Command::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::info!("stream session shut down");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};

    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::controller::testing::*;
    use crate::engine::{Engine, EngineError, TensorMap};
    use crate::registry::BufferRole;

    async fn start_increment_session() -> StreamSession {
        let registry = scenario_registry();
        let factory_registry = registry.clone();
        StreamSession::start(registry, move || {
            Ok(Box::new(IncrementEngine::new(factory_registry)) as BoxedEngine)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_failed_engine_factory_is_terminal_config_error() {
        let registry = scenario_registry();
        let result = StreamSession::start(registry, || {
            Err(Error::Config("model resource not found".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_state_threads_across_calls() {
        let session = start_increment_session().await;
        for _ in 0..3 {
            let audible = session.infer(zero_mixture()).await.unwrap();
            assert_eq!(audible.dims(), &[1, 2, 192]);
        }
        let state = session.snapshot().await.unwrap();
        assert!(tensor_values(&state[&BufferRole::ConvHistory])
            .iter()
            .all(|v| *v == 3.0));
    }

    #[tokio::test]
    async fn test_embedding_round_trip() {
        let session = start_increment_session().await;
        let data: Vec<f32> = (0..256).map(|i| i as f32).collect();
        let embedding = Tensor::from_vec(data.clone(), (1, 256), &Device::Cpu).unwrap();
        session.set_embedding(embedding).await.unwrap();
        let state = session.snapshot().await.unwrap();
        assert_eq!(tensor_values(&state[&BufferRole::Embedding]), data);
    }

    #[tokio::test]
    async fn test_reset_matches_fresh_session() {
        let session = start_increment_session().await;
        session.infer(zero_mixture()).await.unwrap();
        session.infer(zero_mixture()).await.unwrap();
        session.reset().await.unwrap();

        let fresh = start_increment_session().await;
        let reset_state = session.snapshot().await.unwrap();
        let fresh_state = fresh.snapshot().await.unwrap();
        assert_eq!(reset_state.len(), fresh_state.len());
        for (role, tensor) in &reset_state {
            assert_eq!(tensor_values(tensor), tensor_values(&fresh_state[role]));
        }
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let session = start_increment_session().await;
        session.infer(zero_mixture()).await.unwrap();
        session.close().await;
        assert!(matches!(
            session.infer(zero_mixture()).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.reset().await, Err(Error::SessionClosed)));
        // close is idempotent
        session.close().await;
    }

    /// Engine that blocks inside `run` until released, recording how many
    /// calls are inside the engine at once and the conv-history value each
    /// call observed.
    struct GatedEngine {
        registry: Arc<crate::registry::ShapeRegistry>,
        gate: Arc<(Mutex<bool>, Condvar)>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        seen_conv: Arc<Mutex<Vec<f32>>>,
    }

    impl Engine for GatedEngine {
        fn run(&mut self, inputs: TensorMap) -> std::result::Result<TensorMap, EngineError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            let conv = inputs
                .get("init_enc_buf")
                .ok_or_else(|| EngineError::from("missing init_enc_buf"))?;
            let first = conv.flatten_all()?.to_vec1::<f32>()?[0];
            self.seen_conv.lock().unwrap().push(first);

            let (open, condvar) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = condvar.wait(open).unwrap();
            }
            drop(open);

            let outputs = increment_outputs(&self.registry, &inputs);
            self.active.fetch_sub(1, Ordering::SeqCst);
            outputs
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_infers_are_serialized() {
        let registry = scenario_registry();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let seen_conv = Arc::new(Mutex::new(Vec::new()));

        let engine = GatedEngine {
            registry: registry.clone(),
            gate: gate.clone(),
            active: active.clone(),
            max_active: max_active.clone(),
            seen_conv: seen_conv.clone(),
        };
        let session = StreamSession::start(registry, move || Ok(Box::new(engine) as BoxedEngine))
            .await
            .unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.infer(zero_mixture()).await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.infer(zero_mixture()).await }
        });

        // Let both calls queue up, then release the engine.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        {
            let (open, condvar) = &*gate;
            *open.lock().unwrap() = true;
            condvar.notify_all();
        }

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // Never two calls inside the engine at once, and the second call's
        // input snapshot reflects the first call's committed output.
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        let seen = seen_conv.lock().unwrap();
        assert_eq!(seen.as_slice(), &[0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_mixture_validation_surfaces_through_session() {
        let session = start_increment_session().await;
        let wrong = Tensor::zeros(&[1, 2, 7], DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            session.infer(wrong).await,
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
