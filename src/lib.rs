//! Streaming target-speaker extraction in Rust.
//!
//! Streams fixed-size audio chunks through a recurrent separation model to
//! isolate one enrolled speaker's voice from a live two-channel mixture.
//! The model is stateful: every inference call consumes and produces a set
//! of recurrent tensors (convolution history, attention caches, overlap-add
//! state) that must be threaded, intact, from one chunk to the next. This
//! crate is the controller for that threading; the numeric model itself is
//! an opaque collaborator behind the [`engine::Engine`] trait.
//!
//! ## Data flow per chunk
//!
//! ```text
//! caller ──chunk──▶ session ──▶ controller
//!                                  │ current state + chunk
//!                                  ▼
//!                               engine
//!                                  │ next state + separated audio
//!                                  ▼
//!                        validate, commit atomically
//!                                  │
//! caller ◀──separated chunk────────┘
//! ```
//!
//! A failed chunk commits nothing: the recurrent state stays at its last
//! known-good value and the next successful chunk continues from there.
//!
//! ## Modules
//!
//! - [`registry`] — per-model-version declaration of every recurrent
//!   buffer's role, shape, and engine key
//! - [`store`] — the live role → tensor mapping for one session
//! - [`engine`] — the opaque model-evaluator interface
//! - [`controller`] — per-chunk orchestration and atomic state commit
//! - [`session`] — lifecycle and serialization boundary for one stream
//! - [`enroll`] — enrollment provider interface and embedding persistence
//! - [`instrument`] — optional per-chunk timing hook

pub mod controller;
pub mod engine;
pub mod enroll;
pub mod instrument;
pub mod registry;
pub mod session;
pub mod store;

mod error;

pub use error::{Error, Result};
