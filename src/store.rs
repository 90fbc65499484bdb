//! Buffer store — the live recurrent state of one streaming session.
//!
//! Holds the role → tensor mapping between chunks. The mapping is replaced
//! wholesale by [`BufferStore::commit`]; there is no per-field mutation, so
//! any read observes either the pre-commit or the post-commit state, never a
//! mixture. Candle tensors are internally refcounted, which makes
//! [`BufferStore::snapshot`] a cheap structural clone.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Tensor;

use crate::registry::{BufferRole, ShapeRegistry};
use crate::{Error, Result};

/// The full role → tensor mapping for one session. The key set is exactly
/// the registry's role set for the session's lifetime.
pub type SessionState = BTreeMap<BufferRole, Tensor>;

/// Owns one [`SessionState`], initialized from the registry's defaults.
#[derive(Debug)]
pub struct BufferStore {
    registry: Arc<ShapeRegistry>,
    state: SessionState,
}

impl BufferStore {
    /// Build a store with every role zero-initialized.
    pub fn new(registry: Arc<ShapeRegistry>) -> Result<Self> {
        let state = registry.defaults()?;
        Ok(Self { registry, state })
    }

    pub fn registry(&self) -> &Arc<ShapeRegistry> {
        &self.registry
    }

    /// Current value of one role. `UnknownRole` if the registry never
    /// declared it; a declared role is always present.
    pub fn get(&self, role: BufferRole) -> Result<&Tensor> {
        self.state.get(&role).ok_or(Error::UnknownRole(role))
    }

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.clone()
    }

    /// Replace the entire state mapping in one assignment.
    pub fn commit(&mut self, new_state: SessionState) {
        self.state = new_state;
    }

    /// Back to the registry's zero defaults.
    pub fn reset(&mut self) -> Result<()> {
        self.state = self.registry.defaults()?;
        Ok(())
    }
}
