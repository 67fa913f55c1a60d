// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model backend trait.
//!
//! [`ModelBackend`] is what a transformer implementation provides so the
//! [`ModelRuntime`](crate::ModelRuntime) can run hook-aware, optionally
//! truncated forward passes over it.

use crate::error::Result;
use crate::hooks::{HookCache, HookSpec};

/// Hook-aware forward pass over a loaded transformer.
///
/// Backends are stateless with respect to hooks: everything a pass needs
/// (captures, interventions, truncation) arrives in the [`HookSpec`].
/// Registration state lives in the runtime.
pub trait ModelBackend: Send + Sync {
    /// Number of transformer blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Forward pass with hook capture, interventions, and early stopping.
    ///
    /// When [`HookSpec::stop_layer`] is `Some(n)`, blocks `n..` must not be
    /// evaluated and the returned output is the residual stream after block
    /// `n - 1`. Block `n - 1` itself is evaluated in full, including every
    /// hook point inside it.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] whose captures are `[batch, seq, ...]`
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Model`](crate::SaeError::Model) on tensor
    /// failures (including device out-of-memory).
    fn forward(&self, input_ids: &candle_core::Tensor, hooks: &HookSpec) -> Result<HookCache>;
}
