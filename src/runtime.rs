// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shared, stateful model runtime.
//!
//! [`ModelRuntime`] wraps a [`ModelBackend`] and a [`PromptTokenizer`] with
//! the state that outlives a single forward pass: registered hooks and the
//! per-hook context store holding captured, device-resident tensors.
//! That state is exactly what must be reset between requests, which is
//! why a runtime is only ever reached through a
//! [`RuntimeGate`](crate::RuntimeGate).

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::backend::ModelBackend;
use crate::error::{Result, SaeError};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};
use crate::tokenizer::PromptTokenizer;

// ---------------------------------------------------------------------------
// Hook registrations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum HookAction {
    Capture,
    Intervene(Intervention),
}

#[derive(Debug, Clone)]
struct RegisteredHook {
    point: HookPoint,
    action: HookAction,
    permanent: bool,
}

/// Snapshot of the runtime's mutable state, used to assert that no
/// request left anything behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeProbe {
    /// Non-permanent hooks still registered.
    pub temporary_hooks: usize,
    /// Permanent hooks (not attributable to any request).
    pub permanent_hooks: usize,
    /// Captured tensors still held in the context store.
    pub retained_contexts: usize,
}

impl RuntimeProbe {
    /// No temporary hooks and no retained captures.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.temporary_hooks == 0 && self.retained_contexts == 0
    }
}

// ---------------------------------------------------------------------------
// ModelRuntime
// ---------------------------------------------------------------------------

/// Transformer backend, tokenizer, and device, plus registered hooks and
/// retained captures.
pub struct ModelRuntime {
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn ModelBackend>,
    // TRAIT_OBJECT: tokenizer implementations vary per model family
    tokenizer: Box<dyn PromptTokenizer>,
    device: Device,
    hooks: Vec<RegisteredHook>,
    contexts: HashMap<HookPoint, Tensor>,
}

impl ModelRuntime {
    /// Assemble a runtime from its parts.
    #[must_use]
    pub fn new(
        backend: Box<dyn ModelBackend>,
        tokenizer: Box<dyn PromptTokenizer>,
        device: Device,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            hooks: Vec::new(),
            contexts: HashMap::new(),
        }
    }

    /// The device this runtime's tensors live on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of transformer blocks.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    // --- Tokenization ----------------------------------------------------

    /// Whether the tokenizer itself always prepends BOS.
    #[must_use]
    pub fn tokenizer_prepends_bos(&self) -> bool {
        self.tokenizer.prepends_bos()
    }

    /// Tokenize a prompt, with exactly one leading BOS when `prepend_bos`.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if encoding fails or BOS is requested
    /// from a vocabulary without one.
    pub fn to_tokens(&self, prompt: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode_raw(prompt)?;
        if prepend_bos {
            let bos = self.tokenizer.bos_token_id().ok_or_else(|| {
                SaeError::Tokenizer("BOS requested but the tokenizer has no BOS token".into())
            })?;
            ids.insert(0, bos);
        }
        Ok(ids)
    }

    /// Decode each token ID on its own.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if any decode fails.
    pub fn str_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter()
            .map(|id| self.tokenizer.decode(std::slice::from_ref(id)))
            .collect()
    }

    /// Tokenize a prompt into per-token strings.
    ///
    /// # Errors
    ///
    /// Same as [`to_tokens`](Self::to_tokens).
    pub fn to_str_tokens(&self, prompt: &str, prepend_bos: bool) -> Result<Vec<String>> {
        self.str_tokens(&self.to_tokens(prompt, prepend_bos)?)
    }

    /// Move token IDs onto the runtime device as a `[1, seq]` batch.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Model`] if the allocation fails.
    pub fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    // --- Hooks -------------------------------------------------------------

    /// Register a temporary intervention; removed by the next
    /// [`reset_hooks`](Self::reset_hooks).
    pub fn add_hook<H: Into<HookPoint>>(&mut self, hook: H, intervention: Intervention) {
        self.hooks.push(RegisteredHook {
            point: hook.into(),
            action: HookAction::Intervene(intervention),
            permanent: false,
        });
    }

    /// Register a permanent intervention; survives request cleanup.
    pub fn add_perma_hook<H: Into<HookPoint>>(&mut self, hook: H, intervention: Intervention) {
        self.hooks.push(RegisteredHook {
            point: hook.into(),
            action: HookAction::Intervene(intervention),
            permanent: true,
        });
    }

    /// Remove registered hooks, optionally clearing the context store.
    ///
    /// Permanent hooks are kept unless `including_permanent`.
    pub fn reset_hooks(&mut self, clear_contexts: bool, including_permanent: bool) {
        if including_permanent {
            self.hooks.clear();
        } else {
            self.hooks.retain(|hook| hook.permanent);
        }
        if clear_contexts {
            self.clear_contexts();
        }
    }

    /// Drop every retained capture.
    pub fn clear_contexts(&mut self) {
        self.contexts.clear();
    }

    /// Retained capture for a hook point, if any.
    #[must_use]
    pub fn context(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.contexts.get(hook)
    }

    /// Wait for outstanding device work so buffers released by dropped
    /// tensors are returned to the allocator.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Model`] if the device fails to synchronize.
    pub fn reclaim_device_memory(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }

    /// Current hook and context counts.
    #[must_use]
    pub fn probe(&self) -> RuntimeProbe {
        let permanent_hooks = self.hooks.iter().filter(|hook| hook.permanent).count();
        RuntimeProbe {
            temporary_hooks: self.hooks.len() - permanent_hooks,
            permanent_hooks,
            retained_contexts: self.contexts.len(),
        }
    }

    // --- Forward -----------------------------------------------------------

    /// Forward pass capturing the given hook points.
    ///
    /// Capture hooks are registered for the duration of the pass and the
    /// captured tensors are retained in the context store until
    /// [`clear_contexts`](Self::clear_contexts), which every
    /// [`RuntimeSession`](crate::RuntimeSession) does on exit. A failing
    /// pass leaves the capture hooks registered;
    /// [`reset_hooks`](Self::reset_hooks) removes them.
    ///
    /// `stop_at_layer` is exclusive and clamped to the model depth.
    ///
    /// # Shapes
    /// - `input_ids`: `[1, seq]`
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn run_with_cache(
        &mut self,
        input_ids: &Tensor,
        captures: &[HookPoint],
        stop_at_layer: Option<usize>,
    ) -> Result<HookCache> {
        for point in captures {
            self.hooks.push(RegisteredHook {
                point: point.clone(),
                action: HookAction::Capture,
                permanent: false,
            });
        }

        let spec = self.hook_spec(stop_at_layer);
        let cache = self.backend.forward(input_ids, &spec)?;

        for (point, tensor) in cache.captures() {
            self.contexts.insert(point.clone(), tensor.detach());
        }
        self.hooks
            .retain(|hook| !matches!(hook.action, HookAction::Capture));

        Ok(cache)
    }

    fn hook_spec(&self, stop_at_layer: Option<usize>) -> HookSpec {
        let mut spec = HookSpec::new();
        for hook in &self.hooks {
            match &hook.action {
                HookAction::Capture => {
                    spec.capture(hook.point.clone());
                }
                HookAction::Intervene(intervention) => {
                    spec.intervene(hook.point.clone(), intervention.clone());
                }
            }
        }
        if let Some(layer) = stop_at_layer {
            spec.stop_at_layer(layer.min(self.backend.num_layers()));
        }
        spec
    }
}

impl std::fmt::Debug for ModelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRuntime")
            .field("device", &self.device)
            .field("num_layers", &self.backend.num_layers())
            .field("probe", &self.probe())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
