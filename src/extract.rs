// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-token top-k extraction pipeline.
//!
//! ```text
//! validate -> resolve source -> [gate] tokenize -> limit check
//!   -> capture + encode -> top-k -> BOS/mask -> assemble [cleanup]
//! ```
//!
//! [`FeatureExtractor`] owns the gate and the dictionary registry and is
//! what a server shares between handlers.
//! [`extract_topk_by_token`] is the body that runs inside a session.

use std::sync::Arc;

use crate::adjust::adjust_bos_and_mask;
use crate::assemble::assemble_response;
use crate::capture::capture_activations;
use crate::config::InferenceConfig;
use crate::dictionary::DictionaryRegistry;
use crate::error::{Result, SaeError};
use crate::lifecycle::{CleanupPolicy, RuntimeGate};
use crate::request::{TopkByTokenRequest, TopkByTokenResponse};
use crate::runtime::{ModelRuntime, RuntimeProbe};
use crate::topk::select_topk;

/// Shared entry point for top-k extraction.
#[derive(Debug)]
pub struct FeatureExtractor {
    gate: RuntimeGate,
    dictionaries: Arc<DictionaryRegistry>,
    config: InferenceConfig,
}

impl FeatureExtractor {
    /// Wrap a runtime and its dictionaries.
    #[must_use]
    pub fn new(
        runtime: ModelRuntime,
        dictionaries: DictionaryRegistry,
        config: InferenceConfig,
    ) -> Self {
        let gate = RuntimeGate::new(runtime, CleanupPolicy::new(config.auto_clear_cache));
        Self {
            gate,
            dictionaries: Arc::new(dictionaries),
            config,
        }
    }

    /// Extract per-token top-k features.
    ///
    /// Waits for the runtime gate without blocking a thread; the body then
    /// runs to completion on the blocking pool even if this future is
    /// dropped.
    ///
    /// # Errors
    ///
    /// - [`SaeError::InvalidRequest`] if `top_k` is zero
    /// - [`SaeError::Configuration`] for unknown sources
    /// - [`SaeError::InputTooLarge`] if the prompt exceeds the token limit
    /// - [`SaeError::MaskLength`] if the mask does not fit the tokens
    /// - runtime errors from the model or dictionary
    pub async fn topk_by_token(&self, request: TopkByTokenRequest) -> Result<TopkByTokenResponse> {
        self.precheck(&request)?;
        let dictionaries = Arc::clone(&self.dictionaries);
        let config = self.config.clone();
        self.gate
            .run(request.clear_cache(), move |runtime| {
                extract_topk_by_token(runtime, &dictionaries, &config, &request)
            })
            .await
    }

    /// Blocking variant of [`topk_by_token`](Self::topk_by_token).
    ///
    /// # Errors
    ///
    /// Same as [`topk_by_token`](Self::topk_by_token).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn topk_by_token_blocking(
        &self,
        request: &TopkByTokenRequest,
    ) -> Result<TopkByTokenResponse> {
        self.precheck(request)?;
        self.gate.run_blocking(request.clear_cache(), |runtime| {
            extract_topk_by_token(runtime, &self.dictionaries, &self.config, request)
        })
    }

    /// Runtime state snapshot.
    pub async fn probe(&self) -> RuntimeProbe {
        self.gate.probe().await
    }

    /// The gate guarding the runtime.
    #[must_use]
    pub const fn gate(&self) -> &RuntimeGate {
        &self.gate
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Registered dictionaries.
    #[must_use]
    pub fn dictionaries(&self) -> &DictionaryRegistry {
        &self.dictionaries
    }

    // Checks that need no runtime access fail before queueing at the gate.
    fn precheck(&self, request: &TopkByTokenRequest) -> Result<()> {
        request.validate()?;
        self.dictionaries.resolve(&request.source)?;
        Ok(())
    }
}

/// Run one extraction against an exclusively held runtime.
///
/// # Errors
///
/// See [`FeatureExtractor::topk_by_token`].
pub fn extract_topk_by_token(
    runtime: &mut ModelRuntime,
    dictionaries: &DictionaryRegistry,
    config: &InferenceConfig,
    request: &TopkByTokenRequest,
) -> Result<TopkByTokenResponse> {
    request.validate()?;
    let entry = dictionaries.resolve(&request.source)?;
    let prepend_bos = entry.prepend_bos() || runtime.tokenizer_prepends_bos();

    let ids = runtime.to_tokens(&request.prompt, prepend_bos)?;
    if ids.len() > config.token_limit {
        tracing::error!(
            source = %request.source,
            tokens = ids.len(),
            limit = config.token_limit,
            "prompt exceeds token limit"
        );
        return Err(SaeError::InputTooLarge {
            tokens: ids.len(),
            limit: config.token_limit,
        });
    }
    let tokens = runtime.str_tokens(&ids)?;

    let input_ids = runtime.input_tensor(&ids)?;
    let activations = capture_activations(runtime, &input_ids, entry, config.optimize_memory)?;
    let top = select_topk(&activations, request.top_k())?;
    drop(activations);

    let adjusted = adjust_bos_and_mask(
        tokens,
        top,
        request.ignore_bos,
        prepend_bos,
        request.token_mask.as_deref(),
    )?;
    let response = assemble_response(adjusted);

    tracing::info!(
        source = %request.source,
        kind = entry.kind_name(),
        tokens = ids.len(),
        results = response.results.len(),
        "served top-k by token"
    );
    Ok(response)
}
