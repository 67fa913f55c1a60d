// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-sae-topk
//!
//! Per-token top-k sparse autoencoder feature activations, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Given a prompt and a dictionary `source`, the pipeline tokenizes, runs a
//! (possibly truncated) forward pass capturing one hook point, encodes the
//! capture with an SAE (or reads raw neurons), keeps the `k` strongest
//! features per token, applies BOS and mask rules, and returns one result
//! per retained token.
//!
//! The model runtime is shared and stateful (registered hooks, retained
//! captures, device memory). Every request reaches it through a
//! [`RuntimeGate`]: one request at a time, and hooks and captures are
//! cleaned up on every exit path, panics and cancelled callers included.
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_sae_topk::{
//!     DictionaryRegistry, FeatureExtractor, InferenceConfig, ModelRuntime,
//!     TopkByTokenRequest,
//! };
//!
//! # async fn run(runtime: ModelRuntime) -> candle_sae_topk::Result<()> {
//! let config = InferenceConfig::from_env()?;
//! let device = config.device.to_device()?;
//! let mut dictionaries = DictionaryRegistry::new();
//! dictionaries.load_dir("20-gemmascope-res-16k", "saes/layer_20".as_ref(), &device)?;
//!
//! let extractor = FeatureExtractor::new(runtime, dictionaries, config);
//! let request = TopkByTokenRequest::new("The cat sat", "20-gemmascope-res-16k")
//!     .with_top_k(3)
//!     .with_ignore_bos(true);
//! let response = extractor.topk_by_token(request).await?;
//! for result in &response.results {
//!     println!("{} @{}: {:?}", result.token, result.token_position, result.top_features);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Effect |
//! |---|---|
//! | `cuda` / `metal` | GPU backends for candle |
//! | `mmap` | memory-mapped SAE weights |
//! | `hub` | `DictionaryRegistry::load_from_hub` |
//! | `server` | axum endpoint and subscriber setup |

#![warn(missing_docs)]

pub mod adjust;
pub mod assemble;
pub mod backend;
pub mod capture;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod extract;
pub mod hooks;
pub mod lifecycle;
pub mod request;
pub mod runtime;
#[cfg(feature = "server")]
pub mod server;
pub mod tokenizer;
pub mod topk;

pub use adjust::{adjust_bos_and_mask, AdjustedTokens};
pub use assemble::assemble_response;
pub use backend::ModelBackend;
pub use capture::{capture_activations, parse_layer_index};
pub use config::{DeviceSpec, InferenceConfig};
pub use dictionary::{
    DictionaryEntry, DictionaryKind, DictionaryRegistry, SaeArchitecture, SaeConfig, SaeEncoder,
};
pub use error::{Result, SaeError};
pub use extract::{extract_topk_by_token, FeatureExtractor};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};
pub use lifecycle::{CleanupPolicy, RuntimeGate, RuntimeSession};
pub use request::{
    FeatureActivation, TokenTopFeatures, TopkByTokenRequest, TopkByTokenResponse, DEFAULT_TOP_K,
};
pub use runtime::{ModelRuntime, RuntimeProbe};
pub use tokenizer::{HfTokenizer, PromptTokenizer};
pub use topk::{select_topk, TopKActivations};
