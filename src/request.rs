// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and response payloads for per-token top-k extraction.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SaeError};

/// Default number of features reported per token.
pub const DEFAULT_TOP_K: usize = 5;

/// A per-token top-k extraction request.
///
/// ```
/// use candle_sae_topk::TopkByTokenRequest;
///
/// let req: TopkByTokenRequest = serde_json::from_str(
///     r#"{"prompt": "Hello world", "source": "20-gemmascope-res-16k"}"#,
/// ).unwrap();
/// assert_eq!(req.top_k(), 5);
/// assert!(!req.ignore_bos);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopkByTokenRequest {
    /// Input text.
    pub prompt: String,
    /// Dictionary identifier, leading segment is the layer index.
    pub source: String,
    /// Features per token; defaults to [`DEFAULT_TOP_K`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    /// Drop the BOS position from the response when one was prepended.
    #[serde(default)]
    pub ignore_bos: bool,
    /// 0/1 inclusion flags aligned with the post-BOS token sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_mask: Option<Vec<u8>>,
    /// Reclaim device memory afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_cache: Option<bool>,
}

impl TopkByTokenRequest {
    /// New request with defaults for every optional field.
    #[must_use]
    pub fn new(prompt: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            source: source.into(),
            top_k: None,
            ignore_bos: false,
            token_mask: None,
            clear_cache: None,
        }
    }

    /// Set `top_k`.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Set `ignore_bos`.
    #[must_use]
    pub fn with_ignore_bos(mut self, ignore_bos: bool) -> Self {
        self.ignore_bos = ignore_bos;
        self
    }

    /// Set the token mask.
    #[must_use]
    pub fn with_token_mask(mut self, mask: Vec<u8>) -> Self {
        self.token_mask = Some(mask);
        self
    }

    /// Set `clear_cache`.
    #[must_use]
    pub fn with_clear_cache(mut self, clear: bool) -> Self {
        self.clear_cache = Some(clear);
        self
    }

    /// Effective `top_k`.
    #[must_use]
    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }

    /// Effective `clear_cache`.
    #[must_use]
    pub fn clear_cache(&self) -> bool {
        self.clear_cache.unwrap_or(false)
    }

    /// Reject requests that can never succeed.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::InvalidRequest`] if `top_k` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.top_k() == 0 {
            return Err(SaeError::InvalidRequest("top_k must be at least 1".into()));
        }
        Ok(())
    }
}

/// One feature and its activation at a token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureActivation {
    /// Dictionary feature index.
    pub feature_index: u32,
    /// Activation value.
    pub activation_value: f32,
}

/// Top features for one retained token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTopFeatures {
    /// String form of the token.
    pub token: String,
    /// Index in the post-BOS token sequence.
    pub token_position: usize,
    /// Strongest features first.
    pub top_features: Vec<FeatureActivation>,
}

/// Response to a [`TopkByTokenRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopkByTokenResponse {
    /// Retained tokens, aligned with `results`.
    pub tokens: Vec<String>,
    /// One entry per retained token.
    pub results: Vec<TokenTopFeatures>,
}
