// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction with explicit BOS control.
//!
//! [`PromptTokenizer`] is the seam the [`ModelRuntime`](crate::ModelRuntime)
//! tokenizes through; [`HfTokenizer`] implements it over the `HuggingFace`
//! `tokenizers` crate.
//!
//! BOS handling is decided by the runtime, not by the tokenizer's
//! post-processor: prompts are encoded *without* special tokens and the
//! runtime prepends [`PromptTokenizer::bos_token_id`] when asked to.

use crate::error::{Result, SaeError};

/// Tokens commonly used as BOS when the post-processor does not add one.
const BOS_CANDIDATES: [&str; 4] = ["<bos>", "<s>", "<|begin_of_text|>", "<|endoftext|>"];

/// Text used to probe whether the post-processor prepends a BOS token.
const BOS_PROBE: &str = "hello";

/// Minimal tokenizer interface required by the runtime.
pub trait PromptTokenizer: Send + Sync {
    /// Encode text into token IDs without adding any special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if encoding fails.
    fn encode_raw(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs, keeping special tokens visible.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// ID of the beginning-of-sequence token, if the vocabulary has one.
    fn bos_token_id(&self) -> Option<u32>;

    /// Whether this tokenizer's own post-processing always prepends BOS.
    fn prepends_bos(&self) -> bool;
}

/// `HuggingFace` tokenizer with BOS detection.
///
/// # Example
///
/// ```no_run
/// use candle_sae_topk::{HfTokenizer, PromptTokenizer};
///
/// # fn main() -> candle_sae_topk::Result<()> {
/// let tok = HfTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode_raw("The quick brown fox")?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct HfTokenizer {
    inner: Box<tokenizers::Tokenizer>,
    bos_token_id: Option<u32>,
    prepends_bos: bool,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            SaeError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::new(tok)
    }

    /// Wrap an already-loaded tokenizer and detect its BOS convention.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Tokenizer`] if the probe encoding fails.
    pub fn new(tokenizer: tokenizers::Tokenizer) -> Result<Self> {
        let plain = encode_ids(&tokenizer, BOS_PROBE, false)?;
        let special = encode_ids(&tokenizer, BOS_PROBE, true)?;

        let prepended = match (special.first(), plain.first()) {
            (Some(&first), Some(&plain_first))
                if first != plain_first && special.len() > plain.len() =>
            {
                Some(first)
            }
            _ => None,
        };
        let bos_token_id = prepended.or_else(|| {
            BOS_CANDIDATES
                .iter()
                .find_map(|candidate| tokenizer.token_to_id(candidate))
        });

        tracing::debug!(
            ?bos_token_id,
            prepends_bos = prepended.is_some(),
            "detected tokenizer BOS convention"
        );

        Ok(Self {
            inner: Box::new(tokenizer),
            bos_token_id,
            prepends_bos: prepended.is_some(),
        })
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        encode_ids(&self.inner, text, false)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| SaeError::Tokenizer(format!("HF decode failed: {e}")))
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn prepends_bos(&self) -> bool {
        self.prepends_bos
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("bos_token_id", &self.bos_token_id)
            .field("prepends_bos", &self.prepends_bos)
            .finish_non_exhaustive()
    }
}

fn encode_ids(tok: &tokenizers::Tokenizer, text: &str, special: bool) -> Result<Vec<u32>> {
    let encoding = tok
        .encode(text, special)
        .map_err(|e| SaeError::Tokenizer(format!("HF encode failed: {e}")))?;
    Ok(encoding.get_ids().to_vec())
}
