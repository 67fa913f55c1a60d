// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-sae-topk.

/// Errors that can occur while extracting top-k feature activations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SaeError {
    /// Forward pass, encoding, or other tensor failure (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Unknown source, or a dictionary/configuration that cannot be used.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tokenized prompt is longer than the configured limit.
    #[error("Text too long: {tokens} tokens, max is {limit}")]
    InputTooLarge {
        /// Number of tokens the prompt produced (including BOS).
        tokens: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The caller's token mask does not line up with the (post-BOS) tokens.
    #[error("Token mask length ({mask_len}) does not match token count ({token_count})")]
    MaskLength {
        /// Length of the supplied mask after BOS adjustment.
        mask_len: usize,
        /// Number of tokens after BOS adjustment.
        token_count: usize,
    },

    /// Request fields outside their valid range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The worker running a request panicked or was torn down.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SaeError {
    /// Whether the error was caused by the request itself rather than by the
    /// service (maps to a 400-class response).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InputTooLarge { .. } | Self::MaskLength { .. } | Self::InvalidRequest(_)
        )
    }
}

/// Result type alias for candle-sae-topk operations.
pub type Result<T> = std::result::Result<T, SaeError>;
