// SPDX-License-Identifier: MIT OR Apache-2.0

//! BOS stripping and token masking.
//!
//! Positions reported to callers are indices into the sequence *after* BOS
//! removal; masking removes positions without renumbering the survivors.

use crate::error::{Result, SaeError};
use crate::topk::TopKActivations;

/// Tokens and top-k rows that survived BOS removal and masking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjustedTokens {
    /// Retained string tokens.
    pub tokens: Vec<String>,
    /// Post-BOS index of each retained token, strictly increasing.
    pub positions: Vec<usize>,
    /// Top-k values per retained token.
    pub values: Vec<Vec<f32>>,
    /// Top-k feature indices per retained token.
    pub indices: Vec<Vec<u32>>,
}

impl AdjustedTokens {
    /// Number of retained tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing was retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Reconcile tokens and top-k rows with the BOS convention and an
/// optional inclusion mask.
///
/// Position 0 is dropped when both `ignore_bos` and `prepend_bos` hold; a
/// mask longer than one element loses its first entry at the same time.
/// The mask length is checked only after that shift.
///
/// # Errors
///
/// Returns [`SaeError::MaskLength`] if the (shifted) mask does not match
/// the token count.
pub fn adjust_bos_and_mask(
    mut tokens: Vec<String>,
    mut top: TopKActivations,
    ignore_bos: bool,
    prepend_bos: bool,
    token_mask: Option<&[u8]>,
) -> Result<AdjustedTokens> {
    let mut mask = token_mask;
    if ignore_bos && prepend_bos {
        if !tokens.is_empty() {
            tokens.remove(0);
        }
        top.drop_first();
        mask = mask.map(|m| match m {
            [_, rest @ ..] if !rest.is_empty() => rest,
            short => short,
        });
    }

    if let Some(mask) = mask {
        if mask.len() != tokens.len() {
            tracing::error!(
                mask_len = mask.len(),
                token_count = tokens.len(),
                "token mask length mismatch"
            );
            return Err(SaeError::MaskLength {
                mask_len: mask.len(),
                token_count: tokens.len(),
            });
        }
    }

    let mut out = AdjustedTokens::default();
    let rows = tokens.into_iter().zip(top.values).zip(top.indices);
    for (pos, ((token, values), indices)) in rows.enumerate() {
        let keep = mask.map_or(true, |m| m.get(pos).is_some_and(|&flag| flag != 0));
        if keep {
            out.tokens.push(token);
            out.positions.push(pos);
            out.values.push(values);
            out.indices.push(indices);
        }
    }
    Ok(out)
}
