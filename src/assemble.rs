// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response assembly from adjusted top-k rows.

use crate::adjust::AdjustedTokens;
use crate::request::{FeatureActivation, TokenTopFeatures, TopkByTokenResponse};

/// Build the response; `tokens` and `results` stay index-aligned.
#[must_use]
pub fn assemble_response(adjusted: AdjustedTokens) -> TopkByTokenResponse {
    let AdjustedTokens {
        tokens,
        positions,
        values,
        indices,
    } = adjusted;

    let results = tokens
        .iter()
        .zip(positions)
        .zip(values.into_iter().zip(indices))
        .map(|((token, token_position), (values, indices))| TokenTopFeatures {
            token: token.clone(),
            token_position,
            top_features: indices
                .into_iter()
                .zip(values)
                .map(|(feature_index, activation_value)| FeatureActivation {
                    feature_index,
                    activation_value,
                })
                .collect(),
        })
        .collect();

    TopkByTokenResponse { tokens, results }
}
