// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation capture and projection into feature space.
//!
//! One forward pass captures the dictionary's hook point; the capture is
//! then encoded (SAE) or taken as-is (neurons) into a
//! `[positions, feature_dim]` matrix.

use candle_core::{DType, Tensor};

use crate::dictionary::{DictionaryEntry, DictionaryKind};
use crate::error::{Result, SaeError};
use crate::runtime::ModelRuntime;

/// Layer index encoded as the leading `-`-separated segment of a source
/// identifier (`"20-gemmascope-res-16k"` is layer 20).
#[must_use]
pub fn parse_layer_index(source: &str) -> Option<usize> {
    source.split('-').next()?.trim().parse().ok()
}

/// Exclusive stop layer for a source, or `None` for a full pass.
///
/// Early stopping is only used when `optimize_memory` is set and the layer
/// can be read from the source identifier.
#[must_use]
pub fn stop_layer_for(source: &str, optimize_memory: bool) -> Option<usize> {
    if !optimize_memory {
        return None;
    }
    let stop = parse_layer_index(source).and_then(|layer| layer.checked_add(1));
    if stop.is_none() {
        tracing::debug!(source, "no usable layer index in source, running full forward pass");
    }
    stop
}

/// Run the forward pass for `entry` and return its feature activations.
///
/// # Shapes
/// - `input_ids`: `[1, seq]`
/// - returns: `[seq, feature_dim]` (F32)
///
/// # Errors
///
/// Returns [`SaeError::Hook`] if the backend did not produce the capture,
/// [`SaeError::Configuration`] if an SAE's input width does not match the
/// capture, and [`SaeError::Model`] on tensor failures.
pub fn capture_activations(
    runtime: &mut ModelRuntime,
    input_ids: &Tensor,
    entry: &DictionaryEntry,
    optimize_memory: bool,
) -> Result<Tensor> {
    let stop = stop_layer_for(entry.source(), optimize_memory);
    let cache = runtime.run_with_cache(input_ids, std::slice::from_ref(entry.hook()), stop)?;
    let captured = cache.require(entry.hook())?;

    // [1, seq, ...] -> [seq, d]
    let dense = captured.squeeze(0)?;
    let dense = if dense.rank() > 2 {
        dense.flatten_from(1)?
    } else {
        dense
    };

    match entry.kind() {
        DictionaryKind::Neurons => Ok(dense.to_dtype(DType::F32)?),
        DictionaryKind::Sae(encoder) => {
            let width = dense.dim(1)?;
            if width != encoder.d_in() {
                return Err(SaeError::Configuration(format!(
                    "{} expects d_in {}, hook {} has width {width}",
                    entry.source(),
                    encoder.d_in(),
                    entry.hook()
                )));
            }
            encoder.encode(&dense)
        }
    }
}
