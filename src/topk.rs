// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-position top-k selection over feature activations.
//!
//! Ordering is deterministic: values descend, ties go to the lower feature
//! index, and NaN ranks below every number.

use std::cmp::Ordering;

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Top-k values and feature indices for each position.
///
/// Row `i` of both vectors belongs to position `i`; each row holds
/// `min(k, feature_dim)` entries in rank order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopKActivations {
    /// Activation values per position, highest first.
    pub values: Vec<Vec<f32>>,
    /// Feature indices per position, aligned with `values`.
    pub indices: Vec<Vec<u32>>,
}

impl TopKActivations {
    /// Number of positions.
    #[must_use]
    pub fn num_positions(&self) -> usize {
        self.values.len()
    }

    /// Drop the first position (used to strip BOS).
    pub fn drop_first(&mut self) {
        if !self.values.is_empty() {
            self.values.remove(0);
        }
        if !self.indices.is_empty() {
            self.indices.remove(0);
        }
    }
}

/// Select the `k` strongest features at every position.
///
/// # Shapes
/// - `activations`: `[positions, feature_dim]`
///
/// # Errors
///
/// Returns [`SaeError::Model`](crate::SaeError::Model) if `activations`
/// is not rank 2 or cannot be read back to the host.
pub fn select_topk(activations: &Tensor, k: usize) -> Result<TopKActivations> {
    let (positions, width) = activations.dims2()?;
    // One device read for the whole matrix.
    let flat = activations
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let mut out = TopKActivations {
        values: Vec::with_capacity(positions),
        indices: Vec::with_capacity(positions),
    };
    if width == 0 {
        out.values.resize(positions, Vec::new());
        out.indices.resize(positions, Vec::new());
        return Ok(out);
    }
    for row in flat.chunks_exact(width) {
        let (values, indices) = top_k_row(row, k);
        out.values.push(values);
        out.indices.push(indices);
    }
    Ok(out)
}

/// Top-k of a single row, `k` clamped to the row length.
///
/// Partial selection followed by a sort of the kept prefix only.
#[must_use]
pub fn top_k_row(row: &[f32], k: usize) -> (Vec<f32>, Vec<u32>) {
    let k = k.min(row.len());
    if k == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut order: Vec<usize> = (0..row.len()).collect();
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, |&a, &b| rank(row, a, b));
        order.truncate(k);
    }
    order.sort_unstable_by(|&a, &b| rank(row, a, b));

    let values = order.iter().filter_map(|&i| row.get(i).copied()).collect();
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let indices = order.iter().map(|&i| i as u32).collect();
    (values, indices)
}

fn rank(row: &[f32], a: usize, b: usize) -> Ordering {
    let va = row.get(a).copied().unwrap_or(f32::NAN);
    let vb = row.get(b).copied().unwrap_or(f32::NAN);
    match (va.is_nan(), vb.is_nan()) {
        (true, true) => a.cmp(&b),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => vb.partial_cmp(&va).unwrap_or(Ordering::Equal).then(a.cmp(&b)),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn ties_break_by_ascending_index() {
        let (values, indices) = top_k_row(&[1.0, 3.0, 3.0, 2.0, 3.0], 3);
        assert_eq!(values, vec![3.0, 3.0, 3.0]);
        assert_eq!(indices, vec![1, 2, 4]);
    }

    #[test]
    fn k_larger_than_row_is_clamped() {
        let (values, indices) = top_k_row(&[0.5, 2.0], 5);
        assert_eq!(values, vec![2.0, 0.5]);
        assert_eq!(indices, vec![1, 0]);
    }

    #[test]
    fn nan_ranks_last() {
        let (values, indices) = top_k_row(&[f32::NAN, -1.0, 0.0], 2);
        assert_eq!(values, vec![0.0, -1.0]);
        assert_eq!(indices, vec![2, 1]);
        let (_, indices) = top_k_row(&[f32::NAN, f32::NAN, 1.0], 3);
        assert_eq!(indices, vec![2, 0, 1]);
    }

    #[test]
    fn all_zero_row_selects_lowest_indices() {
        let (values, indices) = top_k_row(&[0.0; 6], 3);
        assert_eq!(values, vec![0.0; 3]);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn per_position_over_tensor() {
        let t = Tensor::new(&[[0.1_f32, 0.9, 0.5], [2.0, 0.0, 2.0]], &Device::Cpu).unwrap();
        let top = select_topk(&t, 2).unwrap();
        assert_eq!(top.num_positions(), 2);
        assert_eq!(top.indices, vec![vec![1, 2], vec![0, 2]]);
        assert_eq!(top.values, vec![vec![0.9, 0.5], vec![2.0, 2.0]]);
    }

    #[test]
    fn partial_selection_matches_full_sort() {
        // Deterministic pseudo-random row with repeated values and NaNs.
        let row: Vec<f32> = (0..4096_u32)
            .map(|i| match (i * 7919) % 97 {
                0 => f32::NAN,
                v => (v % 13) as f32 - 6.0,
            })
            .collect();
        let mut expected: Vec<usize> = (0..row.len()).collect();
        expected.sort_by(|&a, &b| rank(&row, a, b));

        for k in [1, 5, 64, 4096] {
            let (values, indices) = top_k_row(&row, k);
            let want: Vec<u32> = expected.iter().take(k).map(|&i| i as u32).collect();
            assert_eq!(indices, want, "k = {k}");
            assert_eq!(values.len(), k);
        }
    }

    #[test]
    fn wide_matrix_is_read_row_by_row() {
        let width = 131_072;
        let mut data = vec![0.0_f32; 2 * width];
        data[width - 1] = 3.0;
        data[17] = 2.0;
        data[width + 5] = 1.0;
        data[width + 9] = 1.0;
        let t = Tensor::from_vec(data, (2, width), &Device::Cpu).unwrap();
        let top = select_topk(&t, 3).unwrap();
        assert_eq!(top.indices[0], vec![(width - 1) as u32, 17, 0]);
        assert_eq!(top.values[0], vec![3.0, 2.0, 0.0]);
        assert_eq!(top.indices[1], vec![5, 9, 0]);
    }

    #[test]
    fn zero_positions() {
        let t = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        let top = select_topk(&t, 2).unwrap();
        assert_eq!(top.num_positions(), 0);
    }
}
