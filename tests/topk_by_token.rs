// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end extraction over a mock runtime: BOS and mask rules, error
//! classes, early stopping, and cleanup under concurrency, failure, panic,
//! and caller cancellation.
//!
//! Run:
//!   `cargo test --test topk_by_token`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use candle_sae_topk::{
    DictionaryRegistry, FeatureExtractor, HookPoint, InferenceConfig, Intervention, SaeError,
    TopkByTokenRequest, TopkByTokenResponse,
};

use common::{extractor, runtime, Probe};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn features(resp: &TopkByTokenResponse, row: usize) -> Vec<(u32, f32)> {
    resp.results[row]
        .top_features
        .iter()
        .map(|f| (f.feature_index, f.activation_value))
        .collect()
}

/// Structural guarantees every successful response must satisfy.
fn assert_well_formed(resp: &TopkByTokenResponse, top_k: usize) {
    assert_eq!(resp.tokens.len(), resp.results.len());
    for pair in resp.results.windows(2) {
        assert!(pair[0].token_position < pair[1].token_position);
    }
    for (token, result) in resp.tokens.iter().zip(&resp.results) {
        assert_eq!(token, &result.token);
        assert!(result.top_features.len() <= top_k);
        for pair in result.top_features.windows(2) {
            assert!(pair[0].activation_value >= pair[1].activation_value);
        }
        let unique: HashSet<u32> = result.top_features.iter().map(|f| f.feature_index).collect();
        assert_eq!(unique.len(), result.top_features.len());
    }
}

// ---------------------------------------------------------------------------
// Pipeline semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn neuron_basis_with_bos() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("ab", "1-res-neurons").with_top_k(2);
    let resp = ex.topk_by_token(req).await.unwrap();

    assert_eq!(resp.tokens, vec!["<bos>", "a", "b"]);
    assert_well_formed(&resp, 2);
    // BOS residual [1, 2, 1]: the tie at 1.0 goes to feature 0.
    assert_eq!(features(&resp, 0), vec![(1, 2.0), (0, 1.0)]);
    assert_eq!(features(&resp, 1), vec![(0, 97.0), (1, 2.0)]);
    assert_eq!(resp.results[2].token_position, 2);
}

#[tokio::test]
async fn sae_features() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("a", "1-res-sae").with_top_k(2);
    let resp = ex.topk_by_token(req).await.unwrap();

    // 'a' -> [97, 2, 1] -> features [97, 2, 1, 95]
    assert_eq!(features(&resp, 1), vec![(0, 97.0), (3, 95.0)]);
    // BOS -> [1, 2, 1] -> features [1, 2, 1, 0]
    assert_eq!(features(&resp, 0), vec![(1, 2.0), (0, 1.0)]);
}

#[tokio::test]
async fn default_top_k_is_clamped_to_feature_count() {
    let (ex, _) = extractor(InferenceConfig::default());
    let resp = ex
        .topk_by_token(TopkByTokenRequest::new("xy", "2-res-nobos"))
        .await
        .unwrap();
    assert_well_formed(&resp, 5);
    assert!(resp.results.iter().all(|r| r.top_features.len() == 3));
}

#[tokio::test]
async fn ignore_bos_drops_first_position() {
    let (ex, _) = extractor(InferenceConfig::default());

    let full = ex
        .topk_by_token(TopkByTokenRequest::new("abcd", "1-res-neurons"))
        .await
        .unwrap();
    assert_eq!(full.tokens.len(), 5);
    assert_eq!(full.tokens[0], "<bos>");

    let req = TopkByTokenRequest::new("abcd", "1-res-neurons").with_ignore_bos(true);
    let resp = ex.topk_by_token(req).await.unwrap();
    assert_eq!(resp.tokens, vec!["a", "b", "c", "d"]);
    let positions: Vec<usize> = resp.results.iter().map(|r| r.token_position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert_eq!(resp.results[0].top_features, full.results[1].top_features);
}

#[tokio::test]
async fn ignore_bos_is_noop_without_bos() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("abc", "2-res-nobos").with_ignore_bos(true);
    let resp = ex.topk_by_token(req).await.unwrap();
    assert_eq!(resp.tokens, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn mask_excludes_without_renumbering() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("abc", "2-res-nobos").with_token_mask(vec![1, 0, 1]);
    let resp = ex.topk_by_token(req).await.unwrap();

    assert_eq!(resp.results.len(), 2);
    assert_eq!(resp.tokens, vec!["a", "c"]);
    assert_eq!(resp.results[0].token_position, 0);
    assert_eq!(resp.results[1].token_position, 2);
    assert_well_formed(&resp, 5);
}

#[tokio::test]
async fn mask_shifts_with_bos() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("abc", "1-res-neurons")
        .with_ignore_bos(true)
        .with_token_mask(vec![1, 1, 0, 1]);
    let resp = ex.topk_by_token(req).await.unwrap();
    assert_eq!(resp.tokens, vec!["a", "c"]);
    let positions: Vec<usize> = resp.results.iter().map(|r| r.token_position).collect();
    assert_eq!(positions, vec![0, 2]);
}

#[tokio::test]
async fn mask_length_mismatch_reports_both_lengths() {
    let (ex, probe) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("abc", "2-res-nobos")
        .with_token_mask(vec![1, 1])
        .with_clear_cache(true);
    let err = ex.topk_by_token(req).await.unwrap_err();

    assert!(matches!(
        err,
        SaeError::MaskLength {
            mask_len: 2,
            token_count: 3
        }
    ));
    assert_eq!(
        err.to_string(),
        "Token mask length (2) does not match token count (3)"
    );
    assert!(err.is_client_error());
    assert_eq!(probe.calls(), 1);
    assert!(ex.probe().await.is_clean());
}

#[tokio::test]
async fn repeated_requests_are_identical() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("hello", "1-res-sae")
        .with_top_k(3)
        .with_clear_cache(true);
    let first = ex.topk_by_token(req.clone()).await.unwrap();
    let second = ex.topk_by_token(req).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn sae_loaded_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let dev = Device::Cpu;
    std::fs::write(
        dir.path().join("cfg.json"),
        r#"{"architecture": "jumprelu", "d_in": 3, "d_sae": 2,
            "metadata": {"hook_name": "blocks.0.hook_resid_post", "prepend_bos": false}}"#,
    )
    .unwrap();
    let mut weights = std::collections::HashMap::new();
    weights.insert(
        "W_enc".to_string(),
        Tensor::new(&[[1.0_f32, 0.0], [0.0, 1.0], [0.0, 0.0]], &dev).unwrap(),
    );
    weights.insert("b_enc".to_string(), Tensor::zeros(2, DType::F32, &dev).unwrap());
    weights.insert("b_dec".to_string(), Tensor::zeros(3, DType::F32, &dev).unwrap());
    weights.insert(
        "threshold".to_string(),
        Tensor::new(&[100.0_f32, 0.5], &dev).unwrap(),
    );
    candle_core::safetensors::save(&weights, dir.path().join("sae_weights.safetensors")).unwrap();

    let mut reg = DictionaryRegistry::new();
    reg.load_dir("0-jumprelu", dir.path(), &dev).unwrap();
    let probe = std::sync::Arc::new(Probe::default());
    let ex = FeatureExtractor::new(runtime(&probe), reg, InferenceConfig::default());

    let resp = ex
        .topk_by_token(TopkByTokenRequest::new("a", "0-jumprelu").with_top_k(2))
        .await
        .unwrap();
    // No BOS; 'a' -> [97, 1, 1]; feature 0 is gated off by its threshold.
    assert_eq!(resp.tokens, vec!["a"]);
    assert_eq!(features(&resp, 0), vec![(1, 1.0), (0, 0.0)]);
}

#[tokio::test]
async fn permanent_hooks_apply_and_survive() {
    let (ex, _) = extractor(InferenceConfig::default());
    ex.gate()
        .run(false, |rt| {
            rt.add_perma_hook(HookPoint::ResidPost(1), Intervention::Scale(2.0));
            Ok(())
        })
        .await
        .unwrap();

    let req = TopkByTokenRequest::new("a", "1-res-neurons")
        .with_top_k(1)
        .with_clear_cache(true);
    let resp = ex.topk_by_token(req).await.unwrap();
    assert_eq!(features(&resp, 1), vec![(0, 194.0)]);

    let probe = ex.probe().await;
    assert_eq!(probe.permanent_hooks, 1);
    assert!(probe.is_clean());
}

#[test]
fn blocking_entry_point() {
    let (ex, _) = extractor(InferenceConfig::default());
    let req = TopkByTokenRequest::new("ab", "2-res-nobos").with_clear_cache(true);
    let resp = ex.topk_by_token_blocking(&req).unwrap();
    assert_eq!(resp.tokens, vec!["a", "b"]);
    assert!(ex.gate().acquire_blocking(false).probe().is_clean());
}

// ---------------------------------------------------------------------------
// Request errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn token_limit_counts_bos_and_rejects_before_forward() {
    let config = InferenceConfig {
        token_limit: 4,
        ..InferenceConfig::default()
    };
    let (ex, probe) = extractor(config);

    // "abc" + BOS = 4 tokens: allowed.
    ex.topk_by_token(TopkByTokenRequest::new("abc", "1-res-neurons"))
        .await
        .unwrap();
    assert_eq!(probe.calls(), 1);

    let err = ex
        .topk_by_token(TopkByTokenRequest::new("hello", "1-res-neurons"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SaeError::InputTooLarge {
            tokens: 6,
            limit: 4
        }
    ));
    assert_eq!(err.to_string(), "Text too long: 6 tokens, max is 4");
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn unknown_source_is_a_configuration_error() {
    let (ex, probe) = extractor(InferenceConfig::default());
    let err = ex
        .topk_by_token(TopkByTokenRequest::new("abc", "9-missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, SaeError::Configuration(ref m) if m.contains("9-missing")));
    assert!(!err.is_client_error());
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn zero_top_k_is_rejected() {
    let (ex, probe) = extractor(InferenceConfig::default());
    let err = ex
        .topk_by_token(TopkByTokenRequest::new("abc", "2-res-nobos").with_top_k(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SaeError::InvalidRequest(_)));
    assert_eq!(probe.calls(), 0);
}

// ---------------------------------------------------------------------------
// Early stopping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn optimize_memory_stops_after_source_layer() {
    let config = InferenceConfig {
        optimize_memory: true,
        ..InferenceConfig::default()
    };
    let (ex, probe) = extractor(config);

    let sized = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons"))
        .await
        .unwrap();
    assert_eq!(probe.last_stop(), Some(2));
    assert_eq!(probe.last_layers_run(), 2);

    // No layer in the name: silent fallback to a full pass, same features.
    let fallback = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "res-unnumbered"))
        .await
        .unwrap();
    assert_eq!(probe.last_stop(), None);
    assert_eq!(probe.last_layers_run(), common::NUM_LAYERS);
    assert_eq!(sized, fallback);
}

#[tokio::test]
async fn full_pass_without_optimize_memory() {
    let (ex, probe) = extractor(InferenceConfig::default());
    ex.topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons"))
        .await
        .unwrap();
    assert_eq!(probe.last_stop(), None);
    assert_eq!(probe.last_layers_run(), common::NUM_LAYERS);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn captures_are_released_without_clear_cache() {
    let (ex, _) = extractor(InferenceConfig::default());
    ex.topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons"))
        .await
        .unwrap();
    assert!(ex.probe().await.is_clean());

    ex.topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons").with_clear_cache(true))
        .await
        .unwrap();
    assert!(ex.probe().await.is_clean());
}

#[tokio::test]
async fn auto_clear_cache_cleans_every_request() {
    let config = InferenceConfig {
        auto_clear_cache: true,
        ..InferenceConfig::default()
    };
    let (ex, _) = extractor(config);
    ex.topk_by_token(TopkByTokenRequest::new("ab", "1-res-sae"))
        .await
        .unwrap();
    assert!(ex.probe().await.is_clean());
}

#[tokio::test]
async fn runtime_failure_still_cleans_up() {
    let (ex, probe) = extractor(InferenceConfig::default());
    probe.fail.store(true, Ordering::SeqCst);

    let err = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons").with_clear_cache(true))
        .await
        .unwrap_err();
    assert!(matches!(err, SaeError::Model(_)));
    assert!(err.to_string().contains("out of memory"));
    assert!(ex.probe().await.is_clean());

    // Without clear_cache the failed pass's capture hook is still removed.
    let _ = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons"))
        .await
        .unwrap_err();
    assert!(ex.probe().await.is_clean());

    probe.fail.store(false, Ordering::SeqCst);
    ex.topk_by_token(TopkByTokenRequest::new("ab", "1-res-neurons"))
        .await
        .unwrap();
}

#[tokio::test]
async fn panic_in_forward_still_cleans_up() {
    let (ex, probe) = extractor(InferenceConfig::default());
    probe.panic.store(true, Ordering::SeqCst);

    let err = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "1-res-sae").with_clear_cache(true))
        .await
        .unwrap_err();
    assert!(matches!(err, SaeError::Runtime(_)));
    assert!(ex.probe().await.is_clean());
    assert_eq!(probe.in_flight.load(Ordering::SeqCst), 0);

    probe.panic.store(false, Ordering::SeqCst);
    let resp = ex
        .topk_by_token(TopkByTokenRequest::new("ab", "1-res-sae"))
        .await
        .unwrap();
    assert_eq!(resp.tokens.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_serialized() {
    let (ex, probe) = extractor(InferenceConfig::default());
    probe.delay_ms.store(10, Ordering::SeqCst);

    let handles: Vec<_> = (0..8_u8)
        .map(|i| {
            let ex = std::sync::Arc::clone(&ex);
            tokio::spawn(async move {
                let prompt = char::from(b'a' + i).to_string().repeat(usize::from(i) + 1);
                let req = TopkByTokenRequest::new(prompt, "1-res-sae").with_top_k(4);
                ex.topk_by_token(req).await
            })
        })
        .collect();

    for (i, handle) in (0..8_u8).zip(handles) {
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.tokens.len(), usize::from(i) + 2);
        // BOS (id 1) at block 1 encodes to [1, 2, 1, 0] after ReLU.
        assert_eq!(
            features(&resp, 0),
            vec![(1, 2.0), (0, 1.0), (2, 1.0), (3, 0.0)]
        );
        // Byte t encodes to [t, 2, 1, t - 2].
        let t = f32::from(b'a' + i);
        for row in 1..resp.results.len() {
            assert_eq!(resp.tokens[row], char::from(b'a' + i).to_string());
            assert_eq!(
                features(&resp, row),
                vec![(0, t), (3, t - 2.0), (1, 2.0), (2, 1.0)]
            );
        }
    }
    assert_eq!(probe.calls(), 8);
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    // Default flags: nothing from any of the eight requests is left behind.
    assert!(ex.probe().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_caller_does_not_skip_cleanup() {
    let (ex, probe) = extractor(InferenceConfig::default());
    probe.delay_ms.store(150, Ordering::SeqCst);

    let task = {
        let ex = std::sync::Arc::clone(&ex);
        tokio::spawn(async move {
            let req = TopkByTokenRequest::new("abc", "1-res-neurons").with_clear_cache(true);
            ex.topk_by_token(req).await
        })
    };
    while probe.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // The probe queues behind the running body and sees its cleanup.
    let state = ex.probe().await;
    assert_eq!(probe.finished.load(Ordering::SeqCst), 1);
    assert!(state.is_clean());
}
