// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock runtime shared by the integration tests.
//!
//! `ToyBackend` has 4 blocks and a hidden size of 3. For a token id `t`,
//! the residual stream after block `l` is `[t, l + 1, 1]`, so neuron-basis
//! rankings are known in advance.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use candle_sae_topk::{
    DictionaryRegistry, FeatureExtractor, HookCache, HookPoint, HookSpec, InferenceConfig,
    ModelBackend, ModelRuntime, PromptTokenizer, Result, SaeArchitecture, SaeEncoder, SaeError,
};

pub const BOS_ID: u32 = 1;
pub const NUM_LAYERS: usize = 4;
pub const HIDDEN: usize = 3;

/// Shared observation and fault-injection state.
#[derive(Default)]
pub struct Probe {
    pub calls: AtomicUsize,
    pub finished: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    pub delay_ms: AtomicUsize,
    pub stops: Mutex<Vec<Option<usize>>>,
    pub layers_run: Mutex<Vec<usize>>,
}

impl Probe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_stop(&self) -> Option<usize> {
        self.stops.lock().unwrap().last().copied().flatten()
    }

    pub fn last_layers_run(&self) -> usize {
        self.layers_run.lock().unwrap().last().copied().unwrap()
    }
}

pub struct ToyBackend {
    pub probe: Arc<Probe>,
}

struct InFlight<'a>(&'a Probe);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ModelBackend for ToyBackend {
    fn num_layers(&self) -> usize {
        NUM_LAYERS
    }

    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let probe = &self.probe;
        probe.calls.fetch_add(1, Ordering::SeqCst);
        let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(probe);
        probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        probe.stops.lock().unwrap().push(hooks.stop_layer());

        let delay = probe.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }
        if probe.fail.load(Ordering::SeqCst) {
            return Err(SaeError::Model(candle_core::Error::Msg(
                "CUDA out of memory".into(),
            )));
        }
        if probe.panic.load(Ordering::SeqCst) {
            panic!("backend panicked");
        }

        let ids: Vec<u32> = input_ids.squeeze(0)?.to_vec1()?;
        let seq = ids.len();
        let mut cache = HookCache::new(Tensor::zeros((1, seq, HIDDEN), DType::F32, input_ids.device())?);
        let mut ran = 0;
        for layer in 0..NUM_LAYERS {
            if !hooks.runs_layer(layer) {
                break;
            }
            ran += 1;
            let rows: Vec<f32> = ids
                .iter()
                .flat_map(|&t| [t as f32, (layer + 1) as f32, 1.0])
                .collect();
            let mut hidden = Tensor::from_vec(rows, (1, seq, HIDDEN), input_ids.device())?;
            let point = HookPoint::ResidPost(layer);
            for intervention in hooks.interventions_at(&point) {
                hidden = candle_sae_topk::hooks::apply_intervention(&hidden, intervention)?;
            }
            if hooks.is_captured(&point) {
                cache.store(point, hidden.clone());
            }
            cache.set_output(hidden);
        }
        probe.layers_run.lock().unwrap().push(ran);
        probe.finished.fetch_add(1, Ordering::SeqCst);
        Ok(cache)
    }
}

/// One token per byte; id 1 is BOS.
pub struct ByteTokenizer {
    pub prepends_bos: bool,
}

impl PromptTokenizer for ByteTokenizer {
    fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|&id| {
                if id == BOS_ID {
                    "<bos>".to_string()
                } else {
                    char::from_u32(id).unwrap().to_string()
                }
            })
            .collect())
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(BOS_ID)
    }

    fn prepends_bos(&self) -> bool {
        self.prepends_bos
    }
}

pub fn runtime(probe: &Arc<Probe>) -> ModelRuntime {
    ModelRuntime::new(
        Box::new(ToyBackend {
            probe: Arc::clone(probe),
        }),
        Box::new(ByteTokenizer {
            prepends_bos: false,
        }),
        Device::Cpu,
    )
}

/// SAE over the toy residual: features `[x0, x1, x2, x0 - x1]`.
pub fn toy_sae() -> SaeEncoder {
    let dev = Device::Cpu;
    let w_enc = Tensor::new(
        &[
            [1.0_f32, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, -1.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
        &dev,
    )
    .unwrap();
    let b_enc = Tensor::zeros(4, DType::F32, &dev).unwrap();
    SaeEncoder::new(SaeArchitecture::Standard, w_enc, b_enc, None, None).unwrap()
}

/// Registry with:
/// - `1-res-neurons`: neurons at block 1, BOS prepended
/// - `1-res-sae`: [`toy_sae`] at block 1, BOS prepended
/// - `2-res-nobos`: neurons at block 2, no BOS
/// - `res-unnumbered`: neurons at block 1, no layer in the name
pub fn registry() -> DictionaryRegistry {
    let mut reg = DictionaryRegistry::new();
    reg.register_neurons("1-res-neurons", HookPoint::ResidPost(1), true);
    reg.register_sae("1-res-sae", toy_sae(), HookPoint::ResidPost(1), true);
    reg.register_neurons("2-res-nobos", HookPoint::ResidPost(2), false);
    reg.register_neurons("res-unnumbered", HookPoint::ResidPost(1), true);
    reg
}

pub fn extractor(config: InferenceConfig) -> (Arc<FeatureExtractor>, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let extractor = FeatureExtractor::new(runtime(&probe), registry(), config);
    (Arc::new(extractor), probe)
}
