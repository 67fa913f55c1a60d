// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sparse autoencoder encoder side: configuration, weights, and `encode`.
//!
//! # Directory layout
//!
//! An SAE directory holds:
//! - `cfg.json`: dimensions, architecture, hook name, BOS convention
//! - `sae_weights.safetensors`:
//!   - `W_enc`: `[d_in, d_sae]`
//!   - `b_enc`: `[d_sae]`
//!   - `b_dec`: `[d_in]`
//!   - `threshold`: `[d_sae]` (JumpReLU only)
//!
//! Decoder weights are never loaded; only the encoder is needed to read
//! feature activations.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use crate::error::{Result, SaeError};
use crate::hooks::HookPoint;

/// Name of the configuration file inside an SAE directory.
pub const CONFIG_FILE: &str = "cfg.json";

/// Name of the weights file inside an SAE directory.
pub const WEIGHTS_FILE: &str = "sae_weights.safetensors";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Encoder nonlinearity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaeArchitecture {
    /// `relu(x @ W_enc + b_enc)`.
    Standard,
    /// `relu(pre) * (pre > threshold)` with a learned per-feature threshold.
    JumpRelu,
}

impl fmt::Display for SaeArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::JumpRelu => write!(f, "jumprelu"),
        }
    }
}

/// Optional nested metadata block found in newer `cfg.json` files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaeMetadata {
    /// Hook the SAE was trained on.
    #[serde(default)]
    pub hook_name: Option<String>,
    /// Whether training prompts carried a leading BOS.
    #[serde(default)]
    pub prepend_bos: Option<bool>,
    /// Base model name.
    #[serde(default)]
    pub model_name: Option<String>,
}

/// Contents of an SAE `cfg.json`.
///
/// Both the flat layout (`hook_name`, `prepend_bos` at top level) and the
/// nested `metadata` layout are accepted; `metadata` wins when both exist.
///
/// ```
/// use candle_sae_topk::SaeConfig;
///
/// let cfg: SaeConfig = serde_json::from_str(r#"{
///     "architecture": "jumprelu", "d_in": 2304, "d_sae": 16384,
///     "metadata": {"hook_name": "blocks.20.hook_resid_post", "prepend_bos": true}
/// }"#).unwrap();
/// assert_eq!(cfg.hook_point().unwrap().layer(), Some(20));
/// assert!(cfg.prepend_bos());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SaeConfig {
    /// Architecture name (`standard`, `jumprelu`).
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Input (hidden) dimension.
    pub d_in: usize,
    /// Dictionary size.
    pub d_sae: usize,
    /// Hook the SAE was trained on (flat layout).
    #[serde(default)]
    pub hook_name: Option<String>,
    /// Whether `b_dec` is subtracted from the input before encoding.
    #[serde(default)]
    pub apply_b_dec_to_input: Option<bool>,
    /// Input normalization scheme; only `none` is supported.
    #[serde(default)]
    pub normalize_activations: Option<String>,
    /// BOS convention (flat layout).
    #[serde(default)]
    pub prepend_bos: Option<bool>,
    /// Base model name (flat layout).
    #[serde(default)]
    pub model_name: Option<String>,
    /// Nested metadata (newer layout).
    #[serde(default)]
    pub metadata: Option<SaeMetadata>,
}

fn default_architecture() -> String {
    "standard".to_string()
}

impl SaeConfig {
    /// Parse a `cfg.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Io`] if the file cannot be read and
    /// [`SaeError::Configuration`] if it is not a valid SAE config.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            SaeError::Configuration(format!("parse {}: {e}", path.display()))
        })
    }

    /// Resolved architecture.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] for unsupported architectures.
    pub fn architecture(&self) -> Result<SaeArchitecture> {
        match self.architecture.as_str() {
            "standard" => Ok(SaeArchitecture::Standard),
            "jumprelu" => Ok(SaeArchitecture::JumpRelu),
            other => Err(SaeError::Configuration(format!(
                "unsupported SAE architecture `{other}`"
            ))),
        }
    }

    /// Hook point the SAE reads from.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] if no hook name is present.
    pub fn hook_point(&self) -> Result<HookPoint> {
        self.metadata
            .as_ref()
            .and_then(|m| m.hook_name.as_deref())
            .or(self.hook_name.as_deref())
            .map(HookPoint::from)
            .ok_or_else(|| SaeError::Configuration("SAE config has no hook_name".into()))
    }

    /// BOS convention the SAE was trained with (defaults to `true`).
    #[must_use]
    pub fn prepend_bos(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.prepend_bos)
            .or(self.prepend_bos)
            .unwrap_or(true)
    }

    /// Whether `b_dec` is subtracted before encoding.
    ///
    /// Defaults to `true` for standard SAEs and `false` for JumpReLU.
    #[must_use]
    pub fn applies_b_dec(&self) -> bool {
        self.apply_b_dec_to_input
            .unwrap_or(self.architecture == "standard")
    }

    fn check_normalization(&self) -> Result<()> {
        match self.normalize_activations.as_deref() {
            None | Some("none") => Ok(()),
            Some(other) => Err(SaeError::Configuration(format!(
                "unsupported normalize_activations `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SaeEncoder
// ---------------------------------------------------------------------------

/// Encoder weights of a sparse autoencoder, resident on one device.
///
/// All weights are held in F32; inputs are converted before encoding.
pub struct SaeEncoder {
    architecture: SaeArchitecture,
    w_enc: Tensor,
    b_enc: Tensor,
    b_dec: Option<Tensor>,
    threshold: Option<Tensor>,
}

impl SaeEncoder {
    /// Build an encoder from weight tensors.
    ///
    /// `b_dec` is subtracted from inputs when present. `threshold` is
    /// required for [`SaeArchitecture::JumpRelu`] and ignored otherwise.
    ///
    /// # Shapes
    /// - `w_enc`: `[d_in, d_sae]`
    /// - `b_enc`, `threshold`: `[d_sae]`
    /// - `b_dec`: `[d_in]`
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] on inconsistent shapes or a
    /// missing JumpReLU threshold.
    pub fn new(
        architecture: SaeArchitecture,
        w_enc: Tensor,
        b_enc: Tensor,
        b_dec: Option<Tensor>,
        threshold: Option<Tensor>,
    ) -> Result<Self> {
        let (d_in, d_sae) = w_enc.dims2()?;
        check_len("b_enc", &b_enc, d_sae)?;
        if let Some(b_dec) = &b_dec {
            check_len("b_dec", b_dec, d_in)?;
        }
        let threshold = match architecture {
            SaeArchitecture::JumpRelu => {
                let threshold = threshold.ok_or_else(|| {
                    SaeError::Configuration("jumprelu SAE requires a threshold tensor".into())
                })?;
                check_len("threshold", &threshold, d_sae)?;
                Some(threshold.to_dtype(DType::F32)?)
            }
            SaeArchitecture::Standard => None,
        };

        Ok(Self {
            architecture,
            w_enc: w_enc.to_dtype(DType::F32)?,
            b_enc: b_enc.to_dtype(DType::F32)?,
            b_dec: b_dec.map(|t| t.to_dtype(DType::F32)).transpose()?,
            threshold,
        })
    }

    /// Load `cfg.json` and `sae_weights.safetensors` from a directory.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] for unsupported configs,
    /// [`SaeError::Io`] for unreadable files, and [`SaeError::Model`] if
    /// a weight is missing or has the wrong shape.
    pub fn load(dir: &Path, device: &Device) -> Result<(SaeConfig, Self)> {
        let config = SaeConfig::from_file(&dir.join(CONFIG_FILE))?;
        config.check_normalization()?;
        let architecture = config.architecture()?;

        let vb = create_var_builder(&[dir.join(WEIGHTS_FILE)], DType::F32, device)?;
        let w_enc = vb.get((config.d_in, config.d_sae), "W_enc")?;
        let b_enc = vb.get(config.d_sae, "b_enc")?;
        let b_dec = if config.applies_b_dec() {
            Some(vb.get(config.d_in, "b_dec")?)
        } else {
            None
        };
        let threshold = if architecture == SaeArchitecture::JumpRelu {
            Some(vb.get(config.d_sae, "threshold")?)
        } else {
            None
        };

        tracing::info!(
            dir = %dir.display(),
            %architecture,
            d_in = config.d_in,
            d_sae = config.d_sae,
            "loaded SAE encoder"
        );

        let encoder = Self::new(architecture, w_enc, b_enc, b_dec, threshold)?;
        Ok((config, encoder))
    }

    /// Encoder nonlinearity.
    #[must_use]
    pub const fn architecture(&self) -> SaeArchitecture {
        self.architecture
    }

    /// Input dimension.
    #[must_use]
    pub fn d_in(&self) -> usize {
        self.w_enc.dims().first().copied().unwrap_or(0)
    }

    /// Dictionary size.
    #[must_use]
    pub fn d_sae(&self) -> usize {
        self.w_enc.dims().get(1).copied().unwrap_or(0)
    }

    /// Project dense activations into feature space.
    ///
    /// # Shapes
    /// - `x`: `[positions, d_in]`
    /// - returns: `[positions, d_sae]` (F32)
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Model`] on shape mismatch.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?.contiguous()?;
        let x = match &self.b_dec {
            Some(b_dec) => x.broadcast_sub(b_dec)?,
            None => x,
        };
        let pre = x.matmul(&self.w_enc)?.broadcast_add(&self.b_enc)?;

        match (&self.architecture, &self.threshold) {
            (SaeArchitecture::JumpRelu, Some(threshold)) => {
                let gate = pre.broadcast_gt(threshold)?.to_dtype(DType::F32)?;
                Ok((pre.relu()? * gate)?)
            }
            _ => Ok(pre.relu()?),
        }
    }
}

impl fmt::Debug for SaeEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaeEncoder")
            .field("architecture", &self.architecture)
            .field("d_in", &self.d_in())
            .field("d_sae", &self.d_sae())
            .field("applies_b_dec", &self.b_dec.is_some())
            .finish()
    }
}

fn check_len(name: &str, tensor: &Tensor, expected: usize) -> Result<()> {
    if tensor.dims() == [expected] {
        Ok(())
    } else {
        Err(SaeError::Configuration(format!(
            "{name} has shape {:?}, expected [{expected}]",
            tensor.dims()
        )))
    }
}

// ---------------------------------------------------------------------------
// Weight loading
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Buffered (safe) loading by default; memory-mapped with the `mmap`
/// feature.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Read a single safetensors file fully into RAM.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    let [path] = paths else {
        return Err(SaeError::Configuration(
            "buffered loading expects exactly one safetensors file; enable `mmap` for shards"
                .into(),
        ));
    };
    let data = std::fs::read(path)?;
    Ok(candle_nn::VarBuilder::from_buffered_safetensors(
        data, dtype, device,
    )?)
}

/// Memory-map safetensors files.
///
/// # Safety
///
/// The files must not be modified while the encoder is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
