// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook points, per-pass hook specifications, and captured tensors.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what a single forward pass must capture, which
//! interventions it applies, and where it may stop), and [`HookCache`]
//! (tensors captured by that pass).
//!
//! Long-lived hook *registrations* belong to the
//! [`ModelRuntime`](crate::ModelRuntime); a `HookSpec` is the per-pass
//! snapshot the runtime hands to its [`ModelBackend`](crate::ModelBackend).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{Result, SaeError};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// Uses the `TransformerLens` naming convention, which is also the
/// `hook_name` convention found in SAE `cfg.json` files.
///
/// ```
/// use candle_sae_topk::HookPoint;
///
/// let hook: HookPoint = "blocks.20.hook_resid_post".parse().unwrap();
/// assert_eq!(hook, HookPoint::ResidPost(20));
/// assert_eq!(hook.layer(), Some(20));
/// assert_eq!(hook.to_string(), "blocks.20.hook_resid_post");
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`).
    Embed,
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Attention output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Per-head attention result in layer `i` (`blocks.{i}.attn.hook_z`).
    AttnZ(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP pre-activation in layer `i` (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation (per-neuron) in layer `i` (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After final layer norm (`ln_final.hook_normalized`).
    FinalNorm,
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// Block index this hook point belongs to, if it is a per-layer hook.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnOut(i)
            | Self::AttnZ(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::AttnZ(i) => write!(f, "blocks.{i}.attn.hook_z"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "ln_final.hook_normalized" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some((layer, suffix)) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
    {
        if let Ok(layer) = layer.parse::<usize>() {
            return match suffix {
                "hook_resid_pre" => HookPoint::ResidPre(layer),
                "hook_attn_out" => HookPoint::AttnOut(layer),
                "attn.hook_z" => HookPoint::AttnZ(layer),
                "hook_resid_mid" => HookPoint::ResidMid(layer),
                "mlp.hook_pre" => HookPoint::MlpPre(layer),
                "mlp.hook_post" => HookPoint::MlpPost(layer),
                "hook_mlp_out" => HookPoint::MlpOut(layer),
                "hook_resid_post" => HookPoint::ResidPost(layer),
                _ => HookPoint::Custom(s.to_string()),
            };
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention a registered hook applies to the activation flowing
/// through its [`HookPoint`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the tensor entirely with a provided value.
    Replace(Tensor),
    /// Add a (broadcastable) vector, e.g. a steering direction.
    Add(Tensor),
    /// Multiply by a constant factor.
    Scale(f64),
    /// Zero the tensor.
    Zero,
}

/// Apply a single [`Intervention`] to a tensor.
///
/// Backends call this at every hook point where
/// [`HookSpec::interventions_at`] yields something.
///
/// # Shapes
/// - `tensor`: any shape
/// - returns: same shape as `tensor`
///
/// # Errors
///
/// Returns [`SaeError::Model`] if the underlying tensor operation fails.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => Ok(replacement.clone()),
        Intervention::Add(delta) => Ok(tensor.broadcast_add(delta)?),
        Intervention::Scale(factor) => Ok((tensor * *factor)?),
        Intervention::Zero => Ok(tensor.zeros_like()?),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares what a single forward pass captures, which interventions it
/// applies, and how deep it runs.
///
/// ```
/// use candle_sae_topk::{HookPoint, HookSpec};
///
/// let mut spec = HookSpec::new();
/// spec.capture("blocks.5.hook_resid_post").stop_at_layer(6);
/// assert!(spec.is_captured(&HookPoint::ResidPost(5)));
/// assert_eq!(spec.stop_layer(), Some(6));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    interventions: Vec<(HookPoint, Intervention)>,
    /// Exclusive layer bound: only blocks `0..n` run when set.
    stop_at_layer: Option<usize>,
}

impl HookSpec {
    /// Create an empty specification: full depth, no captures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Stop the forward pass before block `layer`; blocks `0..layer` run.
    ///
    /// The output in the returned [`HookCache`] is then the residual
    /// stream at the stopping point instead of logits.
    pub fn stop_at_layer(&mut self, layer: usize) -> &mut Self {
        self.stop_at_layer = Some(layer);
        self
    }

    /// Exclusive layer bound, if the pass is truncated.
    #[must_use]
    pub const fn stop_layer(&self) -> Option<usize> {
        self.stop_at_layer
    }

    /// Whether block `layer` must be evaluated under this spec.
    #[must_use]
    pub fn runs_layer(&self, layer: usize) -> bool {
        self.stop_at_layer.map_or(true, |stop| layer < stop)
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of interventions.
    #[must_use]
    pub fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Whether this spec has no captures, no interventions, and runs the full depth.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty() && self.stop_at_layer.is_none()
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the pass output.
///
/// ```
/// use candle_sae_topk::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let output = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(output);
/// let resid = Tensor::ones((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(0), resid);
/// assert!(cache.require(&HookPoint::ResidPost(0)).is_ok());
/// assert!(cache.require(&HookPoint::ResidPost(1)).is_err());
/// ```
#[derive(Debug)]
pub struct HookCache {
    output: Tensor,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| SaeError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the pass has finished.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Iterate over every captured `(hook, tensor)` pair.
    pub fn captures(&self) -> impl Iterator<Item = (&HookPoint, &Tensor)> {
        self.captures.iter()
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
