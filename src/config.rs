// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inference configuration.
//!
//! [`InferenceConfig`] carries the knobs that shape every extraction
//! request: the token limit, whether forward passes may stop early, whether
//! the runtime's context store is cleared after every request, and the
//! device the runtime lives on.
//!
//! # Usage
//!
//! ```
//! use candle_sae_topk::InferenceConfig;
//!
//! let json: serde_json::Value = serde_json::from_str(
//!     r#"{"token_limit": 512, "optimize_memory": true}"#,
//! ).unwrap();
//! let config = InferenceConfig::from_json(&json).unwrap();
//! assert_eq!(config.token_limit, 512);
//! assert!(config.optimize_memory);
//! assert!(!config.auto_clear_cache);
//! ```

use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde_json::Value;

use crate::error::{Result, SaeError};

/// Default maximum number of tokens per prompt (BOS included).
pub const DEFAULT_TOKEN_LIMIT: usize = 200;

/// Environment variable names read by [`InferenceConfig::from_env`].
pub mod env {
    /// Maximum tokens per prompt.
    pub const TOKEN_LIMIT: &str = "TOKEN_LIMIT";
    /// Enable early-stopped forward passes.
    pub const OPTIMIZE_MEMORY: &str = "OPTIMIZE_MEMORY";
    /// Reclaim device memory after every request.
    pub const AUTO_CLEAR_CACHE: &str = "AUTO_CLEAR_CACHE";
    /// Device spec (`cpu`, `cuda`, `cuda:1`, `metal`).
    pub const DEVICE: &str = "DEVICE";
}

// ---------------------------------------------------------------------------
// DeviceSpec
// ---------------------------------------------------------------------------

/// Where the runtime and dictionaries live.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Cuda(usize),
    /// Metal device by ordinal.
    Metal(usize),
}

impl DeviceSpec {
    /// Create the candle device.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Model`] if the device is unavailable or candle
    /// was built without the matching backend feature.
    pub fn to_device(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
            Self::Metal(ordinal) => Ok(Device::new_metal(ordinal)?),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = SaeError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    SaeError::Configuration(format!("invalid device ordinal in `{s}`"))
                })?;
                (kind, ordinal)
            }
            None => (lower.as_str(), 0),
        };
        match kind {
            "cpu" if ordinal == 0 => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => Err(SaeError::Configuration(format!("unknown device `{s}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// InferenceConfig
// ---------------------------------------------------------------------------

/// Extraction-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Maximum prompt length in tokens, BOS included.
    pub token_limit: usize,
    /// Stop forward passes right after the dictionary's layer when the
    /// layer can be read from the source identifier.
    pub optimize_memory: bool,
    /// Clear retained captures and reclaim device memory after every
    /// request, regardless of the request's own `clear_cache`.
    pub auto_clear_cache: bool,
    /// Device for the runtime and dictionaries.
    pub device: DeviceSpec,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            token_limit: DEFAULT_TOKEN_LIMIT,
            optimize_memory: false,
            auto_clear_cache: false,
            device: DeviceSpec::Cpu,
        }
    }
}

impl InferenceConfig {
    /// Read settings from the process environment.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] if a variable is set but
    /// malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] on malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(env::TOKEN_LIMIT) {
            config.token_limit = parse_token_limit(&raw)?;
        }
        if let Some(raw) = lookup(env::OPTIMIZE_MEMORY) {
            config.optimize_memory = parse_flag(env::OPTIMIZE_MEMORY, &raw)?;
        }
        if let Some(raw) = lookup(env::AUTO_CLEAR_CACHE) {
            config.auto_clear_cache = parse_flag(env::AUTO_CLEAR_CACHE, &raw)?;
        }
        if let Some(raw) = lookup(env::DEVICE) {
            config.device = raw.parse()?;
        }
        Ok(config)
    }

    /// Parse settings from a JSON object; absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] if `token_limit` is zero or
    /// `device` is not a valid device spec.
    pub fn from_json(config: &Value) -> Result<Self> {
        let defaults = Self::default();
        let token_limit = get_usize_or(config, "token_limit", defaults.token_limit);
        if token_limit == 0 {
            return Err(SaeError::Configuration(
                "token_limit must be at least 1".into(),
            ));
        }
        let device = match get_optional_str(config, "device") {
            Some(spec) => spec.parse()?,
            None => defaults.device,
        };
        Ok(Self {
            token_limit,
            optimize_memory: get_bool_or(config, "optimize_memory", defaults.optimize_memory),
            auto_clear_cache: get_bool_or(config, "auto_clear_cache", defaults.auto_clear_cache),
            device,
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_token_limit(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(SaeError::Configuration(format!(
            "{} must be a positive integer, got `{raw}`",
            env::TOKEN_LIMIT
        ))),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(SaeError::Configuration(format!(
            "{key} must be a boolean, got `{raw}`"
        ))),
    }
}

/// Extract a `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_optional_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
