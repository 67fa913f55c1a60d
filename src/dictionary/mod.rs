// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature dictionaries and their registry.
//!
//! A dictionary maps a hook point's dense activations into a feature
//! space. Two kinds exist:
//!
//! - **Neurons**: the identity map; features are the hook's own dimensions.
//! - **SAE**: a sparse autoencoder's encoder ([`SaeEncoder`]).
//!
//! [`DictionaryRegistry`] resolves request `source` identifiers (such as
//! `"20-gemmascope-res-16k"`) to loaded dictionaries.

pub mod sae;

use std::collections::HashMap;
use std::path::Path;

use candle_core::Device;

use crate::error::{Result, SaeError};
use crate::hooks::HookPoint;

pub use sae::{SaeArchitecture, SaeConfig, SaeEncoder, SaeMetadata};

/// How a dictionary turns captured activations into features.
#[derive(Debug)]
pub enum DictionaryKind {
    /// Identity map over the hook's last dimension.
    Neurons,
    /// Sparse autoencoder encoder.
    Sae(SaeEncoder),
}

/// A registered dictionary.
#[derive(Debug)]
pub struct DictionaryEntry {
    source: String,
    hook: HookPoint,
    kind: DictionaryKind,
    prepend_bos: bool,
}

impl DictionaryEntry {
    /// Source identifier this entry is registered under.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hook point the dictionary reads from.
    #[must_use]
    pub const fn hook(&self) -> &HookPoint {
        &self.hook
    }

    /// Dictionary kind.
    #[must_use]
    pub const fn kind(&self) -> &DictionaryKind {
        &self.kind
    }

    /// Whether prompts for this dictionary get a leading BOS.
    #[must_use]
    pub const fn prepend_bos(&self) -> bool {
        self.prepend_bos
    }

    /// Short name of the kind, for logs.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            DictionaryKind::Neurons => "neurons",
            DictionaryKind::Sae(_) => "sae",
        }
    }
}

/// Source identifier to dictionary map.
#[derive(Debug, Default)]
pub struct DictionaryRegistry {
    entries: HashMap<String, DictionaryEntry>,
}

impl DictionaryRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an SAE encoder under `source`, replacing any previous entry.
    pub fn register_sae(
        &mut self,
        source: impl Into<String>,
        encoder: SaeEncoder,
        hook: impl Into<HookPoint>,
        prepend_bos: bool,
    ) {
        self.insert(source.into(), hook.into(), DictionaryKind::Sae(encoder), prepend_bos);
    }

    /// Register the neuron basis of `hook` under `source`.
    pub fn register_neurons(
        &mut self,
        source: impl Into<String>,
        hook: impl Into<HookPoint>,
        prepend_bos: bool,
    ) {
        self.insert(source.into(), hook.into(), DictionaryKind::Neurons, prepend_bos);
    }

    /// Load an SAE directory (`cfg.json` + `sae_weights.safetensors`) and
    /// register it under `source`.
    ///
    /// # Errors
    ///
    /// Propagates [`SaeEncoder::load`] errors and returns
    /// [`SaeError::Configuration`] if the config names no hook.
    pub fn load_dir(
        &mut self,
        source: impl Into<String>,
        dir: &Path,
        device: &Device,
    ) -> Result<()> {
        let (config, encoder) = SaeEncoder::load(dir, device)?;
        let hook = config.hook_point()?;
        self.insert(
            source.into(),
            hook,
            DictionaryKind::Sae(encoder),
            config.prepend_bos(),
        );
        Ok(())
    }

    /// Download an SAE directory from the `HuggingFace` Hub and register it.
    ///
    /// `subfolder` is the directory inside `repo` holding `cfg.json` and
    /// `sae_weights.safetensors` (empty for the repository root).
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] if the download fails, and
    /// otherwise the same errors as [`load_dir`](Self::load_dir).
    #[cfg(feature = "hub")]
    pub fn load_from_hub(
        &mut self,
        source: impl Into<String>,
        repo: &str,
        subfolder: &str,
        device: &Device,
    ) -> Result<()> {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| SaeError::Configuration(format!("hub client: {e}")))?;
        let repo_handle = api.model(repo.to_string());
        let prefix = subfolder.trim_matches('/');
        let fetch = |file: &str| {
            let remote = if prefix.is_empty() {
                file.to_string()
            } else {
                format!("{prefix}/{file}")
            };
            repo_handle
                .get(&remote)
                .map_err(|e| SaeError::Configuration(format!("download {repo}/{remote}: {e}")))
        };

        let config_path = fetch(sae::CONFIG_FILE)?;
        fetch(sae::WEIGHTS_FILE)?;
        let dir = config_path.parent().ok_or_else(|| {
            SaeError::Configuration(format!("no parent for {}", config_path.display()))
        })?;
        self.load_dir(source, dir, device)
    }

    /// Look up the dictionary for a source identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SaeError::Configuration`] for unknown sources.
    pub fn resolve(&self, source: &str) -> Result<&DictionaryEntry> {
        self.entries
            .get(source)
            .ok_or_else(|| SaeError::Configuration(format!("unknown source `{source}`")))
    }

    /// Registered source identifiers, sorted.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        sources.sort_unstable();
        sources
    }

    /// Number of registered dictionaries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, source: String, hook: HookPoint, kind: DictionaryKind, prepend_bos: bool) {
        let entry = DictionaryEntry {
            source: source.clone(),
            hook,
            kind,
            prepend_bos,
        };
        tracing::debug!(
            source = %entry.source,
            hook = %entry.hook,
            kind = entry.kind_name(),
            prepend_bos,
            "registered dictionary"
        );
        self.entries.insert(source, entry);
    }
}
