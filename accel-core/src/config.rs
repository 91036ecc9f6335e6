//! Engine configuration
//!
//! Serializable settings for the KV cache, the decode execution plans and the
//! decode batch ceiling. Loadable from JSON.

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EngineError;

/// Hard ceiling on concurrent sequences in one decode step
pub const MAX_DECODE_BATCH: usize = 8;

/// Element type of the KV cache tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDtype {
    F16,
    Bf16,
    F32,
}

impl CacheDtype {
    pub fn as_dtype(self) -> DType {
        match self {
            CacheDtype::F16 => DType::F16,
            CacheDtype::Bf16 => DType::BF16,
            CacheDtype::F32 => DType::F32,
        }
    }
}

/// Geometry and capacity of the paged KV cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of key/value heads per layer
    pub num_kv_heads: usize,
    /// Size of each attention head
    pub head_dim: usize,
    /// Tokens per cache block
    pub block_size: usize,
    /// Total number of cache blocks in the pool
    pub num_blocks: usize,
    /// Element type of the cache tensors
    pub dtype: CacheDtype,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 24,
            num_kv_heads: 20,
            head_dim: 64,
            block_size: 256,
            num_blocks: 128,
            dtype: CacheDtype::F16,
        }
    }
}

/// Settings for captured decode execution plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Replay captured plans instead of dispatching every decode step
    pub enabled: bool,
    /// Batch sizes to capture plans for
    pub capture_sizes: Vec<usize>,
    /// Longest context the plan's block-table buffer can address
    pub max_context_len: usize,
    /// Token id written into the input buffer during capture
    pub capture_token_id: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_sizes: vec![1, 2, 4, 8],
            max_context_len: 2048,
            capture_token_id: 0,
        }
    }
}

impl GraphConfig {
    /// Plans disabled; every decode step runs the model directly.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Configuration for the generation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub graph: GraphConfig,
    /// Maximum sequences per decode step
    pub max_decode_batch: usize,
    /// Seed for the sampler's exponential noise
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            graph: GraphConfig::default(),
            max_decode_batch: MAX_DECODE_BATCH,
            seed: 42,
        }
    }
}

impl EngineConfig {
    pub fn with_cache(cache: CacheConfig) -> Self {
        Self {
            cache,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Number of block-table columns a captured plan must hold
    pub fn max_blocks_per_seq(&self) -> usize {
        self.graph.max_context_len.div_ceil(self.cache.block_size)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.cache.block_size == 0 {
            return invalid("block_size must be positive".into());
        }
        if self.cache.num_blocks == 0 {
            return invalid("num_blocks must be positive".into());
        }
        if self.max_decode_batch == 0 || self.max_decode_batch > MAX_DECODE_BATCH {
            return invalid(format!(
                "max_decode_batch must be in 1..={}, got {}",
                MAX_DECODE_BATCH, self.max_decode_batch
            ));
        }
        if self.graph.enabled {
            if self.graph.capture_sizes.is_empty() {
                return invalid("capture_sizes must not be empty when plans are enabled".into());
            }
            if let Some(&bad) = self
                .graph
                .capture_sizes
                .iter()
                .find(|&&s| s == 0 || s > self.max_decode_batch)
            {
                return invalid(format!(
                    "capture size {} outside 1..={}",
                    bad, self.max_decode_batch
                ));
            }
            if self.graph.max_context_len == 0 {
                return invalid("max_context_len must be positive".into());
            }
        }
        Ok(())
    }
}
