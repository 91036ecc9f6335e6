//! Accel Core - batched autoregressive decoding engine
//!
//! This crate implements the decode-side machinery of a speech token
//! generator:
//! - Packed prefill and fixed-shape decode batch preparation
//! - Paged KV cache with block-level prefix reuse
//! - Captured decode plans with direct-execution fallback
//! - Temperature sampling via exponential-noise arg-max
//! - Token-id and conditioning-embedding input paths

pub mod config;
pub mod error;
pub mod sequence;
pub mod kv_cache;
pub mod context;
pub mod batcher;
pub mod sampler;
pub mod model;
pub mod graph;
pub mod engine;
pub mod testing;

pub use config::{CacheConfig, CacheDtype, EngineConfig, GraphConfig, MAX_DECODE_BATCH};
pub use error::EngineError;
pub use sequence::{FinishReason, GenerationParams, Sequence};
pub use kv_cache::{CacheStats, KvCacheManager, LayerKvCache, PagedKvCache};
pub use context::{DecodeMetadata, ForwardContext, PrefillMetadata};
pub use batcher::{BatchPreparer, DecodeBatch, PrefillBatch};
pub use sampler::{NoiseSource, Sampler, SeededNoise};
pub use model::{ConditioningEmbedder, DecoderModel, LearnedEmbedder, LmHead, ModelInput};
pub use graph::{DecodeExecutor, DirectExecutor, ExecutorStats, GraphExecutor};
pub use engine::{AccelEngine, EngineStats, GenerateRequest, GenerationOutput, InputMode};
