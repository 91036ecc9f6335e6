//! Generation engine - drives admission, prefill, decode and retirement
//!
//! One `generate` call runs a single synchronous batch through
//! ADMITTED -> PREFILLING -> DECODING -> COMPLETED/STOPPED and always
//! returns every cache block it took, whether it finishes, stops early or
//! fails.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::batcher::{BatchPreparer, PrefillBatch};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::{executor_for, DecodeExecutor};
use crate::kv_cache::{CacheStats, KvCacheManager, PagedKvCache};
use crate::model::{project_logits, ConditioningEmbedder, DecoderModel, LmHead, ModelInput};
use crate::sampler::Sampler;
use crate::sequence::{FinishReason, GenerationParams, Sequence};

/// Token id filling the conditioning positions of embedding-mode sequences
pub const PLACEHOLDER_TOKEN: u32 = 1;

/// How prompts reach the model, fixed for the engine's lifetime
pub enum InputMode {
    /// Prompt rows are token ids fed to the model directly
    Tokens,
    /// The model is fed precomputed conditioning embeddings followed by the
    /// embedded start token; decode tokens go through the same embedder.
    Embeddings(Box<dyn ConditioningEmbedder>),
}

impl InputMode {
    fn embedder(&self) -> Option<&dyn ConditioningEmbedder> {
        match self {
            InputMode::Tokens => None,
            InputMode::Embeddings(embedder) => Some(embedder.as_ref()),
        }
    }
}

/// A batch of prompts to generate from
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// One row per sequence. In embedding mode the last token of each row is
    /// the start-of-generation token.
    pub prompts: Vec<Vec<u32>>,
    pub params: GenerationParams,
    /// Passed through to the model on the token path
    pub attention_mask: Option<Tensor>,
    /// `[batch, cond_len, hidden]`, required in embedding mode
    pub conditioning: Option<Tensor>,
}

impl GenerateRequest {
    pub fn new(prompts: Vec<Vec<u32>>, params: GenerationParams) -> Self {
        Self {
            prompts,
            params,
            attention_mask: None,
            conditioning: None,
        }
    }

    pub fn with_conditioning(mut self, conditioning: Tensor) -> Self {
        self.conditioning = Some(conditioning);
        self
    }

    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }
}

/// Result of one `generate` call
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// Prompt row followed by that row's generated tokens
    pub sequences: Vec<Vec<u32>>,
    /// Generated tokens only
    pub generated: Vec<Vec<u32>>,
    pub finish_reason: FinishReason,
    pub tokens_per_second: f64,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub requests: u64,
    pub tokens_generated: u64,
    pub captured_sizes: Vec<usize>,
    pub replays: u64,
    pub fallbacks: u64,
    pub direct_steps: u64,
}

/// Batched autoregressive generation over a paged KV cache
pub struct AccelEngine {
    config: EngineConfig,
    model: Box<dyn DecoderModel>,
    head: Option<Box<dyn LmHead>>,
    mode: InputMode,
    cache: Arc<dyn KvCacheManager>,
    preparer: BatchPreparer,
    executor: Box<dyn DecodeExecutor>,
    sampler: Sampler,
    requests: u64,
    tokens_generated: u64,
}

impl AccelEngine {
    /// Create an engine with a paged KV cache sized by `config.cache`
    pub fn new(
        model: Box<dyn DecoderModel>,
        head: Option<Box<dyn LmHead>>,
        mode: InputMode,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = PagedKvCache::new(&config.cache, model.device())?;
        Self::with_cache_manager(model, head, mode, config, Arc::new(cache))
    }

    /// Create an engine over an existing cache manager
    pub fn with_cache_manager(
        mut model: Box<dyn DecoderModel>,
        head: Option<Box<dyn LmHead>>,
        mode: InputMode,
        config: EngineConfig,
        cache: Arc<dyn KvCacheManager>,
    ) -> Result<Self> {
        config.validate()?;
        cache.wire(model.as_mut())?;

        let preparer = BatchPreparer::new(
            config.cache.block_size,
            config.max_decode_batch,
            model.device().clone(),
        );
        let executor = executor_for(&config.graph, config.max_blocks_per_seq());
        let sampler = Sampler::new(config.seed);

        info!(
            device = ?model.device(),
            hidden_size = model.hidden_size(),
            block_size = config.cache.block_size,
            num_blocks = config.cache.num_blocks,
            graphs = config.graph.enabled,
            "engine ready"
        );

        Ok(Self {
            config,
            model,
            head,
            mode,
            cache,
            preparer,
            executor,
            sampler,
            requests: 0,
            tokens_generated: 0,
        })
    }

    /// Replace the sampler, e.g. to pin its noise source
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn DecoderModel {
        self.model.as_ref()
    }

    pub fn stats(&self) -> EngineStats {
        let exec = self.executor.stats();
        EngineStats {
            requests: self.requests,
            tokens_generated: self.tokens_generated,
            captured_sizes: exec.captured_sizes,
            replays: exec.replays,
            fallbacks: exec.fallbacks,
            direct_steps: exec.direct_steps,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Generate for every prompt row as one batch
    pub fn generate(&mut self, req: &GenerateRequest) -> Result<GenerationOutput> {
        self.validate(req)?;
        let start = Instant::now();

        let mut seqs = self.build_sequences(req)?;
        self.admit(&mut seqs)?;
        debug!(batch = seqs.len(), "admitted sequences");

        let outcome = self.run(&mut seqs, req);
        for seq in seqs.iter_mut() {
            self.cache.release(seq);
        }
        let (generated, finish_reason) = outcome?;

        let total: usize = generated.iter().map(Vec::len).sum();
        let elapsed = start.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };
        self.requests += 1;
        self.tokens_generated += total as u64;

        info!(
            batch = req.prompts.len(),
            tokens = total,
            finish = ?finish_reason,
            "Generated {} tokens ({:.1} tok/s)",
            total,
            tokens_per_second
        );

        let sequences = req
            .prompts
            .iter()
            .zip(generated.iter())
            .map(|(prompt, gen)| prompt.iter().chain(gen.iter()).copied().collect())
            .collect();

        Ok(GenerationOutput {
            sequences,
            generated,
            finish_reason,
            tokens_per_second,
        })
    }

    fn validate(&self, req: &GenerateRequest) -> Result<()> {
        let params = &req.params;
        if req.prompts.is_empty() {
            return Err(EngineError::EmptyBatch.into());
        }
        if req.prompts.iter().any(Vec::is_empty) {
            return Err(EngineError::InvalidConfig("prompt rows must not be empty".into()).into());
        }
        if params.max_new_tokens == 0 {
            return Err(EngineError::InvalidConfig("max_new_tokens must be at least 1".into()).into());
        }
        // Temperatures reach the sampler as f32
        let temperature = params.temperature as f32;
        if !temperature.is_finite()
            || temperature < 0.0
            || (params.temperature > 0.0 && temperature == 0.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "temperature must be 0 or a positive finite f32, got {}",
                params.temperature
            ))
            .into());
        }
        let batch = req.prompts.len();
        if params.max_new_tokens > 1 && batch > self.config.max_decode_batch {
            return Err(EngineError::BatchTooLarge {
                size: batch,
                limit: self.config.max_decode_batch,
            }
            .into());
        }

        if let InputMode::Embeddings(_) = self.mode {
            let conditioning = req.conditioning.as_ref().ok_or_else(|| {
                EngineError::InvalidConfig("embedding mode needs conditioning embeddings".into())
            })?;
            let (rows, _, hidden) = conditioning.dims3()?;
            if rows != batch || hidden != self.model.hidden_size() {
                return Err(EngineError::InvalidConfig(format!(
                    "conditioning shape {:?} does not match batch {} and hidden size {}",
                    conditioning.dims(),
                    batch,
                    self.model.hidden_size()
                ))
                .into());
            }
            let len = req.prompts[0].len();
            if req.prompts.iter().any(|p| p.len() != len) {
                return Err(EngineError::InvalidConfig(
                    "embedding mode needs prompt rows of equal length".into(),
                )
                .into());
            }
        }
        Ok(())
    }

    fn build_sequences(&self, req: &GenerateRequest) -> Result<Vec<Sequence>> {
        let block_size = self.config.cache.block_size;
        match (&self.mode, &req.conditioning) {
            (InputMode::Embeddings(_), Some(conditioning)) => {
                let cond_len = conditioning.dims3()?.1;
                Ok(req
                    .prompts
                    .iter()
                    .map(|prompt| {
                        let mut tokens = vec![PLACEHOLDER_TOKEN; cond_len + 1];
                        tokens[cond_len] = prompt[prompt.len() - 1];
                        Sequence::new(tokens, block_size).without_prefix_cache()
                    })
                    .collect())
            }
            _ => Ok(req
                .prompts
                .iter()
                .map(|prompt| Sequence::new(prompt.clone(), block_size))
                .collect()),
        }
    }

    /// Reserve cache blocks for the whole batch or for none of it
    fn admit(&self, seqs: &mut [Sequence]) -> Result<()> {
        if !self.cache.can_allocate(seqs) {
            return Err(EngineError::OutOfBlocks {
                requested: seqs.iter().map(Sequence::num_blocks).sum(),
                available: self.cache.stats().free_blocks,
            }
            .into());
        }
        for i in 0..seqs.len() {
            if let Err(e) = self.cache.allocate(&mut seqs[i]) {
                for seq in seqs[..i].iter_mut() {
                    self.cache.release(seq);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Publish blocks the last forward call finished writing
    fn commit(&self, seqs: &mut [Sequence]) -> Result<()> {
        for seq in seqs.iter_mut() {
            self.cache.commit(seq)?;
        }
        Ok(())
    }

    fn run(
        &mut self,
        seqs: &mut [Sequence],
        req: &GenerateRequest,
    ) -> Result<(Vec<Vec<u32>>, FinishReason)> {
        let params = &req.params;
        let batch_size = seqs.len();
        let embedder = self.mode.embedder();
        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); batch_size];

        // Prefill
        let batch = self.preparer.prepare_prefill(seqs)?;
        let input = prefill_input(&batch, req, embedder, self.model.dtype())?;
        let PrefillBatch {
            context,
            last_token_indices,
            ..
        } = batch;
        let hidden = self.model.forward(input, &context)?;
        drop(context);
        self.commit(seqs)?;

        let last = last_hidden(&hidden, &last_token_indices, batch_size)?;
        let logits = project_logits(&last, self.head.as_deref(), self.model.as_ref())?;
        let first = sample_tokens(&mut self.sampler, &self.preparer, &logits, params)?;

        let mut stopped = false;
        for (i, &token) in first.iter().enumerate() {
            if params.is_stop(token) {
                stopped = true;
            } else {
                generated[i].push(token);
            }
        }
        if stopped {
            debug!("stop token sampled at prefill");
            return Ok((generated, FinishReason::Stop));
        }
        for (seq, &token) in seqs.iter_mut().zip(first.iter()) {
            seq.append_token(token);
            self.cache.append(seq)?;
        }

        if params.max_new_tokens == 1 {
            return Ok((generated, FinishReason::Length));
        }

        // Decode
        if self.executor.needs_capture() {
            self.executor.capture(self.model.as_mut(), embedder)?;
        }
        let position_offset = match self.mode {
            InputMode::Embeddings(_) => req.prompts[0].len() - 1,
            InputMode::Tokens => 0,
        };

        for step in 1..params.max_new_tokens {
            let batch = self.preparer.prepare_decode(seqs, position_offset)?;
            let hidden = self
                .executor
                .execute(self.model.as_mut(), embedder, &batch)?;
            drop(batch);
            self.commit(seqs)?;

            let logits = project_logits(&hidden, self.head.as_deref(), self.model.as_ref())?;
            let next = sample_tokens(&mut self.sampler, &self.preparer, &logits, params)?;

            let mut stopped = false;
            for (i, &token) in next.iter().enumerate() {
                if params.is_stop(token) {
                    stopped = true;
                } else {
                    seqs[i].append_token(token);
                    self.cache.append(&mut seqs[i])?;
                    generated[i].push(token);
                }
            }
            if stopped {
                debug!(step, "stop token sampled, halting batch");
                return Ok((generated, FinishReason::Stop));
            }
        }

        Ok((generated, FinishReason::Length))
    }
}

/// Model input for the packed prefill
fn prefill_input(
    batch: &PrefillBatch,
    req: &GenerateRequest,
    embedder: Option<&dyn ConditioningEmbedder>,
    dtype: DType,
) -> Result<ModelInput> {
    match (embedder, &req.conditioning) {
        (Some(embedder), Some(conditioning)) => {
            let device = batch.input_ids.device();
            let (rows, cond_len, hidden) = conditioning.dims3()?;
            let starts: Vec<u32> = req.prompts.iter().map(|p| p[p.len() - 1]).collect();
            let starts = Tensor::from_vec(starts, (rows, 1), device)?;
            let start_positions = Tensor::zeros((rows, 1), DType::I64, device)?;
            let start_emb = embedder.embed(&starts, &start_positions)?.to_dtype(dtype)?;

            let full = Tensor::cat(&[&conditioning.to_dtype(dtype)?, &start_emb], 1)?;
            let inputs_embeds = full.reshape((1, rows * (cond_len + 1), hidden))?;
            Ok(ModelInput::Embeddings { inputs_embeds })
        }
        (Some(_), None) => Err(EngineError::InvalidConfig(
            "embedding mode needs conditioning embeddings".into(),
        )
        .into()),
        (None, _) => Ok(ModelInput::Tokens {
            input_ids: batch.input_ids.unsqueeze(0)?,
            positions: batch.positions.unsqueeze(0)?,
            attention_mask: req.attention_mask.clone(),
        }),
    }
}

/// Final hidden state of every row, [batch, hidden]
fn last_hidden(hidden: &Tensor, last_token_indices: &[u32], batch_size: usize) -> Result<Tensor> {
    let (rows, seq_len, _) = hidden.dims3()?;
    if rows == 1 {
        let idx = Tensor::new(last_token_indices, hidden.device())?;
        Ok(hidden.squeeze(0)?.index_select(&idx, 0)?)
    } else if rows == batch_size {
        Ok(hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
    } else {
        Err(EngineError::Contract(format!(
            "prefill returned {} rows for a batch of {}",
            rows, batch_size
        ))
        .into())
    }
}

fn sample_tokens(
    sampler: &mut Sampler,
    preparer: &BatchPreparer,
    logits: &Tensor,
    params: &GenerationParams,
) -> Result<Vec<u32>> {
    if params.temperature == 0.0 {
        return Sampler::greedy(logits);
    }
    let temperatures = preparer.prepare_temperatures(logits.dim(0)?, params.temperature)?;
    sampler.sample(logits, &temperatures)
}
