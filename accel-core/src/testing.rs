//! Deterministic collaborators for tests and demos.
//!
//! Every model here uses its hidden state directly as logits: hidden size
//! equals vocabulary size and `compute_logits` is the identity.

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor, D};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ForwardContext;
use crate::error::EngineError;
use crate::kv_cache::{context_slots, LayerKvCache};
use crate::model::{ConditioningEmbedder, DecoderModel, ModelInput};

pub use crate::sampler::FixedNoise;

/// `[tokens.len(), vocab]` one-hot rows
pub fn one_hot(tokens: &[u32], vocab: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; tokens.len() * vocab];
    for (row, &t) in tokens.iter().enumerate() {
        let t = t as usize;
        if t >= vocab {
            bail!("token {} outside vocabulary of {}", t, vocab);
        }
        data[row * vocab + t] = 1.0;
    }
    Ok(Tensor::from_vec(data, (tokens.len(), vocab), device)?)
}

/// Token ids carried by a model input, with its (batch, seq) shape
fn input_tokens(input: &ModelInput) -> Result<(usize, usize, Vec<u32>)> {
    match input {
        ModelInput::Tokens { input_ids, .. } => {
            let (b, s) = input_ids.dims2()?;
            Ok((b, s, input_ids.flatten_all()?.to_vec1::<u32>()?))
        }
        ModelInput::Embeddings { inputs_embeds } => {
            let (b, s, _) = inputs_embeds.dims3()?;
            let ids = inputs_embeds
                .to_dtype(DType::F32)?
                .argmax(D::Minus1)?
                .flatten_all()?
                .to_vec1::<u32>()?;
            Ok((b, s, ids))
        }
    }
}

/// Stateless model: the next token depends only on the input token.
///
/// Unmapped tokens advance to `(t + 1) % vocab`. Embedding inputs are read
/// back as the arg-max of each embedding row.
pub struct TransitionModel {
    vocab: usize,
    transitions: HashMap<u32, u32>,
    device: Device,
    forward_calls: usize,
}

impl TransitionModel {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            transitions: HashMap::new(),
            device: Device::Cpu,
            forward_calls: 0,
        }
    }

    pub fn with_transition(mut self, from: u32, to: u32) -> Self {
        self.transitions.insert(from, to);
        self
    }

    pub fn next_token(&self, token: u32) -> u32 {
        self.transitions
            .get(&token)
            .copied()
            .unwrap_or((token + 1) % self.vocab as u32)
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls
    }
}

impl DecoderModel for TransitionModel {
    fn forward(&mut self, input: ModelInput, _ctx: &ForwardContext) -> Result<Tensor> {
        self.forward_calls += 1;
        let (b, s, ids) = input_tokens(&input)?;
        let next: Vec<u32> = ids.iter().map(|&t| self.next_token(t)).collect();
        Ok(one_hot(&next, self.vocab, &self.device)?.reshape((b, s, self.vocab))?)
    }

    fn hidden_size(&self) -> usize {
        self.vocab
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn compute_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(hidden.clone())
    }
}

/// Returns the same scripted logits row for every position of the n-th
/// forward call. Calls past the script repeat the last row.
pub struct ScriptedModel {
    steps: Vec<Vec<f32>>,
    call: usize,
    device: Device,
}

impl ScriptedModel {
    pub fn new(steps: Vec<Vec<f32>>) -> Result<Self> {
        let vocab = steps.first().map(Vec::len).unwrap_or(0);
        if vocab == 0 || steps.iter().any(|s| s.len() != vocab) {
            bail!("scripted logits need at least one step and equal row widths");
        }
        Ok(Self {
            steps,
            call: 0,
            device: Device::Cpu,
        })
    }

    pub fn calls(&self) -> usize {
        self.call
    }
}

impl DecoderModel for ScriptedModel {
    fn forward(&mut self, input: ModelInput, _ctx: &ForwardContext) -> Result<Tensor> {
        let (b, s) = match &input {
            ModelInput::Tokens { input_ids, .. } => input_ids.dims2()?,
            ModelInput::Embeddings { inputs_embeds } => {
                let (b, s, _) = inputs_embeds.dims3()?;
                (b, s)
            }
        };
        let step = self.call.min(self.steps.len() - 1);
        self.call += 1;
        let row = Tensor::new(self.steps[step].as_slice(), &self.device)?;
        Ok(row.reshape((1, 1, self.hidden_size()))?.repeat((b, s, 1))?)
    }

    fn hidden_size(&self) -> usize {
        self.steps[0].len()
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn compute_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(hidden.clone())
    }
}

/// Model that goes through the paged KV cache: every forward stores its
/// token ids at the slot mapping, then reads each row's context back through
/// the block table. The next token is the context sum modulo the vocabulary.
///
/// Expects a single layer with one head of dimension one.
pub struct CacheSumModel {
    vocab: usize,
    block_size: usize,
    layer: Option<LayerKvCache>,
    device: Device,
}

impl CacheSumModel {
    pub fn new(vocab: usize, block_size: usize) -> Self {
        Self {
            vocab,
            block_size,
            layer: None,
            device: Device::Cpu,
        }
    }

    fn read_context(&self, layer: &LayerKvCache, table: &[i64], len: usize) -> Result<Vec<u32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let blocks: Vec<usize> = table
            .iter()
            .take_while(|&&b| b >= 0)
            .map(|&b| b as usize)
            .collect();
        if blocks.len() * self.block_size < len {
            return Err(EngineError::Contract(format!(
                "{} blocks cannot hold a context of {}",
                blocks.len(),
                len
            ))
            .into());
        }
        let (k, _) = layer.gather(&context_slots(&blocks, self.block_size, len))?;
        Ok(k.flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v.round() as u32)
            .collect())
    }

    fn next_of(&self, context: &[u32]) -> u32 {
        (context.iter().map(|&t| t as u64).sum::<u64>() % self.vocab as u64) as u32
    }
}

impl DecoderModel for CacheSumModel {
    fn forward(&mut self, input: ModelInput, ctx: &ForwardContext) -> Result<Tensor> {
        if !matches!(input, ModelInput::Tokens { .. }) {
            bail!("cache sum model only takes token ids");
        }
        let (b, s, ids) = input_tokens(&input)?;
        let layer = self
            .layer
            .as_ref()
            .ok_or_else(|| anyhow!("kv cache is not bound"))?;

        let values: Vec<f32> = ids.iter().map(|&t| t as f32).collect();
        let values = Tensor::from_vec(values, (ids.len(), 1, 1), &self.device)?;
        layer.store(&values, &values, &ctx.slots()?)?;

        let next: Vec<u32> = match ctx {
            ForwardContext::Prefill(meta) => {
                let cu_q = meta.cu_seqlens_q.to_vec1::<u32>()?;
                let cu_k = meta.cu_seqlens_k.to_vec1::<u32>()?;
                let tables = meta
                    .block_tables
                    .as_ref()
                    .map(|t| t.to_vec2::<i64>())
                    .transpose()?;
                let mut next = Vec::with_capacity(ids.len());
                for row in 0..cu_q.len() - 1 {
                    let (q0, q1) = (cu_q[row] as usize, cu_q[row + 1] as usize);
                    let k_len = (cu_k[row + 1] - cu_k[row]) as usize;
                    let context = match &tables {
                        Some(tables) => self.read_context(layer, &tables[row], k_len)?,
                        None => ids[q0..q1].to_vec(),
                    };
                    let start = k_len - (q1 - q0);
                    for p in start..k_len {
                        next.push(self.next_of(&context[..=p]));
                    }
                }
                next
            }
            ForwardContext::Decode(meta) => {
                let lens = meta.context_lens.to_vec1::<u32>()?;
                let tables = meta.block_tables.to_vec2::<i64>()?;
                let mut next = Vec::with_capacity(b);
                for row in 0..b {
                    let context = self.read_context(layer, &tables[row], lens[row] as usize)?;
                    next.push(self.next_of(&context));
                }
                next
            }
        };

        Ok(one_hot(&next, self.vocab, &self.device)?.reshape((b, s, self.vocab))?)
    }

    fn hidden_size(&self) -> usize {
        self.vocab
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn bind_kv_cache(&mut self, layers: Vec<LayerKvCache>) -> Result<()> {
        self.layer = Some(
            layers
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("cache has no layers"))?,
        );
        Ok(())
    }

    fn compute_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(hidden.clone())
    }
}

/// Fails its first `failures` forward calls before they reach the wrapped
/// model, then delegates.
pub struct FlakyModel<M> {
    inner: M,
    failures: usize,
}

impl<M: DecoderModel> FlakyModel<M> {
    pub fn new(inner: M, failures: usize) -> Self {
        Self { inner, failures }
    }
}

impl<M: DecoderModel> DecoderModel for FlakyModel<M> {
    fn forward(&mut self, input: ModelInput, ctx: &ForwardContext) -> Result<Tensor> {
        if self.failures > 0 {
            self.failures -= 1;
            bail!("injected forward failure");
        }
        self.inner.forward(input, ctx)
    }

    fn hidden_size(&self) -> usize {
        self.inner.hidden_size()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn bind_kv_cache(&mut self, layers: Vec<LayerKvCache>) -> Result<()> {
        self.inner.bind_kv_cache(layers)
    }

    fn compute_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        self.inner.compute_logits(hidden)
    }
}

/// One-hot token embedding with a zero positional table. Remembers every
/// position it was asked to embed; clones share that record.
#[derive(Clone)]
pub struct OneHotEmbedder {
    vocab: usize,
    positions: Arc<Mutex<Vec<i64>>>,
}

impl OneHotEmbedder {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            positions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen_positions(&self) -> Vec<i64> {
        self.positions.lock().clone()
    }
}

impl ConditioningEmbedder for OneHotEmbedder {
    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        let tokens = ids.flatten_all()?.to_vec1::<u32>()?;
        let mut shape = ids.dims().to_vec();
        shape.push(self.vocab);
        Ok(one_hot(&tokens, self.vocab, ids.device())?.reshape(shape)?)
    }

    fn embed_positions(&self, positions: &Tensor) -> Result<Tensor> {
        self.positions
            .lock()
            .extend(positions.flatten_all()?.to_vec1::<i64>()?);
        let mut shape = positions.dims().to_vec();
        shape.push(self.vocab);
        Ok(Tensor::zeros(shape, DType::F32, positions.device())?)
    }
}
