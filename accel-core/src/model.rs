//! Model-facing interfaces
//!
//! The engine drives any decoder through `DecoderModel`; logits come from an
//! `LmHead` or from the model itself. The conditioning embedder covers the
//! embedding-driven (speech) input path.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use crate::context::ForwardContext;
use crate::kv_cache::LayerKvCache;

/// Input to one forward call
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// Token ids and positions, `[1, total]` for a packed prefill or
    /// `[batch, 1]` for decode
    Tokens {
        input_ids: Tensor,
        positions: Tensor,
        attention_mask: Option<Tensor>,
    },
    /// Precomputed input embeddings, `[batch, seq, hidden]`
    Embeddings { inputs_embeds: Tensor },
}

impl ModelInput {
    pub fn tokens(input_ids: Tensor, positions: Tensor) -> Self {
        ModelInput::Tokens {
            input_ids,
            positions,
            attention_mask: None,
        }
    }
}

/// Decoder stack producing last-layer hidden states.
pub trait DecoderModel: Send {
    /// Returns hidden states shaped `[batch, seq, hidden]`. The context is
    /// only valid for the duration of this call.
    fn forward(&mut self, input: ModelInput, ctx: &ForwardContext) -> Result<Tensor>;

    fn hidden_size(&self) -> usize;

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// Receive the per-layer cache tensors. Models that keep no cache can
    /// ignore them.
    fn bind_kv_cache(&mut self, _layers: Vec<LayerKvCache>) -> Result<()> {
        Ok(())
    }

    /// Built-in projection to logits, used when no separate head is given
    fn compute_logits(&self, _hidden: &Tensor) -> Result<Tensor> {
        bail!("model has no built-in logits projection and no head was supplied")
    }
}

/// Projection from hidden states to vocabulary logits
pub trait LmHead: Send {
    fn forward(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Element type the head's weights are stored in
    fn dtype(&self) -> DType;
}

impl LmHead for Linear {
    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(Module::forward(self, hidden)?)
    }

    fn dtype(&self) -> DType {
        self.weight().dtype()
    }
}

/// Embedding lookups for the embedding-driven input path
pub trait ConditioningEmbedder: Send + Sync {
    /// `[...]` token ids to `[..., hidden]`
    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor>;

    /// `[...]` positions to `[..., hidden]`
    fn embed_positions(&self, positions: &Tensor) -> Result<Tensor>;

    /// Token embedding plus positional embedding
    fn embed(&self, ids: &Tensor, positions: &Tensor) -> Result<Tensor> {
        Ok((self.embed_tokens(ids)? + self.embed_positions(positions)?)?)
    }
}

/// Learned token and position tables
pub struct LearnedEmbedder {
    tokens: Embedding,
    positions: Embedding,
}

impl LearnedEmbedder {
    pub fn new(tokens: Embedding, positions: Embedding) -> Self {
        Self { tokens, positions }
    }

    /// Load `token_embedding` and `position_embedding` tables from `vb`
    pub fn load(vb: VarBuilder, vocab_size: usize, max_positions: usize, hidden: usize) -> Result<Self> {
        let tokens = candle_nn::embedding(vocab_size, hidden, vb.pp("token_embedding"))?;
        let positions = candle_nn::embedding(max_positions, hidden, vb.pp("position_embedding"))?;
        Ok(Self::new(tokens, positions))
    }
}

impl ConditioningEmbedder for LearnedEmbedder {
    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.tokens.forward(ids)?)
    }

    fn embed_positions(&self, positions: &Tensor) -> Result<Tensor> {
        Ok(self.positions.forward(positions)?)
    }
}

/// Project hidden states to logits, casting to the head's dtype first
pub fn project_logits(
    hidden: &Tensor,
    head: Option<&dyn LmHead>,
    model: &dyn DecoderModel,
) -> Result<Tensor> {
    match head {
        Some(head) => {
            let hidden = if hidden.dtype() != head.dtype() {
                hidden.to_dtype(head.dtype())?
            } else {
                hidden.clone()
            };
            head.forward(&hidden)
        }
        None => model.compute_logits(hidden),
    }
}
