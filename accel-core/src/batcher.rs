//! Batcher module - builds prefill and decode inputs from active sequences

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::context::{DecodeMetadata, ForwardContext, PrefillMetadata};
use crate::error::EngineError;
use crate::sequence::Sequence;

/// Packed prefill input for every row of the batch
#[derive(Debug)]
pub struct PrefillBatch {
    /// Uncached tokens of all rows back to back, [total_q], u32
    pub input_ids: Tensor,
    /// [total_q], i64
    pub positions: Tensor,
    pub context: ForwardContext,
    /// Index of each row's final query token in the packed stream
    pub last_token_indices: Vec<u32>,
}

/// One new token per row
#[derive(Debug)]
pub struct DecodeBatch {
    /// [batch], u32
    pub input_ids: Tensor,
    /// [batch], i64; may be negative in embedding mode before clamping
    pub positions: Tensor,
    pub context: ForwardContext,
}

impl DecodeBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }
}

pub struct BatchPreparer {
    block_size: usize,
    max_decode_batch: usize,
    device: Device,
}

impl BatchPreparer {
    pub fn new(block_size: usize, max_decode_batch: usize, device: Device) -> Self {
        Self {
            block_size,
            max_decode_batch,
            device,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Prepare the first forward pass over every sequence's uncached suffix
    pub fn prepare_prefill(&self, seqs: &[Sequence]) -> Result<PrefillBatch> {
        if seqs.is_empty() {
            return Err(EngineError::EmptyBatch.into());
        }

        let mut input_ids = Vec::new();
        let mut positions = Vec::new();
        let mut cu_seqlens_q = vec![0u32];
        let mut cu_seqlens_k = vec![0u32];
        let mut max_seqlen_q = 0;
        let mut max_seqlen_k = 0;
        let mut slot_mapping = Vec::new();
        let mut last_token_indices = Vec::with_capacity(seqs.len());

        for seq in seqs {
            let seqlen = seq.len();
            let cached = seq.num_cached_tokens();
            if seq.block_table().len() < seq.num_blocks() {
                return Err(EngineError::Contract(format!(
                    "sequence of {} tokens holds {} blocks",
                    seqlen,
                    seq.block_table().len()
                ))
                .into());
            }

            input_ids.extend_from_slice(&seq.token_ids()[cached..]);
            positions.extend((cached..seqlen).map(|p| p as i64));

            let seqlen_q = seqlen - cached;
            let q_end = cu_seqlens_q[cu_seqlens_q.len() - 1] + seqlen_q as u32;
            let k_end = cu_seqlens_k[cu_seqlens_k.len() - 1] + seqlen as u32;
            cu_seqlens_q.push(q_end);
            cu_seqlens_k.push(k_end);
            max_seqlen_q = max_seqlen_q.max(seqlen_q);
            max_seqlen_k = max_seqlen_k.max(seqlen);
            last_token_indices.push(q_end.saturating_sub(1));

            // Only cells of blocks not served from the prefix cache
            let num_blocks = seq.num_blocks();
            for i in seq.num_cached_blocks()..num_blocks {
                let start = seq.block_table()[i] * self.block_size;
                let end = if i + 1 == num_blocks {
                    start + seq.last_block_num_tokens()
                } else {
                    start + self.block_size
                };
                slot_mapping.extend((start..end).map(|s| s as i64));
            }
        }

        let total_q = input_ids.len();
        if slot_mapping.len() != total_q {
            return Err(EngineError::Contract(format!(
                "{} slots for {} query tokens",
                slot_mapping.len(),
                total_q
            ))
            .into());
        }

        let block_tables = if cu_seqlens_k[seqs.len()] > cu_seqlens_q[seqs.len()] {
            Some(self.prepare_block_tables(seqs)?)
        } else {
            None
        };

        let context = ForwardContext::Prefill(PrefillMetadata {
            cu_seqlens_q: Tensor::new(cu_seqlens_q.as_slice(), &self.device)?,
            cu_seqlens_k: Tensor::new(cu_seqlens_k.as_slice(), &self.device)?,
            max_seqlen_q,
            max_seqlen_k,
            slot_mapping: Tensor::from_vec(slot_mapping, total_q, &self.device)?,
            block_tables,
        });

        Ok(PrefillBatch {
            input_ids: Tensor::from_vec(input_ids, total_q, &self.device)?,
            positions: Tensor::from_vec(positions, total_q, &self.device)?,
            context,
            last_token_indices,
        })
    }

    /// Prepare one decode step. `position_offset` shifts every position
    /// back; it is nonzero only in embedding-driven mode.
    pub fn prepare_decode(&self, seqs: &[Sequence], position_offset: usize) -> Result<DecodeBatch> {
        if seqs.is_empty() {
            return Err(EngineError::EmptyBatch.into());
        }
        if seqs.len() > self.max_decode_batch {
            return Err(EngineError::BatchTooLarge {
                size: seqs.len(),
                limit: self.max_decode_batch,
            }
            .into());
        }

        let mut input_ids = Vec::with_capacity(seqs.len());
        let mut positions = Vec::with_capacity(seqs.len());
        let mut context_lens = Vec::with_capacity(seqs.len());
        let mut slot_mapping = Vec::with_capacity(seqs.len());

        for seq in seqs {
            let (token, slot) = match (seq.last_token(), seq.last_slot()) {
                (Some(token), Some(slot)) => (token, slot),
                _ => {
                    return Err(EngineError::Contract(
                        "decode needs a sequence with tokens and cache blocks".into(),
                    )
                    .into())
                }
            };
            input_ids.push(token);
            positions.push(seq.len() as i64 - 1 - position_offset as i64);
            context_lens.push(seq.len() as u32);
            slot_mapping.push(slot as i64);
        }

        let batch = seqs.len();
        let context = ForwardContext::Decode(DecodeMetadata {
            slot_mapping: Tensor::from_vec(slot_mapping, batch, &self.device)?,
            context_lens: Tensor::from_vec(context_lens, batch, &self.device)?,
            block_tables: self.prepare_block_tables(seqs)?,
        });

        Ok(DecodeBatch {
            input_ids: Tensor::from_vec(input_ids, batch, &self.device)?,
            positions: Tensor::from_vec(positions, batch, &self.device)?,
            context,
        })
    }

    /// Block tables padded with -1 to the longest row, [batch, max_blocks], i64
    pub fn prepare_block_tables(&self, seqs: &[Sequence]) -> Result<Tensor> {
        let width = seqs
            .iter()
            .map(|s| s.block_table().len())
            .max()
            .unwrap_or(0);
        if width == 0 {
            return Err(EngineError::Contract("block tables are empty".into()).into());
        }
        let mut flat = vec![-1i64; seqs.len() * width];
        for (row, seq) in seqs.iter().enumerate() {
            for (col, &block) in seq.block_table().iter().enumerate() {
                flat[row * width + col] = block as i64;
            }
        }
        Ok(Tensor::from_vec(flat, (seqs.len(), width), &self.device)?)
    }

    /// Per-row temperatures, [batch], f32
    pub fn prepare_temperatures(&self, batch: usize, temperature: f64) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            vec![temperature as f32; batch],
            batch,
            &self.device,
        )?)
    }
}
