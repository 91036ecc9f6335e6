//! Per-forward attention metadata.
//!
//! A `ForwardContext` is built by the batch preparer (or from the plan
//! buffers during capture and replay), handed to exactly one model forward
//! call, and dropped afterwards.

use anyhow::Result;
use candle_core::Tensor;

/// Metadata for a packed, variable-length prefill
#[derive(Debug, Clone)]
pub struct PrefillMetadata {
    /// Cumulative query lengths, [batch + 1], u32
    pub cu_seqlens_q: Tensor,
    /// Cumulative key lengths, [batch + 1], u32
    pub cu_seqlens_k: Tensor,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    /// Cache cell per query token, [total_q], i64
    pub slot_mapping: Tensor,
    /// Present only when some row reuses a cached prefix, [batch, max_blocks], i64
    pub block_tables: Option<Tensor>,
}

/// Metadata for a single-token-per-row decode step
#[derive(Debug, Clone)]
pub struct DecodeMetadata {
    /// Cache cell per row, [batch], i64; -1 means "write nothing"
    pub slot_mapping: Tensor,
    /// Valid context length per row, [batch], u32
    pub context_lens: Tensor,
    /// [batch, max_blocks], i64, padded with -1
    pub block_tables: Tensor,
}

#[derive(Debug, Clone)]
pub enum ForwardContext {
    Prefill(PrefillMetadata),
    Decode(DecodeMetadata),
}

impl ForwardContext {
    pub fn is_prefill(&self) -> bool {
        matches!(self, ForwardContext::Prefill(_))
    }

    pub fn slot_mapping(&self) -> &Tensor {
        match self {
            ForwardContext::Prefill(m) => &m.slot_mapping,
            ForwardContext::Decode(m) => &m.slot_mapping,
        }
    }

    pub fn block_tables(&self) -> Option<&Tensor> {
        match self {
            ForwardContext::Prefill(m) => m.block_tables.as_ref(),
            ForwardContext::Decode(m) => Some(&m.block_tables),
        }
    }

    /// Slot mapping copied to the host
    pub fn slots(&self) -> Result<Vec<i64>> {
        Ok(self.slot_mapping().to_vec1::<i64>()?)
    }

    /// Prefill sequence boundaries on the host as (cu_seqlens_q, cu_seqlens_k)
    pub fn prefill_bounds(&self) -> Result<Option<(Vec<u32>, Vec<u32>)>> {
        match self {
            ForwardContext::Prefill(m) => Ok(Some((
                m.cu_seqlens_q.to_vec1::<u32>()?,
                m.cu_seqlens_k.to_vec1::<u32>()?,
            ))),
            ForwardContext::Decode(_) => Ok(None),
        }
    }

    /// Decode rows on the host as (context_lens, block_tables)
    pub fn decode_rows(&self) -> Result<Option<(Vec<u32>, Vec<Vec<i64>>)>> {
        match self {
            ForwardContext::Decode(m) => Ok(Some((
                m.context_lens.to_vec1::<u32>()?,
                m.block_tables.to_vec2::<i64>()?,
            ))),
            ForwardContext::Prefill(_) => Ok(None),
        }
    }
}
