//! Per-request generation state and sampling parameters

use serde::{Deserialize, Serialize};

/// Identifier of a physical KV cache block
pub type BlockId = usize;

/// Sampling parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate per row
    pub max_new_tokens: usize,
    /// Sampling temperature; 0 selects greedy decoding
    pub temperature: f64,
    /// Token ids that end generation for the whole batch
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 1.0,
            stop_tokens: vec![],
        }
    }
}

impl GenerationParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            stop_tokens: vec![],
        }
    }

    pub fn is_stop(&self, token: u32) -> bool {
        self.stop_tokens.contains(&token)
    }
}

/// Reason generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// `max_new_tokens` reached
    Length,
    /// A row sampled one of the stop tokens
    Stop,
}

/// Generation state of one row of the batch.
///
/// Holds the full token history plus the cache bookkeeping the allocator
/// maintains for it: the ordered block table, how many leading tokens were
/// served from the prefix cache and how many full blocks have been published
/// for reuse.
#[derive(Debug, Clone)]
pub struct Sequence {
    token_ids: Vec<u32>,
    num_prompt_tokens: usize,
    num_cached_tokens: usize,
    num_committed_blocks: usize,
    block_table: Vec<BlockId>,
    block_size: usize,
    prefix_cacheable: bool,
}

impl Sequence {
    pub fn new(token_ids: Vec<u32>, block_size: usize) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        let num_prompt_tokens = token_ids.len();
        Self {
            token_ids,
            num_prompt_tokens,
            num_cached_tokens: 0,
            num_committed_blocks: 0,
            block_table: Vec::new(),
            block_size,
            prefix_cacheable: true,
        }
    }

    /// Opt this sequence out of prefix reuse. Used when the token ids are
    /// placeholders that do not identify the cached content.
    pub fn without_prefix_cache(mut self) -> Self {
        self.prefix_cacheable = false;
        self
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.token_ids[..self.num_prompt_tokens]
    }

    pub fn completion_tokens(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    pub fn last_token(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_prefix_cacheable(&self) -> bool {
        self.prefix_cacheable
    }

    pub fn block_table(&self) -> &[BlockId] {
        &self.block_table
    }

    /// Blocks needed to hold every token of the sequence
    pub fn num_blocks(&self) -> usize {
        self.token_ids.len().div_ceil(self.block_size)
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.num_cached_tokens / self.block_size
    }

    /// Fill count of the last block
    pub fn last_block_num_tokens(&self) -> usize {
        let num_blocks = self.num_blocks();
        if num_blocks == 0 {
            return 0;
        }
        self.token_ids.len() - (num_blocks - 1) * self.block_size
    }

    /// Tokens stored in logical block `i`
    pub fn block(&self, i: usize) -> &[u32] {
        let start = i * self.block_size;
        let end = (start + self.block_size).min(self.token_ids.len());
        &self.token_ids[start..end]
    }

    /// Physical cache cell of the most recent token, derived from the last
    /// block id and its fill count.
    pub fn last_slot(&self) -> Option<usize> {
        let last_block = *self.block_table.last()?;
        let fill = self.last_block_num_tokens();
        if fill == 0 {
            return None;
        }
        Some(last_block * self.block_size + fill - 1)
    }

    pub fn append_token(&mut self, token: u32) {
        self.token_ids.push(token);
    }

    pub(crate) fn set_num_cached_tokens(&mut self, n: usize) {
        debug_assert!(n <= self.token_ids.len());
        self.num_cached_tokens = n;
    }

    /// Leading blocks whose content hash is registered with the pool
    pub(crate) fn num_committed_blocks(&self) -> usize {
        self.num_committed_blocks
    }

    pub(crate) fn set_num_committed_blocks(&mut self, n: usize) {
        debug_assert!(n <= self.block_table.len());
        self.num_committed_blocks = n;
    }

    pub(crate) fn push_block(&mut self, block_id: BlockId) {
        self.block_table.push(block_id);
    }

    pub(crate) fn take_block_table(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_table)
    }
}
