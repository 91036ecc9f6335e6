use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::EngineError;
use crate::model::DecoderModel;
use crate::sequence::{BlockId, Sequence};

/// Block-level KV cache bookkeeping consumed by the engine.
///
/// All methods take `&self`; implementations guard their pool internally.
pub trait KvCacheManager: Send + Sync {
    /// Whether every sequence in `seqs` could be admitted right now.
    ///
    /// Prefix hits on blocks already in use are free; hits on released
    /// blocks still consume a free block. `allocate` stays authoritative.
    fn can_allocate(&self, seqs: &[Sequence]) -> bool;

    /// Assign a block table covering the whole sequence. Fails without
    /// partial allocation when the pool is short.
    fn allocate(&self, seq: &mut Sequence) -> Result<()>;

    /// Make room for the most recently appended token
    fn append(&self, seq: &mut Sequence) -> Result<()>;

    /// Publish the full blocks of `seq` for prefix reuse. Call only once
    /// every token currently in `seq` has had its KV entry written.
    fn commit(&self, seq: &mut Sequence) -> Result<()>;

    /// Return every block of the sequence to the pool
    fn release(&self, seq: &mut Sequence);

    /// Hand the per-layer cache tensors to the model
    fn wire(&self, model: &mut dyn DecoderModel) -> Result<()>;

    fn stats(&self) -> CacheStats;
}

/// Key/value storage of one layer, addressed by flat slot index
/// (`block_id * block_size + offset`).
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    /// Shape: [num_slots, num_kv_heads, head_dim]
    pub k: Tensor,
    pub v: Tensor,
}

impl LayerKvCache {
    pub fn zeros(
        num_slots: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let k = Tensor::zeros((num_slots, num_kv_heads, head_dim), dtype, device)?;
        let v = Tensor::zeros((num_slots, num_kv_heads, head_dim), dtype, device)?;
        Ok(Self { k, v })
    }

    pub fn num_slots(&self) -> usize {
        self.k.dims()[0]
    }

    /// Write one row of `k`/`v` per slot. Negative slots are skipped.
    ///
    /// `k`, `v` shape: [num_tokens, num_kv_heads, head_dim]
    pub fn store(&self, k: &Tensor, v: &Tensor, slot_mapping: &[i64]) -> Result<()> {
        let num_tokens = k.dim(0)?;
        if num_tokens != slot_mapping.len() || v.dim(0)? != num_tokens {
            return Err(anyhow!(
                "store got {} key rows, {} value rows and {} slots",
                num_tokens,
                v.dim(0)?,
                slot_mapping.len()
            ));
        }
        let k = k.to_dtype(self.k.dtype())?;
        let v = v.to_dtype(self.v.dtype())?;
        let num_slots = self.num_slots();
        for (row, &slot) in slot_mapping.iter().enumerate() {
            if slot < 0 {
                continue;
            }
            let slot = slot as usize;
            if slot >= num_slots {
                return Err(anyhow!("slot {} out of bounds ({} slots)", slot, num_slots));
            }
            self.k.slice_set(&k.narrow(0, row, 1)?.contiguous()?, 0, slot)?;
            self.v.slice_set(&v.narrow(0, row, 1)?.contiguous()?, 0, slot)?;
        }
        Ok(())
    }

    /// Read the rows at `slots`, in order.
    ///
    /// Returns (K, V) with shape [slots.len(), num_kv_heads, head_dim]
    pub fn gather(&self, slots: &[u32]) -> Result<(Tensor, Tensor)> {
        let idx = Tensor::new(slots, self.k.device())?;
        Ok((self.k.index_select(&idx, 0)?, self.v.index_select(&idx, 0)?))
    }
}

/// Slots of the first `len` tokens of a sequence laid out over `block_table`
pub fn context_slots(block_table: &[BlockId], block_size: usize, len: usize) -> Vec<u32> {
    (0..len)
        .map(|pos| (block_table[pos / block_size] * block_size + pos % block_size) as u32)
        .collect()
}

#[derive(Debug, Clone)]
struct Block {
    ref_count: usize,
    hash: Option<u64>,
    tokens: Vec<u32>,
}

#[derive(Debug)]
struct BlockPool {
    blocks: Vec<Block>,
    hash_to_block: HashMap<u64, BlockId>,
    free: VecDeque<BlockId>,
    used: HashSet<BlockId>,
}

impl BlockPool {
    fn new(num_blocks: usize) -> Self {
        Self {
            blocks: vec![
                Block {
                    ref_count: 0,
                    hash: None,
                    tokens: Vec::new(),
                };
                num_blocks
            ],
            hash_to_block: HashMap::new(),
            free: (0..num_blocks).collect(),
            used: HashSet::new(),
        }
    }

    /// Take the oldest free block and forget what it held
    fn take_free(&mut self) -> Option<BlockId> {
        let id = self.free.pop_front()?;
        let block = &mut self.blocks[id];
        if let Some(h) = block.hash.take() {
            if self.hash_to_block.get(&h) == Some(&id) {
                self.hash_to_block.remove(&h);
            }
        }
        block.tokens.clear();
        block.ref_count = 1;
        self.used.insert(id);
        Some(id)
    }

    /// Share a block that already holds the wanted content
    fn revive(&mut self, id: BlockId) {
        if self.used.contains(&id) {
            self.blocks[id].ref_count += 1;
        } else {
            if let Some(pos) = self.free.iter().position(|&b| b == id) {
                self.free.remove(pos);
            }
            self.blocks[id].ref_count = 1;
            self.used.insert(id);
        }
    }

    fn register(&mut self, id: BlockId, hash: u64, tokens: &[u32]) {
        let block = &mut self.blocks[id];
        block.hash = Some(hash);
        block.tokens = tokens.to_vec();
        self.hash_to_block.insert(hash, id);
    }

    fn lookup(&self, hash: u64, tokens: &[u32]) -> Option<BlockId> {
        let id = *self.hash_to_block.get(&hash)?;
        (self.blocks[id].tokens == tokens).then_some(id)
    }
}

/// Chained content hash of a full block
pub fn block_hash(tokens: &[u32], prefix: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    tokens.hash(&mut hasher);
    hasher.finish()
}

/// Paged KV cache: a fixed pool of blocks with prefix reuse, plus the
/// per-layer tensors the blocks index into.
pub struct PagedKvCache {
    block_size: usize,
    num_blocks: usize,
    bytes_per_block: usize,
    pool: Mutex<BlockPool>,
    layers: Vec<LayerKvCache>,
}

impl PagedKvCache {
    pub fn new(config: &CacheConfig, device: &Device) -> Result<Self> {
        let dtype = config.dtype.as_dtype();
        let num_slots = config.num_blocks * config.block_size;
        let layers = (0..config.num_layers)
            .map(|_| LayerKvCache::zeros(num_slots, config.num_kv_heads, config.head_dim, dtype, device))
            .collect::<Result<Vec<_>>>()?;

        // K and V for every layer
        let bytes_per_block = 2
            * config.num_layers
            * config.block_size
            * config.num_kv_heads
            * config.head_dim
            * dtype.size_in_bytes();

        debug!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            num_layers = config.num_layers,
            "allocated paged kv cache"
        );

        Ok(Self {
            block_size: config.block_size,
            num_blocks: config.num_blocks,
            bytes_per_block,
            pool: Mutex::new(BlockPool::new(config.num_blocks)),
            layers,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.lock().free.len()
    }

    pub fn layers(&self) -> &[LayerKvCache] {
        &self.layers
    }

    /// Registered blocks matching the leading full blocks of `seq`, up to
    /// the first miss. The final block is never served so prefill always
    /// has a query token.
    fn prefix_hits(&self, pool: &BlockPool, seq: &Sequence) -> Vec<BlockId> {
        let mut hits = Vec::new();
        if !seq.is_prefix_cacheable() {
            return hits;
        }
        let mut prefix = None;
        for i in 0..seq.num_blocks().saturating_sub(1) {
            let tokens = seq.block(i);
            let h = block_hash(tokens, prefix);
            match pool.lookup(h, tokens) {
                Some(id) => hits.push(id),
                None => break,
            }
            prefix = Some(h);
        }
        hits
    }
}

impl KvCacheManager for PagedKvCache {
    fn can_allocate(&self, seqs: &[Sequence]) -> bool {
        let pool = self.pool.lock();
        let mut revived = HashSet::new();
        let mut needed = 0;
        for seq in seqs {
            let hits = self.prefix_hits(&pool, seq);
            needed += seq.num_blocks() - hits.len();
            needed += hits
                .into_iter()
                .filter(|id| !pool.used.contains(id) && revived.insert(*id))
                .count();
        }
        needed <= pool.free.len()
    }

    fn allocate(&self, seq: &mut Sequence) -> Result<()> {
        if !seq.block_table().is_empty() {
            return Err(EngineError::Contract("sequence already holds blocks".into()).into());
        }
        let mut pool = self.pool.lock();
        let hits = self.prefix_hits(&pool, seq);
        let needed = seq.num_blocks();
        let revived = hits.iter().filter(|&&id| !pool.used.contains(&id)).count();
        let fresh = needed - hits.len() + revived;
        if fresh > pool.free.len() {
            return Err(EngineError::OutOfBlocks {
                requested: fresh,
                available: pool.free.len(),
            }
            .into());
        }

        // Revive hits first so `take_free` cannot recycle them
        for &id in &hits {
            pool.revive(id);
            seq.push_block(id);
        }
        for _ in hits.len()..needed {
            let id = pool
                .take_free()
                .ok_or_else(|| anyhow!("free list drained during allocation"))?;
            seq.push_block(id);
        }
        seq.set_num_cached_tokens(hits.len() * self.block_size);
        seq.set_num_committed_blocks(hits.len());
        Ok(())
    }

    fn append(&self, seq: &mut Sequence) -> Result<()> {
        if seq.len().div_ceil(self.block_size) > seq.block_table().len() {
            let mut pool = self.pool.lock();
            let available = pool.free.len();
            let id = pool.take_free().ok_or(EngineError::OutOfBlocks {
                requested: 1,
                available,
            })?;
            seq.push_block(id);
        }
        Ok(())
    }

    fn commit(&self, seq: &mut Sequence) -> Result<()> {
        let full = seq.len() / self.block_size;
        let start = seq.num_committed_blocks();
        if !seq.is_prefix_cacheable() || full <= start {
            return Ok(());
        }
        let table = seq.block_table();
        if table.len() < full {
            return Err(EngineError::Contract(format!(
                "{} full blocks but only {} assigned",
                full,
                table.len()
            ))
            .into());
        }

        let mut pool = self.pool.lock();
        let mut prefix = match start {
            0 => None,
            n => pool.blocks[table[n - 1]].hash,
        };
        for (i, &id) in table.iter().enumerate().take(full).skip(start) {
            let tokens = seq.block(i);
            let h = block_hash(tokens, prefix);
            pool.register(id, h, tokens);
            prefix = Some(h);
        }
        drop(pool);
        seq.set_num_committed_blocks(full);
        Ok(())
    }

    fn release(&self, seq: &mut Sequence) {
        let mut pool = self.pool.lock();
        for id in seq.take_block_table().into_iter().rev() {
            let block = &mut pool.blocks[id];
            block.ref_count = block.ref_count.saturating_sub(1);
            if block.ref_count == 0 {
                pool.used.remove(&id);
                pool.free.push_back(id);
            }
        }
        seq.set_num_cached_tokens(0);
        seq.set_num_committed_blocks(0);
    }

    fn wire(&self, model: &mut dyn DecoderModel) -> Result<()> {
        model.bind_kv_cache(self.layers.clone())
    }

    fn stats(&self) -> CacheStats {
        let pool = self.pool.lock();
        CacheStats {
            total_blocks: self.num_blocks,
            free_blocks: pool.free.len(),
            used_blocks: pool.used.len(),
            cached_blocks: pool.hash_to_block.len(),
            memory_per_block_mb: self.bytes_per_block as f64 / 1024.0 / 1024.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    /// Blocks whose content hash is registered for prefix reuse
    pub cached_blocks: usize,
    pub memory_per_block_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheDtype;

    fn small_config(block_size: usize, num_blocks: usize) -> CacheConfig {
        CacheConfig {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            block_size,
            num_blocks,
            dtype: CacheDtype::F32,
        }
    }

    #[test]
    fn test_allocate_and_release() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let mut seq = Sequence::new((0..10).collect(), 4);

        cache.allocate(&mut seq).unwrap();
        assert_eq!(seq.block_table().len(), 3);
        assert_eq!(cache.num_free_blocks(), 5);

        cache.release(&mut seq);
        assert!(seq.block_table().is_empty());
        assert_eq!(cache.num_free_blocks(), 8);
        assert_eq!(cache.stats().used_blocks, 0);
    }

    #[test]
    fn test_out_of_blocks_is_not_partial() {
        let cache = PagedKvCache::new(&small_config(4, 2), &Device::Cpu).unwrap();
        let mut seq = Sequence::new((0..9).collect(), 4);

        let err = cache.allocate(&mut seq).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::OutOfBlocks {
                requested: 3,
                available: 2
            })
        );
        assert!(seq.block_table().is_empty());
        assert_eq!(cache.num_free_blocks(), 2);
        assert!(!cache.can_allocate(std::slice::from_ref(&seq)));
    }

    #[test]
    fn test_append_crosses_block_boundary() {
        let cache = PagedKvCache::new(&small_config(4, 4), &Device::Cpu).unwrap();
        let mut seq = Sequence::new(vec![1, 2, 3, 4], 4);
        cache.allocate(&mut seq).unwrap();
        assert_eq!(seq.block_table().len(), 1);

        seq.append_token(5);
        cache.append(&mut seq).unwrap();
        assert_eq!(seq.block_table().len(), 2);
        assert_eq!(seq.last_slot(), Some(seq.block_table()[1] * 4));

        seq.append_token(6);
        cache.append(&mut seq).unwrap();
        assert_eq!(seq.block_table().len(), 2);
    }

    #[test]
    fn test_prefix_reuse_skips_final_block() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = (0..12).collect();

        let mut first = Sequence::new(prompt.clone(), 4);
        cache.allocate(&mut first).unwrap();
        assert_eq!(first.num_cached_tokens(), 0);
        cache.commit(&mut first).unwrap();

        let mut second = Sequence::new(prompt, 4);
        cache.allocate(&mut second).unwrap();
        assert_eq!(second.num_cached_tokens(), 8);
        assert_eq!(&second.block_table()[..2], &first.block_table()[..2]);
        assert_ne!(second.block_table()[2], first.block_table()[2]);

        cache.release(&mut second);
        cache.release(&mut first);
        assert_eq!(cache.num_free_blocks(), 8);
    }

    #[test]
    fn test_released_blocks_stay_reusable() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = (0..9).collect();

        let mut first = Sequence::new(prompt.clone(), 4);
        cache.allocate(&mut first).unwrap();
        cache.commit(&mut first).unwrap();
        let shared = first.block_table()[0];
        cache.release(&mut first);

        let mut second = Sequence::new(prompt, 4);
        cache.allocate(&mut second).unwrap();
        assert_eq!(second.block_table()[0], shared);
        assert_eq!(second.num_cached_tokens(), 8);
    }

    #[test]
    fn test_opted_out_sequences_never_hit() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = vec![1; 12];

        let mut first = Sequence::new(prompt.clone(), 4).without_prefix_cache();
        cache.allocate(&mut first).unwrap();
        cache.commit(&mut first).unwrap();
        let mut second = Sequence::new(prompt, 4).without_prefix_cache();
        cache.allocate(&mut second).unwrap();

        assert_eq!(second.num_cached_tokens(), 0);
        assert_eq!(cache.stats().cached_blocks, 0);
        assert_eq!(cache.num_free_blocks(), 2);
    }

    #[test]
    fn test_uncommitted_blocks_are_not_reused() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = (0..9).collect();

        // Allocated but never written, e.g. the prefill forward failed
        let mut first = Sequence::new(prompt.clone(), 4);
        cache.allocate(&mut first).unwrap();
        cache.release(&mut first);
        assert_eq!(cache.stats().cached_blocks, 0);

        let mut second = Sequence::new(prompt, 4);
        cache.allocate(&mut second).unwrap();
        assert_eq!(second.num_cached_tokens(), 0);
    }

    #[test]
    fn test_append_defers_registration_to_commit() {
        let cache = PagedKvCache::new(&small_config(4, 8), &Device::Cpu).unwrap();
        let mut seq = Sequence::new(vec![1, 2, 3], 4);
        cache.allocate(&mut seq).unwrap();
        cache.commit(&mut seq).unwrap();

        // The fourth token fills block 0 but its KV entry is not written yet
        seq.append_token(4);
        cache.append(&mut seq).unwrap();
        assert_eq!(cache.stats().cached_blocks, 0);

        seq.append_token(5);
        cache.append(&mut seq).unwrap();
        cache.commit(&mut seq).unwrap();
        assert_eq!(cache.stats().cached_blocks, 1);
        cache.release(&mut seq);

        let mut next = Sequence::new(vec![1, 2, 3, 4, 9], 4);
        cache.allocate(&mut next).unwrap();
        assert_eq!(next.num_cached_tokens(), 4);
    }

    #[test]
    fn test_commit_chains_after_prefix_hit() {
        let cache = PagedKvCache::new(&small_config(2, 8), &Device::Cpu).unwrap();
        let mut first = Sequence::new(vec![1, 2, 3], 2);
        cache.allocate(&mut first).unwrap();
        cache.commit(&mut first).unwrap();
        cache.release(&mut first);

        let mut second = Sequence::new(vec![1, 2, 3, 4, 5], 2);
        cache.allocate(&mut second).unwrap();
        assert_eq!(second.num_cached_tokens(), 2);
        cache.commit(&mut second).unwrap();
        assert_eq!(cache.stats().cached_blocks, 2);
        cache.release(&mut second);

        let mut third = Sequence::new(vec![1, 2, 3, 4, 6], 2);
        cache.allocate(&mut third).unwrap();
        assert_eq!(third.num_cached_tokens(), 4);
    }

    #[test]
    fn test_can_allocate_counts_shared_prefix() {
        let cache = PagedKvCache::new(&small_config(4, 4), &Device::Cpu).unwrap();
        let prompt: Vec<u32> = (0..9).collect();

        let mut holder = Sequence::new(prompt.clone(), 4);
        cache.allocate(&mut holder).unwrap();
        cache.commit(&mut holder).unwrap();
        assert_eq!(cache.num_free_blocks(), 1);

        // Two live blocks are shared, only the final block needs a free one
        let seq = Sequence::new(prompt.clone(), 4);
        assert!(cache.can_allocate(std::slice::from_ref(&seq)));
        let pair = vec![seq.clone(), Sequence::new(prompt, 4)];
        assert!(!cache.can_allocate(&pair));

        let mut seq = seq;
        cache.allocate(&mut seq).unwrap();
        assert_eq!(seq.num_cached_tokens(), 8);
        assert_eq!(cache.num_free_blocks(), 0);
    }

    #[test]
    fn test_store_and_gather() {
        let layer = LayerKvCache::zeros(8, 2, 2, DType::F32, &Device::Cpu).unwrap();
        let k = Tensor::new(&[[[1f32, 1.], [1., 1.]], [[2., 2.], [2., 2.]]], &Device::Cpu).unwrap();
        let v = (&k * 10.0).unwrap();

        layer.store(&k, &v, &[5, -1]).unwrap();
        let (k_read, v_read) = layer.gather(&[5, 0]).unwrap();

        let k_vals: Vec<f32> = k_read.flatten_all().unwrap().to_vec1().unwrap();
        let v_vals: Vec<f32> = v_read.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(k_vals, vec![1., 1., 1., 1., 0., 0., 0., 0.]);
        assert_eq!(v_vals, vec![10., 10., 10., 10., 0., 0., 0., 0.]);
    }

    #[test]
    fn test_context_slots_follow_block_table() {
        assert_eq!(context_slots(&[3, 1], 2, 3), vec![6, 7, 2]);
    }
}
