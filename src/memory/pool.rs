use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::Memory;
use crate::util::lock;

/// Block sizes of every tier, smallest first.
pub const TIERS: [usize; 5] = [64, 256, 1024, 4096, 16384];

/// Blocks a single buffer may be made of.
pub const MAX_BLOCKS: usize = 4;

/// Largest length a buffer can hold.
pub const MAX_LENGTH: usize = TIERS[TIERS.len() - 1] * MAX_BLOCKS;

/// The tier whose blocks fit `length` in at most [`MAX_BLOCKS`] blocks.
pub(crate) fn tier_for(length: usize) -> usize {
    TIERS
        .iter()
        .position(|size| length < size * MAX_BLOCKS)
        .unwrap_or(TIERS.len() - 1)
}

/// A tiered free list of fixed size blocks.
///
/// Both the application thread and the worker allocate from the same pool:
/// payloads are copied into pooled memory by `Peer::send` and released by
/// the worker once acknowledged, received payloads go the other way.
#[derive(Debug, Default)]
pub struct MemoryPool {
    tiers: [Mutex<Vec<Box<[u8]>>>; 5],
    generation: AtomicU64,
}

impl MemoryPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a buffer of `length` bytes. Blocks are recycled, so the
    /// content is unspecified until written.
    pub fn allocate(self: &Arc<Self>, length: usize) -> Memory {
        let mut memory = Memory::empty(self.clone());
        memory.set_len(length);
        memory
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn copy_of(self: &Arc<Self>, data: &[u8]) -> Memory {
        let mut memory = self.allocate(data.len());
        memory.copy_from(0, data);
        memory
    }

    /// Number of times a buffer was returned to the pool.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Free blocks held by a tier.
    pub fn available(&self, tier: usize) -> usize {
        lock(&self.tiers[tier]).len()
    }

    pub(crate) fn take(&self, tier: usize) -> Box<[u8]> {
        lock(&self.tiers[tier])
            .pop()
            .unwrap_or_else(|| vec![0u8; TIERS[tier]].into_boxed_slice())
    }

    pub(crate) fn give_back(&self, tier: usize, blocks: Vec<Box<[u8]>>) {
        if blocks.is_empty() {
            return;
        }
        lock(&self.tiers[tier]).extend(blocks);
    }

    pub(crate) fn release(&self, tier: usize, blocks: Vec<Box<[u8]>>) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.give_back(tier, blocks);
    }
}
