//! Pooled byte buffers.
//!
//! A [`Memory`] is a logically contiguous buffer assembled from up to four
//! blocks of one pool tier. It grows by appending blocks of its tier while
//! they suffice and migrates to a larger tier otherwise. Dropping it hands
//! the blocks back to its [`MemoryPool`].
pub mod pool;

use std::fmt;
use std::sync::Arc;

pub use self::pool::{MemoryPool, MAX_LENGTH};
use self::pool::{tier_for, MAX_BLOCKS, TIERS};

pub struct Memory {
    pool: Arc<MemoryPool>,
    tier: usize,
    blocks: Vec<Box<[u8]>>,
    len: usize,
}

impl Memory {
    pub(crate) fn empty(pool: Arc<MemoryPool>) -> Self {
        Self {
            pool,
            tier: 0,
            blocks: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn block_size(&self) -> usize {
        TIERS[self.tier]
    }

    fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size()
    }

    /// Resizes the buffer. New bytes are unspecified.
    ///
    /// Lengths above [`MAX_LENGTH`] are truncated to it.
    pub fn set_len(&mut self, len: usize) {
        let len = len.min(MAX_LENGTH);
        if len > self.capacity() {
            let needed = (len + self.block_size() - 1) / self.block_size();
            if needed <= MAX_BLOCKS && tier_for(len) <= self.tier {
                while self.blocks.len() < needed {
                    self.blocks.push(self.pool.take(self.tier));
                }
            } else {
                self.migrate(tier_for(len), len);
            }
        }
        self.len = len;
    }

    /// Moves the content into blocks of another tier.
    fn migrate(&mut self, tier: usize, len: usize) {
        let size = TIERS[tier];
        let count = (len + size - 1) / size;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(self.pool.take(tier));
        }
        let old = std::mem::replace(&mut self.blocks, blocks);
        let old_tier = std::mem::replace(&mut self.tier, tier);
        let old_size = TIERS[old_tier];
        let mut offset = 0;
        for block in old.iter() {
            if offset >= self.len {
                break;
            }
            let end = (offset + old_size).min(self.len);
            let chunk = &block[..end - offset];
            self.write_at(offset, chunk);
            offset = end;
        }
        self.pool.give_back(old_tier, old);
    }

    /// Copies `src` into the buffer without changing its length.
    fn write_at(&mut self, mut offset: usize, mut src: &[u8]) {
        let size = self.block_size();
        while !src.is_empty() {
            let block = &mut self.blocks[offset / size];
            let start = offset % size;
            let n = (size - start).min(src.len());
            block[start..start + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            offset += n;
        }
    }

    /// Writes `src` at `offset`, growing the buffer if it ends past the
    /// current length.
    pub fn copy_from(&mut self, offset: usize, src: &[u8]) {
        let end = (offset + src.len()).min(MAX_LENGTH);
        if end > self.len {
            self.set_len(end);
        }
        let src = &src[..end.saturating_sub(offset)];
        self.write_at(offset, src);
    }

    /// Fills `dst` from `offset`. Returns how many bytes were copied.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks_from(offset) {
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    /// Overwrites two bytes in big endian order.
    pub fn overwrite_u16(&mut self, offset: usize, value: u16) {
        if offset + 2 <= self.len {
            self.write_at(offset, &value.to_be_bytes());
        }
    }

    /// Appends the whole content to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for chunk in self.chunks_from(0) {
            out.extend_from_slice(chunk);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        self.write_to(&mut out);
        out
    }

    /// The content as contiguous slices, one per block.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks_from(0)
    }

    fn chunks_from(&self, offset: usize) -> impl Iterator<Item = &[u8]> {
        let size = self.block_size();
        let len = self.len;
        self.blocks
            .iter()
            .enumerate()
            .filter_map(move |(i, block)| {
                let start = (i * size).max(offset);
                let end = ((i + 1) * size).min(len);
                if start >= end {
                    None
                } else {
                    Some(&block[start - i * size..end - i * size])
                }
            })
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        self.pool.release(self.tier, blocks);
    }
}

impl PartialEq<[u8]> for Memory {
    fn eq(&self, other: &[u8]) -> bool {
        if self.len != other.len() {
            return false;
        }
        let mut offset = 0;
        for chunk in self.chunks() {
            if chunk != &other[offset..offset + chunk.len()] {
                return false;
            }
            offset += chunk.len();
        }
        true
    }
}

impl PartialEq<&[u8]> for Memory {
    fn eq(&self, other: &&[u8]) -> bool {
        *self == **other
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("len", &self.len)
            .field("block_size", &self.block_size())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}
