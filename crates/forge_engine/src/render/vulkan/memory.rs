//! TLSF suballocation pool
//!
//! An implementation of the two-level segregated fit algorithm for video
//! memory. A [`MemoryPool`] manages a fixed-size span of a device memory
//! object and subdivides it into variable-size blocks in O(1). The first
//! level of size classes is spread across powers of two; each first level is
//! made up of 32 linearly spaced second levels. A bitset per first level
//! tracks which second levels have free blocks, and a single bitset tracks
//! which first levels are non-empty, so a suitable bucket is found with two
//! find-first-set operations and no list walking.
//!
//! Each bucket heads a doubly linked free list threaded through the block
//! headers. Blocks are also part of a circular doubly linked *physical* list
//! in address order, used to coalesce free neighbours on free and to donate
//! alignment padding to a free predecessor on allocate.
//!
//! Since this allocator manages external (GPU) memory, block headers cannot
//! live inside the managed space; they are kept in a slotmap arena keyed by
//! [`BlockId`].

use slotmap::{new_key_type, Key, SlotMap};

const SL_COUNT_LOG2: u32 = 5;
const SL_COUNT: u32 = 1 << SL_COUNT_LOG2;
const ALIGN_LOG2: u32 = 8;
const FL_OFFSET: u32 = SL_COUNT_LOG2 + ALIGN_LOG2;
const FL_COUNT: usize = (SL_COUNT - FL_OFFSET + 1) as usize;

/// Smallest block size the pool will produce; also the guaranteed alignment
/// of every block offset.
pub const MINIMUM_ALLOCATION_SIZE: u32 = 1 << ALIGN_LOG2;

new_key_type! {
    /// Handle to a block within a pool.
    pub struct BlockId;
}

/// One entry of a [`MemoryPool::ranges`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Offset of the block
    pub start: u32,
    /// Size of the block
    pub size: u32,
    /// Whether the block is free
    pub free: bool,
}

/// A block header: physical placement plus free-list links.
#[derive(Debug, Default)]
struct MemoryBlock {
    offset: u32,
    size: u32,
    is_free: bool,
    prev_free: Option<BlockId>,
    next_free: Option<BlockId>,
    prev_phys: BlockId,
    next_phys: BlockId,
}

const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

fn size_mapping(size: u32) -> (usize, usize) {
    debug_assert!(size >= MINIMUM_ALLOCATION_SIZE);

    // First level index is simply the power of two size class. Normalize the
    // size into the second-level range and mask away the top bit so the
    // resulting index stays in range, then offset the first level so the
    // first size class corresponds to the minimum allocation size.
    let fl_index = size.ilog2();
    let sl_index = (size >> (fl_index - SL_COUNT_LOG2)) & !SL_COUNT;
    ((fl_index - ALIGN_LOG2) as usize, sl_index as usize)
}

/// A TLSF pool over a `[0, total_size)` address space.
#[derive(Debug)]
pub struct MemoryPool {
    blocks: SlotMap<BlockId, MemoryBlock>,
    root_block: BlockId,
    total_size: u32,
    used_size: u32,
    fl_bitset: u32,
    sl_bitsets: [u32; FL_COUNT],
    free_map: [[Option<BlockId>; SL_COUNT as usize]; FL_COUNT],
}

impl MemoryPool {
    /// Creates a pool spanning `total_size` bytes, starting as one free block.
    pub fn new(total_size: u32) -> Self {
        debug_assert!(total_size >= MINIMUM_ALLOCATION_SIZE);
        debug_assert!(total_size % MINIMUM_ALLOCATION_SIZE == 0);
        let mut pool = Self {
            blocks: SlotMap::with_key(),
            root_block: BlockId::null(),
            total_size,
            used_size: 0,
            fl_bitset: 0,
            sl_bitsets: [0; FL_COUNT],
            free_map: [[None; SL_COUNT as usize]; FL_COUNT],
        };
        let root = pool.blocks.insert(MemoryBlock {
            size: total_size,
            ..MemoryBlock::default()
        });
        pool.blocks[root].prev_phys = root;
        pool.blocks[root].next_phys = root;
        pool.root_block = root;
        pool.link_block(root);
        pool
    }

    /// Total managed bytes.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Bytes currently handed out.
    pub fn used_size(&self) -> u32 {
        self.used_size
    }

    /// Offset of an allocated block.
    pub fn block_offset(&self, id: BlockId) -> u32 {
        self.blocks[id].offset
    }

    /// Size of an allocated block.
    pub fn block_size(&self, id: BlockId) -> u32 {
        self.blocks[id].size
    }

    // Insert a block at the head of its bucket's free list.
    fn link_block(&mut self, id: BlockId) {
        let (fl_index, sl_index) = {
            let block = &self.blocks[id];
            debug_assert!(!block.is_free, "linking already-free block");
            debug_assert!(block.prev_free.is_none() && block.next_free.is_none());
            size_mapping(block.size)
        };

        let old_head = self.free_map[fl_index][sl_index].replace(id);
        {
            let block = &mut self.blocks[id];
            block.is_free = true;
            block.next_free = old_head;
        }
        if let Some(old_head) = old_head {
            self.blocks[old_head].prev_free = Some(id);
        }

        self.fl_bitset |= 1 << fl_index;
        self.sl_bitsets[fl_index] |= 1 << sl_index;
    }

    fn unlink_block(&mut self, id: BlockId, fl_index: usize, sl_index: usize) {
        let (prev_free, next_free) = {
            let block = &mut self.blocks[id];
            debug_assert!(block.is_free);
            block.is_free = false;
            (block.prev_free.take(), block.next_free.take())
        };

        if let Some(prev_free) = prev_free {
            self.blocks[prev_free].next_free = next_free;
        }
        if let Some(next_free) = next_free {
            self.blocks[next_free].prev_free = prev_free;
        }

        if self.free_map[fl_index][sl_index] != Some(id) {
            // Block wasn't the head of its free list.
            return;
        }

        // Update the list head; if the class emptied, clear the bitset bits.
        self.free_map[fl_index][sl_index] = next_free;
        if next_free.is_none() {
            self.sl_bitsets[fl_index] &= !(1 << sl_index);
            if self.sl_bitsets[fl_index] == 0 {
                self.fl_bitset &= !(1 << fl_index);
            }
        }
    }

    /// Allocates a block of at least `size` bytes whose offset is a multiple
    /// of `alignment` (a power of two). Returns `None` when the pool cannot
    /// satisfy the request.
    pub fn allocate(&mut self, size: u32, alignment: u32) -> Option<BlockId> {
        debug_assert!(alignment.is_power_of_two());
        let size = size.max(MINIMUM_ALLOCATION_SIZE);

        // Search for a block that can accomodate the worst-case offset
        // misalignment, rounded up to the next size class so an in-between
        // second-level size never returns a too-small block.
        let mut search_size = size.checked_add(alignment - 1)?;
        search_size = align_up(search_size, 1 << (search_size.ilog2() - SL_COUNT_LOG2));
        if search_size > self.total_size {
            return None;
        }

        // Check the free list of the optimal size class first; if its bitset
        // bit is clear, fall up to any usable first level.
        let (mut fl_index, sl_index) = size_mapping(search_size);
        let mut sl_bitset = self.sl_bitsets[fl_index] & (!0u32 << sl_index);
        if sl_bitset == 0 {
            let fl_bitset = self.fl_bitset & (!0u32).checked_shl(fl_index as u32 + 1)?;
            if fl_bitset == 0 {
                // The pool is exhausted for sizes >= `size`.
                return None;
            }
            fl_index = fl_bitset.trailing_zeros() as usize;
            sl_bitset = self.sl_bitsets[fl_index];
        }
        let sl_index = sl_bitset.trailing_zeros() as usize;

        let id = self.free_map[fl_index][sl_index].expect("bitset/list mismatch");
        debug_assert!(self.blocks[id].is_free, "allocating non-free block");
        debug_assert!(self.blocks[id].size >= size, "allocating too-small block");
        self.unlink_block(id, fl_index, sl_index);

        // Deal with any padding resulting from alignment.
        let padding = align_up(self.blocks[id].offset, alignment) - self.blocks[id].offset;
        if padding > 0 {
            // Blocks are never misaligned to the minimum size, so the padding
            // is always itself a usable block size.
            debug_assert!(padding >= MINIMUM_ALLOCATION_SIZE);

            let prev = self.blocks[id].prev_phys;
            if self.blocks[prev].is_free && self.blocks[prev].offset < self.blocks[id].offset {
                // Donate the padding to the free previous neighbour,
                // relinking it if it moves up a size class.
                let prev_size = self.blocks[prev].size;
                let (old_fl, old_sl) = size_mapping(prev_size);
                let (new_fl, new_sl) = size_mapping(prev_size + padding);
                if (old_fl, old_sl) != (new_fl, new_sl) {
                    self.unlink_block(prev, old_fl, old_sl);
                    self.blocks[prev].size += padding;
                    self.link_block(prev);
                } else {
                    self.blocks[prev].size += padding;
                }
            } else {
                // Otherwise split the padding off into its own free block
                // before this one.
                let offset = self.blocks[id].offset;
                let padding_block = self.blocks.insert(MemoryBlock {
                    offset,
                    size: padding,
                    next_phys: id,
                    ..MemoryBlock::default()
                });
                let prev = std::mem::replace(&mut self.blocks[id].prev_phys, padding_block);
                self.blocks[padding_block].prev_phys = prev;
                self.blocks[prev].next_phys = padding_block;
                if self.root_block == id {
                    self.root_block = padding_block;
                }
                self.link_block(padding_block);
            }

            let block = &mut self.blocks[id];
            block.offset += padding;
            block.size -= padding;
            debug_assert!(block.offset % alignment == 0);
            debug_assert!(block.size >= size);
        }

        // Split the tail off if the block is big enough, keeping our offset
        // aligned by placing the remainder after the allocation. The size is
        // aligned up so every block stays divisible by the minimum size.
        let aligned_size = align_up(size, MINIMUM_ALLOCATION_SIZE);
        if self.blocks[id].size - aligned_size >= MINIMUM_ALLOCATION_SIZE {
            let remainder = self.blocks.insert(MemoryBlock {
                offset: self.blocks[id].offset + aligned_size,
                size: self.blocks[id].size - aligned_size,
                prev_phys: id,
                ..MemoryBlock::default()
            });
            self.blocks[id].size = aligned_size;
            let next = std::mem::replace(&mut self.blocks[id].next_phys, remainder);
            self.blocks[remainder].next_phys = next;
            self.blocks[next].prev_phys = remainder;
            self.link_block(remainder);
        }

        self.used_size += self.blocks[id].size;
        Some(id)
    }

    /// Returns a block to the pool, coalescing with free physical neighbours.
    pub fn free(&mut self, id: BlockId) {
        debug_assert!(!self.blocks[id].is_free, "double free");
        self.used_size -= self.blocks[id].size;

        // The offset comparisons detect wrap-around in the circular physical
        // list; the root block never coalesces backwards.
        let prev = self.blocks[id].prev_phys;
        if self.blocks[prev].is_free && self.blocks[prev].offset < self.blocks[id].offset {
            let (fl_index, sl_index) = size_mapping(self.blocks[prev].size);
            self.unlink_block(prev, fl_index, sl_index);

            // Consume `prev` into the freed block.
            let prev_block = self.blocks.remove(prev).unwrap();
            let block = &mut self.blocks[id];
            block.offset -= prev_block.size;
            block.size += prev_block.size;
            block.prev_phys = prev_block.prev_phys;
            let new_prev = prev_block.prev_phys;
            self.blocks[new_prev].next_phys = id;
            if self.root_block == prev {
                self.root_block = id;
            }
        }

        let next = self.blocks[id].next_phys;
        if self.blocks[next].is_free && self.blocks[next].offset > self.blocks[id].offset {
            debug_assert!(self.root_block != next);
            let (fl_index, sl_index) = size_mapping(self.blocks[next].size);
            self.unlink_block(next, fl_index, sl_index);

            // Consume `next` into the freed block.
            let next_block = self.blocks.remove(next).unwrap();
            let block = &mut self.blocks[id];
            block.size += next_block.size;
            block.next_phys = next_block.next_phys;
            let new_next = next_block.next_phys;
            self.blocks[new_next].prev_phys = id;
        }

        self.link_block(id);
    }

    /// Size of the largest free block, or 0 when the pool is full.
    pub fn largest_free_block_size(&self) -> u32 {
        if self.fl_bitset == 0 {
            return 0;
        }
        let fl_index = (31 - self.fl_bitset.leading_zeros()) as usize;
        let sl_index = (31 - self.sl_bitsets[fl_index].leading_zeros()) as usize;
        let head = self.free_map[fl_index][sl_index].expect("bitset/list mismatch");
        self.blocks[head].size
    }

    /// Snapshot of the physical block list in address order, for debugging
    /// fragmentation.
    pub fn ranges(&self) -> Vec<BlockRange> {
        let mut ranges = Vec::new();
        let mut cursor = self.root_block;
        loop {
            let block = &self.blocks[cursor];
            ranges.push(BlockRange {
                start: block.offset,
                size: block.size,
                free: block.is_free,
            });
            cursor = block.next_phys;
            if cursor == self.root_block {
                return ranges;
            }
        }
    }

    /// Checks every structural invariant; logs and returns false on the
    /// first violation found.
    pub fn validate(&self) -> bool {
        if self.blocks[self.root_block].offset != 0 {
            log::error!("root block not at zero");
            return false;
        }

        // Validate free lists against the bitsets and sum free bytes.
        let mut free_size = 0u64;
        for fl_index in 0..FL_COUNT {
            let fl_empty = self.fl_bitset & (1 << fl_index) == 0;
            for sl_index in 0..SL_COUNT as usize {
                let sl_empty = self.sl_bitsets[fl_index] & (1 << sl_index) == 0;
                let list_empty = self.free_map[fl_index][sl_index].is_none();
                if sl_empty != list_empty || (fl_empty && !sl_empty) {
                    log::error!(
                        "class[{fl_index}][{sl_index}]: flb: {fl_empty}, slb: {sl_empty}, list: {list_empty}"
                    );
                    return false;
                }

                let mut previous = None;
                let mut cursor = self.free_map[fl_index][sl_index];
                while let Some(id) = cursor {
                    let block = &self.blocks[id];
                    if !block.is_free {
                        log::error!("block in class[{fl_index}][{sl_index}] not marked as free");
                        return false;
                    }
                    if block.prev_free != previous {
                        log::error!("block in class[{fl_index}][{sl_index}] has bad prev_free");
                        return false;
                    }
                    free_size += u64::from(block.size);
                    previous = Some(id);
                    cursor = block.next_free;
                }
            }
        }

        if u64::from(self.used_size) + free_size != u64::from(self.total_size) {
            log::error!(
                "used_size ({}) + free_size ({free_size}) != total_size ({})",
                self.used_size,
                self.total_size
            );
            return false;
        }

        // Validate the physical list: continuous, aligned, no overlap.
        let mut previous: Option<BlockId> = None;
        let mut cursor = self.root_block;
        loop {
            let block = &self.blocks[cursor];
            if let Some(previous) = previous {
                let prev_block = &self.blocks[previous];
                if block.prev_phys != previous {
                    log::error!("block at {:#x} has bad prev_phys", block.offset);
                    return false;
                }
                if block.size < MINIMUM_ALLOCATION_SIZE {
                    log::error!("block at {:#x} has bad size {}", block.offset, block.size);
                    return false;
                }
                if block.offset % MINIMUM_ALLOCATION_SIZE != 0 {
                    log::error!("block at {:#x} has bad alignment", block.offset);
                    return false;
                }
                if block.offset < prev_block.offset + prev_block.size {
                    log::error!(
                        "block at [{:#x}, {:#x}] overlaps with previous block",
                        block.offset,
                        block.offset + block.size
                    );
                    return false;
                }
                if block.offset != prev_block.offset + prev_block.size {
                    log::error!(
                        "gap of size {} before block at {:#x}",
                        block.offset - (prev_block.offset + prev_block.size),
                        block.offset
                    );
                    return false;
                }
            }

            previous = Some(cursor);
            cursor = block.next_phys;
            if cursor == self.root_block {
                break;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL_SIZE: u32 = 4 * 1024 * 1024;

    #[test]
    fn fresh_pool_is_one_block() {
        let pool = MemoryPool::new(POOL_SIZE);
        assert!(pool.validate());
        assert_eq!(pool.used_size(), 0);
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }

    #[test]
    fn allocate_free_round_trip() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let block = pool.allocate(4096, 256).unwrap();
        assert!(pool.validate());
        assert_eq!(pool.block_offset(block) % 256, 0);
        assert!(pool.used_size() >= 4096);
        pool.free(block);
        assert!(pool.validate());
        assert_eq!(pool.used_size(), 0);
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }

    #[test]
    fn hundred_blocks_reverse_free_coalesces_fully() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let mut blocks = Vec::new();
        for _ in 0..100 {
            let block = pool.allocate(4096, 256).unwrap();
            assert!(pool.validate());
            blocks.push(block);
        }
        for block in blocks.into_iter().rev() {
            pool.free(block);
            assert!(pool.validate());
        }
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
        assert_eq!(pool.used_size(), 0);
    }

    #[test]
    fn interleaved_free_coalesces() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let a = pool.allocate(8192, 256).unwrap();
        let b = pool.allocate(8192, 256).unwrap();
        let c = pool.allocate(8192, 256).unwrap();
        pool.free(b);
        assert!(pool.validate());
        pool.free(a);
        assert!(pool.validate());
        pool.free(c);
        assert!(pool.validate());
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }

    #[test]
    fn offsets_are_continuous() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let a = pool.allocate(300, 256).unwrap();
        let b = pool.allocate(300, 256).unwrap();
        // 300 rounds up to 512-byte blocks.
        assert_eq!(pool.block_offset(a), 0);
        assert_eq!(pool.block_offset(b), 512);
        assert!(pool.validate());
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn large_alignment_is_respected() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        // Misalign the pool cursor with a small allocation first.
        let small = pool.allocate(256, 256).unwrap();
        let aligned = pool.allocate(4096, 65536).unwrap();
        assert_eq!(pool.block_offset(aligned) % 65536, 0);
        assert!(pool.validate());
        pool.free(small);
        pool.free(aligned);
        assert!(pool.validate());
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }

    #[test]
    fn alignment_padding_becomes_a_free_block() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let a = pool.allocate(256, 256).unwrap();
        let b = pool.allocate(256, 256).unwrap();
        pool.free(a);
        // The aligned allocation carves its padding off into a reusable
        // free block rather than leaking it.
        let c = pool.allocate(4096, 4096).unwrap();
        assert_eq!(pool.block_offset(c) % 4096, 0);
        assert!(pool.validate());
        pool.free(b);
        pool.free(c);
        assert!(pool.validate());
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = MemoryPool::new(1024 * 1024);
        assert!(pool.allocate(2 * 1024 * 1024, 256).is_none());
        // The search size includes worst-case alignment padding, so claiming
        // the whole pool only fits with the minimum alignment.
        let all = pool.allocate(1024 * 1024, 1).unwrap();
        assert_eq!(pool.used_size(), 1024 * 1024);
        assert!(pool.allocate(256, 256).is_none());
        assert_eq!(pool.largest_free_block_size(), 0);
        pool.free(all);
        assert!(pool.validate());
    }

    #[test]
    fn many_mixed_sizes_stay_consistent() {
        let mut pool = MemoryPool::new(POOL_SIZE);
        let mut live = Vec::new();
        // Deterministic pseudo-random sequence.
        let mut state = 0x2545_f491u32;
        for i in 0..400 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let size = 256 + (state % 20_000);
            let alignment = 1 << (8 + (state % 5));
            if let Some(block) = pool.allocate(size, alignment) {
                assert_eq!(pool.block_offset(block) % alignment, 0);
                live.push(block);
            }
            if i % 3 == 0 && !live.is_empty() {
                let index = (state as usize) % live.len();
                pool.free(live.swap_remove(index));
            }
            assert!(pool.validate(), "invariants broken at iteration {i}");
        }
        for block in live {
            pool.free(block);
        }
        assert!(pool.validate());
        assert_eq!(pool.used_size(), 0);
        assert_eq!(pool.largest_free_block_size(), POOL_SIZE);
    }
}
