//! Free-list allocators for the index and payload areas
//!
//! Each area keeps a singly linked list of free blocks, ordered by address.
//! A free block stores its own bookkeeping in place:
//!
//! ```text
//! [0..4] size       bytes in this block, including the bookkeeping
//! [4..8] next_free  offset of the next free block, 0 terminates
//! ```
//!
//! Allocation is first-fit and splits the front of a block off. Freeing
//! splices the block back in address order and merges it with the
//! neighbouring free blocks on both sides.

use crate::error::{OdbError, OdbResult};
use crate::format::{align8, header_field, ALIGN, FREE_BLOCK_SIZE};
use crate::region::{fatal, Mem};

/// Which of the two areas an allocator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    /// Keys and key lists
    Key,
    /// Leaf payloads
    Data,
}

impl Area {
    pub fn name(self) -> &'static str {
        match self {
            Area::Key => "key",
            Area::Data => "data",
        }
    }
}

/// Allocator over one area of a mapped region.
#[derive(Clone, Copy)]
pub(crate) struct FreeList {
    mem: Mem,
    area: Area,
    start: u32,
    end: u32,
    head_field: usize,
}

impl FreeList {
    pub fn new(mem: Mem, area: Area) -> Self {
        let header = mem.header();
        let (start, size, head_field) = match area {
            Area::Key => (header.key_area_start(), header.key_size, header_field::FIRST_FREE_KEY),
            Area::Data => (header.data_area_start(), header.data_size, header_field::FIRST_FREE_DATA),
        };
        Self {
            mem,
            area,
            start,
            end: start + size,
            head_field,
        }
    }

    /// Make the whole area one free block.
    pub fn format(&self) {
        self.mem.fill(self.start as usize, (self.end - self.start) as usize, 0);
        self.set_block(self.start, self.end - self.start, 0);
        self.set_head(self.start);
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn area_size(&self) -> u32 {
        self.end - self.start
    }

    /// True if `[offset, offset + len)` lies inside this area.
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset >= self.start && (offset as u64 + len as u64) <= self.end as u64
    }

    fn head(&self) -> u32 {
        self.mem.u32_at(self.head_field)
    }

    fn set_head(&self, offset: u32) {
        self.mem.set_u32(self.head_field, offset);
    }

    fn block(&self, offset: u32) -> (u32, u32) {
        (self.mem.u32_at(offset as usize), self.mem.u32_at(offset as usize + 4))
    }

    fn set_block(&self, offset: u32, size: u32, next: u32) {
        self.mem.set_u32(offset as usize, size);
        self.mem.set_u32(offset as usize + 4, next);
    }

    /// Minimum block size for a request: aligned and able to host a FreeBlock.
    fn block_size(size: u32) -> u32 {
        align8(size).max(FREE_BLOCK_SIZE)
    }

    fn check_block(&self, offset: u32, size: u32) -> Result<(), String> {
        if offset % ALIGN != 0 || !self.contains(offset, FREE_BLOCK_SIZE) {
            return Err(format!("free block offset {} outside {} area", offset, self.area.name()));
        }
        if size < FREE_BLOCK_SIZE || size % ALIGN != 0 || !self.contains(offset, size) {
            return Err(format!("free block at {} has invalid size {}", offset, size));
        }
        Ok(())
    }

    /// Allocate `size` bytes, zero-filled. Returns 0 when no block fits.
    pub fn alloc(&self, size: u32) -> u32 {
        let need = Self::block_size(size);
        let mut prev = 0u32;
        let mut cur = self.head();
        let mut steps = 0u32;

        while cur != 0 {
            let (block_size, next) = self.block(cur);
            if let Err(reason) = self.check_block(cur, block_size) {
                fatal(&reason);
            }
            steps += 1;
            if steps > self.area_size() / FREE_BLOCK_SIZE {
                fatal(&format!("cycle in {} free list", self.area.name()));
            }

            if block_size >= need {
                let successor = if block_size > need {
                    let rest = cur + need;
                    self.set_block(rest, block_size - need, next);
                    rest
                } else {
                    next
                };
                if prev == 0 {
                    self.set_head(successor);
                } else {
                    self.mem.set_u32(prev as usize + 4, successor);
                }
                self.mem.fill(cur as usize, need as usize, 0);
                return cur;
            }

            prev = cur;
            cur = next;
        }
        0
    }

    /// Return a block to the free list, merging with adjacent free blocks.
    ///
    /// A block outside the area, misaligned, or overlapping a block that is
    /// already free is reported as corruption and the list is left untouched.
    pub fn free(&self, offset: u32, size: u32) -> OdbResult<()> {
        let size = Self::block_size(size);
        if offset % ALIGN != 0 || !self.contains(offset, size) {
            return Err(OdbError::Corrupted {
                offset,
                reason: format!("free of {} bytes outside {} area", size, self.area.name()),
            });
        }

        let mut prev = 0u32;
        let mut next = self.head();
        let mut steps = 0u32;
        while next != 0 && next < offset {
            let (block_size, successor) = self.block(next);
            self.check_block(next, block_size)
                .map_err(|reason| OdbError::Corrupted { offset: next, reason })?;
            steps += 1;
            if (successor != 0 && successor <= next) || steps > self.area_size() / FREE_BLOCK_SIZE {
                return Err(OdbError::Corrupted {
                    offset: next,
                    reason: format!("cycle in {} free list", self.area.name()),
                });
            }
            prev = next;
            next = successor;
        }
        if next != 0 {
            let (block_size, _) = self.block(next);
            self.check_block(next, block_size)
                .map_err(|reason| OdbError::Corrupted { offset: next, reason })?;
        }

        if next != 0 && offset + size > next {
            return Err(OdbError::Corrupted {
                offset,
                reason: format!("double free: block overlaps free block at {}", next),
            });
        }
        if prev != 0 {
            let (prev_size, _) = self.block(prev);
            if prev + prev_size > offset {
                return Err(OdbError::Corrupted {
                    offset,
                    reason: format!("double free: block overlaps free block at {}", prev),
                });
            }
        }

        self.mem.fill(offset as usize, size as usize, 0);

        // merge forward
        let (mut new_size, mut new_next) = (size, next);
        if next != 0 && offset + size == next {
            let (next_size, next_next) = self.block(next);
            new_size += next_size;
            new_next = next_next;
            self.set_block(next, 0, 0);
        }

        // merge backward
        if prev != 0 {
            let (prev_size, _) = self.block(prev);
            if prev + prev_size == offset {
                self.set_block(prev, prev_size + new_size, new_next);
                self.set_block(offset, 0, 0);
                return Ok(());
            }
            self.mem.set_u32(prev as usize + 4, offset);
        } else {
            self.set_head(offset);
        }
        self.set_block(offset, new_size, new_next);
        Ok(())
    }

    /// Move an allocation to a block of `new_size`. Returns 0 (and leaves the
    /// old block intact) when the area has no room.
    pub fn realloc(&self, offset: u32, old_size: u32, new_size: u32) -> OdbResult<u32> {
        if offset == 0 {
            return Ok(self.alloc(new_size));
        }
        if Self::block_size(old_size) == Self::block_size(new_size) {
            return Ok(offset);
        }
        let moved = self.alloc(new_size);
        if moved == 0 {
            return Ok(0);
        }
        self.mem.copy(offset as usize, moved as usize, old_size.min(new_size) as usize);
        self.free(offset, old_size)?;
        Ok(moved)
    }

    /// Walk the list, verifying bounds, order and termination.
    pub fn blocks(&self) -> OdbResult<Vec<(u32, u32)>> {
        let mut out = Vec::new();
        let mut cur = self.head();
        let mut last_end = 0u32;
        while cur != 0 {
            let (size, next) = self.block(cur);
            self.check_block(cur, size)
                .map_err(|reason| OdbError::Corrupted { offset: cur, reason })?;
            if cur < last_end {
                return Err(OdbError::Corrupted {
                    offset: cur,
                    reason: format!("{} free list not in address order (cycle?)", self.area.name()),
                });
            }
            last_end = cur + size;
            out.push((cur, size));
            if out.len() as u32 > self.area_size() / FREE_BLOCK_SIZE {
                return Err(OdbError::Corrupted {
                    offset: cur,
                    reason: format!("cycle in {} free list", self.area.name()),
                });
            }
            cur = next;
        }
        Ok(out)
    }

    pub fn free_bytes(&self) -> OdbResult<u64> {
        Ok(self.blocks()?.iter().map(|&(_, size)| size as u64).sum())
    }
}
