pub const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena exhausted: requested {requested} bytes, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
    #[error("only the most recent allocation can grow")]
    NotLast,
}

/// A region handed out by [`FrameArena::alloc`]. Only valid until the next reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBlock {
    offset: usize,
    len: usize,
    epoch: u32,
}

impl ArenaBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Frame-scoped bump allocator. The backing storage is allocated once and
/// never grows; every tick starts with [`FrameArena::reset`].
#[derive(Debug)]
pub struct FrameArena {
    storage: Box<[u8]>,
    used: usize,
    high_water: usize,
    epoch: u32,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_CAPACITY)
    }
}

impl FrameArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
            high_water: 0,
            epoch: 0,
        }
    }

    pub fn alloc(&mut self, len: usize) -> Result<ArenaBlock, ArenaError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(ArenaError::Exhausted {
                requested: len,
                remaining,
            });
        }

        let block = ArenaBlock {
            offset: self.used,
            len,
            epoch: self.epoch,
        };
        self.used += len;
        self.high_water = self.high_water.max(self.used);
        Ok(block)
    }

    /// Extends `block` in place by `extra` bytes. Only the most recent
    /// allocation can grow; returns the range added.
    pub fn grow(&mut self, block: &mut ArenaBlock, extra: usize) -> Result<ArenaBlock, ArenaError> {
        debug_assert_eq!(block.epoch, self.epoch, "arena block used after reset");
        if block.offset + block.len != self.used {
            return Err(ArenaError::NotLast);
        }
        let added = self.alloc(extra)?;
        block.len += extra;
        Ok(added)
    }

    pub fn block(&self, block: &ArenaBlock) -> &[u8] {
        debug_assert_eq!(block.epoch, self.epoch, "arena block used after reset");
        &self.storage[block.offset..block.offset + block.len]
    }

    pub fn block_mut(&mut self, block: &ArenaBlock) -> &mut [u8] {
        debug_assert_eq!(block.epoch, self.epoch, "arena block used after reset");
        &mut self.storage[block.offset..block.offset + block.len]
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.storage.len() - self.used
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocations_are_disjoint() {
        let mut arena = FrameArena::new(64);

        let a = arena.alloc(16).unwrap();
        let b = arena.alloc(16).unwrap();

        arena.block_mut(&a).fill(0xAA);
        arena.block_mut(&b).fill(0xBB);

        assert!(arena.block(&a).iter().all(|&x| x == 0xAA));
        assert!(arena.block(&b).iter().all(|&x| x == 0xBB));
        assert_eq!(arena.used(), 32);
    }

    #[test]
    fn overflow_is_an_error_not_growth() {
        let mut arena = FrameArena::new(32);

        arena.alloc(30).unwrap();
        let err = arena.alloc(4).unwrap_err();

        assert_eq!(
            err,
            ArenaError::Exhausted {
                requested: 4,
                remaining: 2
            }
        );
        assert_eq!(arena.capacity(), 32);
    }

    #[test]
    fn reset_reclaims_everything() {
        let mut arena = FrameArena::new(32);

        arena.alloc(32).unwrap();
        assert_eq!(arena.remaining(), 0);

        arena.reset();

        assert_eq!(arena.remaining(), 32);
        assert_eq!(arena.high_water(), 32);
        assert!(arena.alloc(32).is_ok());
    }

    #[test]
    fn only_latest_block_grows() {
        let mut arena = FrameArena::new(64);

        let mut first = arena.alloc(4).unwrap();
        let added = arena.grow(&mut first, 8).unwrap();
        assert_eq!(first.len(), 12);
        assert_eq!(added.len(), 8);

        let mut second = arena.alloc(4).unwrap();
        assert_eq!(arena.grow(&mut first, 1), Err(ArenaError::NotLast));
        assert!(arena.grow(&mut second, 48).is_ok());
        assert!(matches!(
            arena.grow(&mut second, 1),
            Err(ArenaError::Exhausted { .. })
        ));
    }
}
