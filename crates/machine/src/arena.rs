//! Native heap bookkeeping for guest allocations.
//!
//! The arena never touches guest memory itself; it only hands out address
//! ranges inside `[base, base + size)`. That keeps it `Clone`, so a fork can
//! inherit the template's heap state by value.

use std::collections::BTreeMap;

const ALIGNMENT: u64 = 16;

fn align_up(len: u64) -> Option<u64> {
    len.checked_add(ALIGNMENT - 1).map(|v| v & !(ALIGNMENT - 1))
}

/// A first-fit allocator over a fixed guest address range.
#[derive(Clone, Debug)]
pub struct Arena {
    base: u64,
    size: u64,
    /// Allocated chunks, keyed by address, with their (aligned) length.
    allocated: BTreeMap<u64, u64>,
    /// Free chunks, keyed by address. Adjacent free chunks are always merged.
    free: BTreeMap<u64, u64>,
}

impl Arena {
    /// Creates an arena managing `size` bytes starting at `base`.
    pub fn new(base: u64, size: u64) -> Arena {
        let size = size & !(ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Arena {
            base,
            size,
            allocated: BTreeMap::new(),
            free,
        }
    }

    /// The first address managed by this arena.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The number of bytes managed by this arena.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocates `len` bytes, returning the guest address of the chunk.
    ///
    /// Zero-sized requests still receive a unique, minimum-sized chunk.
    pub fn malloc(&mut self, len: u64) -> Option<u64> {
        let len = align_up(len.max(1))?;
        let (&addr, &chunk) = self.free.iter().find(|(_, chunk)| **chunk >= len)?;
        self.free.remove(&addr);
        if chunk > len {
            self.free.insert(addr + len, chunk - len);
        }
        self.allocated.insert(addr, len);
        Some(addr)
    }

    /// Releases the chunk at `addr`.
    ///
    /// Returns `false` if `addr` is not the start of a live allocation. Freeing
    /// the null pointer is a successful no-op.
    pub fn free(&mut self, addr: u64) -> bool {
        if addr == 0 {
            return true;
        }
        let Some(len) = self.allocated.remove(&addr) else {
            return false;
        };
        self.insert_free(addr, len);
        true
    }

    /// Resizes the chunk at `addr` to `len` bytes.
    ///
    /// On success returns the (possibly moved) address of the chunk together
    /// with the old chunk length, so the caller can move the contents when
    /// the address changed.
    pub fn realloc(&mut self, addr: u64, len: u64) -> Option<(u64, u64)> {
        if addr == 0 {
            return self.malloc(len).map(|new| (new, 0));
        }
        let old = *self.allocated.get(&addr)?;
        let want = align_up(len.max(1))?;
        if want <= old {
            if want < old {
                self.allocated.insert(addr, want);
                self.insert_free(addr + want, old - want);
            }
            return Some((addr, old));
        }

        // Grow in place when the neighbouring chunk is free and large enough.
        let next = addr + old;
        if let Some(&next_len) = self.free.get(&next) {
            if old + next_len >= want {
                self.free.remove(&next);
                let rest = old + next_len - want;
                if rest > 0 {
                    self.free.insert(addr + want, rest);
                }
                self.allocated.insert(addr, want);
                return Some((addr, old));
            }
        }

        let new = self.malloc(len)?;
        self.free(addr);
        Some((new, old))
    }

    /// Length of the live chunk starting at `addr`, if any.
    pub fn chunk_size(&self, addr: u64) -> Option<u64> {
        self.allocated.get(&addr).copied()
    }

    pub fn bytes_free(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn bytes_used(&self) -> u64 {
        self.allocated.values().sum()
    }

    pub fn chunks_used(&self) -> usize {
        self.allocated.len()
    }

    fn insert_free(&mut self, mut addr: u64, mut len: u64) {
        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.free.remove(&prev);
                addr = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(addr + len)) {
            self.free.remove(&(addr + len));
            len += next_len;
        }
        self.free.insert(addr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = Arena::new(0x10000, 0x1000);
        let a = arena.malloc(3).unwrap();
        let b = arena.malloc(17).unwrap();
        assert_eq!(a % ALIGNMENT, 0);
        assert_eq!(b % ALIGNMENT, 0);
        assert!(b >= a + 16);
        assert_eq!(arena.chunks_used(), 2);
        assert_eq!(arena.bytes_used(), 16 + 32);
        assert_eq!(arena.bytes_free(), 0x1000 - 48);
    }

    #[test]
    fn exhaustion() {
        let mut arena = Arena::new(0x10000, 64);
        assert!(arena.malloc(64).is_some());
        assert!(arena.malloc(1).is_none());
    }

    #[test]
    fn free_coalesces() {
        let mut arena = Arena::new(0, 96);
        let a = arena.malloc(32).unwrap();
        let b = arena.malloc(32).unwrap();
        let c = arena.malloc(32).unwrap();
        assert!(arena.free(a));
        assert!(arena.free(c));
        assert!(arena.free(b));
        assert_eq!(arena.bytes_free(), 96);
        assert_eq!(arena.malloc(96), Some(0));
    }

    #[test]
    fn invalid_free() {
        let mut arena = Arena::new(0x1000, 256);
        let a = arena.malloc(16).unwrap();
        assert!(!arena.free(a + 16));
        assert!(arena.free(0));
        assert!(arena.free(a));
        assert!(!arena.free(a));
    }

    #[test]
    fn realloc_grows_in_place() {
        let mut arena = Arena::new(0x1000, 256);
        let a = arena.malloc(16).unwrap();
        assert_eq!(arena.realloc(a, 64), Some((a, 16)));
        assert_eq!(arena.chunk_size(a), Some(64));
    }

    #[test]
    fn realloc_moves() {
        let mut arena = Arena::new(0x1000, 256);
        let a = arena.malloc(16).unwrap();
        let _b = arena.malloc(16).unwrap();
        let (c, old) = arena.realloc(a, 64).unwrap();
        assert_ne!(a, c);
        assert_eq!(old, 16);
        assert_eq!(arena.chunk_size(a), None);
        assert_eq!(arena.chunks_used(), 2);
    }

    #[test]
    fn clone_is_independent() {
        let mut arena = Arena::new(0x1000, 256);
        arena.malloc(16).unwrap();
        let mut fork = arena.clone();
        fork.malloc(16).unwrap();
        assert_eq!(arena.chunks_used(), 1);
        assert_eq!(fork.chunks_used(), 2);
    }

    proptest! {
        #[test]
        fn accounting_is_conserved(ops in prop::collection::vec((0u64..300, any::<bool>()), 1..64)) {
            let mut arena = Arena::new(0x4000, 4096);
            let mut live = Vec::new();
            for (len, free) in ops {
                if free && !live.is_empty() {
                    let addr = live.swap_remove(len as usize % live.len());
                    prop_assert!(arena.free(addr));
                } else if let Some(addr) = arena.malloc(len) {
                    prop_assert!(addr >= 0x4000 && addr + len <= 0x4000 + 4096);
                    live.push(addr);
                }
                prop_assert_eq!(arena.bytes_free() + arena.bytes_used(), 4096);
                prop_assert_eq!(arena.chunks_used(), live.len());
            }
            for addr in live {
                prop_assert!(arena.free(addr));
            }
            prop_assert_eq!(arena.malloc(4096), Some(0x4000));
        }
    }
}
