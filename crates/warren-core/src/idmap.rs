//! Dense, recyclable container id allocation.

use crate::error::{Error, ErrorKind, Result};

const WORD_BITS: usize = 64;

/// Allocator for dense integer ids in `[base, base + capacity)`.
///
/// Ids are handed out lowest-free-first and may be reused after
/// [`release`](IdMap::release); no further ordering is guaranteed.
#[derive(Debug)]
pub struct IdMap {
    base: u32,
    capacity: u32,
    used: Vec<u64>,
}

impl IdMap {
    /// Creates an allocator covering `[base, base + capacity)`.
    #[must_use]
    pub fn new(base: u32, capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(WORD_BITS);
        Self {
            base,
            capacity,
            used: vec![0; words],
        }
    }

    /// Allocates the lowest free id.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotAvailable` when the range is exhausted.
    pub fn acquire(&mut self) -> Result<u32> {
        for (word_idx, word) in self.used.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let offset = word_idx * WORD_BITS + bit;
                if offset >= self.capacity as usize {
                    break;
                }
                *word |= 1 << bit;
                return Ok(self.base + offset as u32);
            }
        }
        Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            "container ids exhausted",
        ))
    }

    /// Allocates a specific id, used when restoring persisted containers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for ids outside the range and `Busy` for ids
    /// already taken.
    pub fn acquire_at(&mut self, id: u32) -> Result<()> {
        let offset = self.offset(id)?;
        let (word, bit) = (offset / WORD_BITS, offset % WORD_BITS);
        if self.used[word] & (1 << bit) != 0 {
            return Err(Error::new(ErrorKind::Busy, format!("id {id} is already in use")));
        }
        self.used[word] |= 1 << bit;
        Ok(())
    }

    /// Returns an id to the pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for ids outside the range or not allocated.
    pub fn release(&mut self, id: u32) -> Result<()> {
        let offset = self.offset(id)?;
        let (word, bit) = (offset / WORD_BITS, offset % WORD_BITS);
        if self.used[word] & (1 << bit) == 0 {
            return Err(Error::new(ErrorKind::InvalidValue, format!("id {id} is not allocated")));
        }
        self.used[word] &= !(1 << bit);
        Ok(())
    }

    fn offset(&self, id: u32) -> Result<usize> {
        if id < self.base || id >= self.base + self.capacity {
            return Err(Error::new(ErrorKind::InvalidValue, format!("id {id} out of range")));
        }
        Ok((id - self.base) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_lowest_first() {
        let mut map = IdMap::new(1, 100);
        assert_eq!(map.acquire().unwrap(), 1);
        assert_eq!(map.acquire().unwrap(), 2);
        assert_eq!(map.acquire().unwrap(), 3);
    }

    #[test]
    fn reuses_only_after_release() {
        let mut map = IdMap::new(1, 100);
        let a = map.acquire().unwrap();
        let b = map.acquire().unwrap();
        assert_ne!(a, b);
        map.release(a).unwrap();
        assert_eq!(map.acquire().unwrap(), a);
    }

    #[test]
    fn acquire_at_conflicts() {
        let mut map = IdMap::new(1, 100);
        map.acquire_at(7).unwrap();
        assert_eq!(map.acquire_at(7).unwrap_err().kind, ErrorKind::Busy);
        assert_eq!(map.acquire_at(0).unwrap_err().kind, ErrorKind::InvalidValue);
        assert_eq!(map.acquire_at(101).unwrap_err().kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn exhaustion() {
        let mut map = IdMap::new(1, 3);
        for _ in 0..3 {
            map.acquire().unwrap();
        }
        assert_eq!(
            map.acquire().unwrap_err().kind,
            ErrorKind::ResourceNotAvailable
        );
    }

    #[test]
    fn release_unallocated_fails() {
        let mut map = IdMap::new(1, 10);
        assert!(map.release(5).is_err());
    }

    #[test]
    fn spans_word_boundary() {
        let mut map = IdMap::new(1, 130);
        let mut last = 0;
        for _ in 0..130 {
            last = map.acquire().unwrap();
        }
        assert_eq!(last, 130);
        assert!(map.acquire().is_err());
        map.release(64).unwrap();
        map.release(65).unwrap();
        assert_eq!(map.acquire().unwrap(), 64);
        assert_eq!(map.acquire().unwrap(), 65);
    }
}
