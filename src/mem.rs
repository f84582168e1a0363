//! Per-request scratch memory

/// Handle to a region stored in a [`MemBlock`]. Resolved back to bytes with
/// [`MemBlock::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    slot: usize,
    start: usize,
    len: usize,
}

/// Scratch arena bound to one request. Small allocations land in an inline
/// `N`-byte block; anything that does not fit spills to the heap. The whole
/// arena is freed when the owning stream is destroyed.
#[derive(Debug)]
pub struct MemBlock<const N: usize> {
    inline: [u8; N],
    pos: usize,
    spill: Vec<Box<[u8]>>,
}

impl<const N: usize> MemBlock<N> {
    pub fn new() -> Self {
        Self {
            inline: [0; N],
            pos: 0,
            spill: Vec::new(),
        }
    }

    /// Stores a copy of `bytes` and returns a handle to it.
    pub fn store(&mut self, bytes: &[u8]) -> Chunk {
        if self.pos + bytes.len() <= N {
            let start = self.pos;
            self.inline[start..start + bytes.len()].copy_from_slice(bytes);
            self.pos += bytes.len();
            Chunk {
                slot: 0,
                start,
                len: bytes.len(),
            }
        } else {
            self.spill.push(bytes.to_vec().into_boxed_slice());
            Chunk {
                slot: self.spill.len(),
                start: 0,
                len: bytes.len(),
            }
        }
    }

    pub fn get(&self, chunk: Chunk) -> &[u8] {
        if chunk.slot == 0 {
            &self.inline[chunk.start..chunk.start + chunk.len]
        } else {
            &self.spill[chunk.slot - 1][..chunk.len]
        }
    }

    /// Stored UTF-8, for chunks known to hold text.
    pub fn get_str(&self, chunk: Chunk) -> &str {
        std::str::from_utf8(self.get(chunk)).unwrap_or("")
    }
}

impl<const N: usize> Default for MemBlock<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::MemBlock;

    #[test]
    fn small_allocations_stay_inline() {
        let mut mem: MemBlock<16> = MemBlock::new();
        let a = mem.store(b"abc");
        let b = mem.store(b"defg");
        assert_eq!(b"abc", mem.get(a));
        assert_eq!(b"defg", mem.get(b));
    }

    #[test]
    fn oversized_allocation_spills_to_heap() {
        let mut mem: MemBlock<4> = MemBlock::new();
        let a = mem.store(b"ab");
        let big = mem.store(b"0123456789");
        assert_eq!(b"ab", mem.get(a));
        assert_eq!(b"0123456789", mem.get(big));
    }

    #[test]
    fn get_str_resolves_text_chunks() {
        let mut mem: MemBlock<8> = MemBlock::new();
        let c = mem.store("/index".as_bytes());
        assert_eq!("/index", mem.get_str(c));
    }
}
