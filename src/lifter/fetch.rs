//! Chunked code fetching on top of a [`MemorySource`].

use crate::protocol::MemorySource;
use bumpalo::Bump;

/// Bytes requested per memory fetch.
pub const FETCH_SIZE: usize = 16;

/// Longest x86-64 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

struct Chunk<'b> {
    addr: u64,
    bytes: &'b [u8],
}

impl<'b> Chunk<'b> {
    /// A short chunk ends at the last readable byte.
    fn is_complete(&self) -> bool {
        self.bytes.len() == FETCH_SIZE
    }

    fn tail_from(&self, ip: u64) -> Option<&'b [u8]> {
        let bytes = self.bytes;
        let offset = ip.checked_sub(self.addr)? as usize;
        if offset >= bytes.len() {
            return None;
        }
        let tail = &bytes[offset..];
        if tail.len() >= MAX_INSTRUCTION_LEN || !self.is_complete() {
            Some(tail)
        } else {
            None
        }
    }
}

/// Caches fetched code for the duration of one lift.
///
/// Chunk storage lives in the per-request scratch arena.
pub struct CodeFetcher<'s, 'b> {
    source: &'s mut dyn MemorySource,
    scratch: &'b Bump,
    chunks: bumpalo::collections::Vec<'b, Chunk<'b>>,
}

impl<'s, 'b> CodeFetcher<'s, 'b> {
    pub fn new(source: &'s mut dyn MemorySource, scratch: &'b Bump) -> Self {
        Self {
            source,
            scratch,
            chunks: bumpalo::collections::Vec::new_in(scratch),
        }
    }

    /// Bytes available for decoding at `ip`, fetching a new chunk when the cached ones
    /// cannot hold a whole instruction. `None` when the client supplied nothing.
    pub fn bytes_at(&mut self, ip: u64) -> Option<&'b [u8]> {
        if let Some(tail) = self.chunks.iter().find_map(|chunk| chunk.tail_from(ip)) {
            return Some(tail);
        }

        let mut buf = [0u8; FETCH_SIZE];
        let fetched = self.source.fetch(ip, &mut buf).min(FETCH_SIZE);
        if fetched == 0 {
            log::debug!("no code bytes at {ip:#x}");
            return None;
        }

        let bytes: &'b [u8] = self.scratch.alloc_slice_copy(&buf[..fetched]);
        self.chunks.push(Chunk { addr: ip, bytes });
        Some(bytes)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        image: Vec<u8>,
        base: u64,
        calls: Vec<(u64, usize)>,
    }

    impl MemorySource for Counting {
        fn fetch(&mut self, addr: u64, buf: &mut [u8]) -> usize {
            self.calls.push((addr, buf.len()));
            let Some(offset) = addr.checked_sub(self.base) else {
                return 0;
            };
            let avail = self.image.get(offset as usize..).unwrap_or(&[]);
            let n = avail.len().min(buf.len());
            buf[..n].copy_from_slice(&avail[..n]);
            n
        }
    }

    #[test]
    fn test_refetch_when_tail_too_short() {
        let mut source = Counting {
            image: (0..64).collect(),
            base: 0x1000,
            calls: Vec::new(),
        };
        let scratch = Bump::new();
        let mut fetcher = CodeFetcher::new(&mut source, &scratch);

        assert_eq!(fetcher.bytes_at(0x1000).unwrap().len(), 16);
        // 15 bytes left in the first chunk: still enough
        assert_eq!(fetcher.bytes_at(0x1001).unwrap()[0], 1);
        // only 13 left: fetch again
        assert_eq!(fetcher.bytes_at(0x1003).unwrap().len(), 16);
        assert_eq!(fetcher.chunk_count(), 2);
        drop(fetcher);
        assert_eq!(source.calls, vec![(0x1000, 16), (0x1003, 16)]);
    }

    #[test]
    fn test_short_chunk_is_final() {
        let mut source = Counting {
            image: vec![0x90, 0x90, 0xc3],
            base: 0x2000,
            calls: Vec::new(),
        };
        let scratch = Bump::new();
        let mut fetcher = CodeFetcher::new(&mut source, &scratch);

        assert_eq!(fetcher.bytes_at(0x2000).unwrap(), &[0x90, 0x90, 0xc3]);
        assert_eq!(fetcher.bytes_at(0x2002).unwrap(), &[0xc3]);
        assert_eq!(fetcher.chunk_count(), 1);
        assert!(fetcher.bytes_at(0x2003).is_none());
    }
}
