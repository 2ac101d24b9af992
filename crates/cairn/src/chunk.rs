//! Fixed-size chunking with per-stream deduplication.
//!
//! A stream is cut into [`CHUNK_SIZE`] blocks (the last one may be short). The
//! first block with a given digest keeps its bytes; every later block with the
//! same digest becomes a reference to the ordinal of that first block. The
//! [`DigestIndex`] that drives this lives for one stream only, so nothing is
//! shared between files.

use std::io::{self, ErrorKind, Read, Write};

use tracing::{debug, trace};

use crate::digest::Digest;

/// Size of every chunk except possibly the last one of a stream.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on digest index slots. Past this (at the load limit) new
/// digests are no longer indexed and their chunks stay literal.
pub const MAX_INDEX_SLOTS: usize = 1 << 20;

const INITIAL_INDEX_SLOTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The chunk's bytes.
    Literal(Vec<u8>),
    /// Ordinal of an earlier literal chunk with the same digest.
    Reference(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub digest: Digest,
    pub payload: Payload,
}

impl Chunk {
    pub fn literal(data: Vec<u8>) -> Self {
        Self {
            digest: Digest::hash(&data),
            payload: Payload::Literal(data),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.payload, Payload::Reference(_))
    }
}

/// Open-addressed map from digest to the ordinal of its first chunk.
///
/// The bucket is derived from the digest's leading bytes; collisions probe
/// linearly and are resolved by comparing full digests. The table doubles
/// until [`MAX_INDEX_SLOTS`], after which inserts past the load limit are refused.
#[derive(Debug)]
pub struct DigestIndex {
    slots: Vec<Option<(Digest, u32)>>,
    len: usize,
    max_slots: usize,
}

impl Default for DigestIndex {
    fn default() -> Self {
        Self::with_max_slots(MAX_INDEX_SLOTS)
    }
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index bounded to `max_slots` (rounded up to a power of two).
    pub fn with_max_slots(max_slots: usize) -> Self {
        let max_slots = max_slots.max(2).next_power_of_two();
        Self {
            slots: vec![None; INITIAL_INDEX_SLOTS.min(max_slots)],
            len: 0,
            max_slots,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, digest: &Digest) -> Option<u32> {
        let mask = self.slots.len() - 1;
        let mut pos = digest.bucket_seed() as usize & mask;
        loop {
            match &self.slots[pos] {
                Some((stored, ordinal)) if stored == digest => return Some(*ordinal),
                Some(_) => pos = (pos + 1) & mask,
                None => return None,
            }
        }
    }

    /// Record the first ordinal for `digest`.
    ///
    /// Returns `false` when the index is full. An already present digest keeps
    /// its original ordinal.
    pub fn insert(&mut self, digest: Digest, ordinal: u32) -> bool {
        if Self::over_load(self.len + 1, self.slots.len()) {
            if self.slots.len() >= self.max_slots {
                return false;
            }
            self.grow();
        }

        let mask = self.slots.len() - 1;
        let mut pos = digest.bucket_seed() as usize & mask;
        loop {
            match &self.slots[pos] {
                Some((stored, _)) if *stored == digest => return true,
                Some(_) => pos = (pos + 1) & mask,
                None => {
                    self.slots[pos] = Some((digest, ordinal));
                    self.len += 1;
                    return true;
                }
            }
        }
    }

    fn over_load(len: usize, slots: usize) -> bool {
        len * 4 > slots * 3
    }

    fn grow(&mut self) {
        let new_size = (self.slots.len() * 2).min(self.max_slots);
        trace!(from = self.slots.len(), to = new_size, "Growing digest index");
        let old = std::mem::replace(&mut self.slots, vec![None; new_size]);
        let mask = new_size - 1;
        for (digest, ordinal) in old.into_iter().flatten() {
            let mut pos = digest.bucket_seed() as usize & mask;
            while self.slots[pos].is_some() {
                pos = (pos + 1) & mask;
            }
            self.slots[pos] = Some((digest, ordinal));
        }
    }
}

/// Iterator over the chunks of a reader.
///
/// Each `Chunker` owns a fresh [`DigestIndex`], so deduplication is scoped to
/// the one stream it reads. A read error is yielded once and ends iteration.
pub struct Chunker<R> {
    reader: R,
    index: DigestIndex,
    ordinal: u32,
    done: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R) -> Self {
        Self::with_index(reader, DigestIndex::new())
    }

    pub fn with_index(reader: R, index: DigestIndex) -> Self {
        Self {
            reader,
            index,
            ordinal: 0,
            done: false,
        }
    }

    /// Fill `buf` as far as the stream allows. Fewer bytes than `buf.len()`
    /// means the stream is exhausted.
    fn fill_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        let mut block = vec![0u8; CHUNK_SIZE];
        let len = self.fill_block(&mut block)?;
        if len == 0 {
            return Ok(None);
        }
        if len < CHUNK_SIZE {
            block.truncate(len);
            self.done = true;
        }

        let ordinal = self.ordinal;
        self.ordinal = ordinal.checked_add(1).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, "too many chunks in one stream")
        })?;

        let digest = Digest::hash(&block);
        let payload = match self.index.get(&digest) {
            Some(first) => Payload::Reference(first),
            None => {
                if !self.index.insert(digest, ordinal) {
                    debug!(ordinal, "Digest index full, storing chunk as literal");
                }
                Payload::Literal(block)
            }
        };

        Ok(Some(Chunk { digest, payload }))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Chunk a whole stream.
pub fn chunk_stream(reader: impl Read) -> io::Result<Vec<Chunk>> {
    Chunker::new(reader).collect()
}

/// Write the bytes a chunk sequence stands for, resolving references.
///
/// Returns the number of bytes written.
pub fn concat(chunks: &[Chunk], mut writer: impl Write) -> io::Result<u64> {
    let mut written = 0u64;
    for (position, chunk) in chunks.iter().enumerate() {
        let data = match &chunk.payload {
            Payload::Literal(data) => data,
            Payload::Reference(ordinal) => {
                let target = *ordinal as usize;
                match chunks.get(target).map(|c| &c.payload) {
                    Some(Payload::Literal(data)) if target < position => data,
                    _ => {
                        return Err(io::Error::new(
                            ErrorKind::InvalidData,
                            format!("chunk {position} references unusable chunk {ordinal}"),
                        ));
                    }
                }
            }
        };
        writer.write_all(data)?;
        written += data.len() as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_empty_stream_yields_no_chunks() {
        let chunks = chunk_stream(&[][..]).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        let data = patterned(CHUNK_SIZE * 3);
        let chunks = chunk_stream(&data[..]).unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            match &chunk.payload {
                Payload::Literal(bytes) => assert_eq!(bytes.len(), CHUNK_SIZE),
                Payload::Reference(_) => panic!("Expected literal"),
            }
        }
    }

    #[test]
    fn test_short_final_chunk() {
        let data = patterned(CHUNK_SIZE + 10);
        let chunks = chunk_stream(&data[..]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].payload, Payload::Literal(data[CHUNK_SIZE..].to_vec()));
    }

    #[test]
    fn test_duplicate_blocks_become_references() {
        let block = patterned(CHUNK_SIZE);
        let other = vec![7u8; CHUNK_SIZE];
        let data = [block.clone(), other, block.clone(), block].concat();

        let chunks = chunk_stream(&data[..]).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(!chunks[0].is_reference());
        assert!(!chunks[1].is_reference());
        assert_eq!(chunks[2].payload, Payload::Reference(0));
        assert_eq!(chunks[3].payload, Payload::Reference(0));

        // References keep their own digest
        assert_eq!(chunks[2].digest, chunks[0].digest);
    }

    #[test]
    fn test_concat_resolves_references() {
        let block = patterned(CHUNK_SIZE);
        let data = [block.clone(), block, b"tail".to_vec()].concat();
        let chunks = chunk_stream(&data[..]).unwrap();

        let mut out = Vec::new();
        let written = concat(&chunks, &mut out).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_concat_rejects_forward_reference() {
        let chunks = vec![
            Chunk {
                digest: Digest::hash(b"x"),
                payload: Payload::Reference(1),
            },
            Chunk::literal(b"x".to_vec()),
        ];
        let err = concat(&chunks, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_error_is_reported() {
        struct Failing {
            served: bool,
        }
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.served {
                    Err(io::Error::other("disk on fire"))
                } else {
                    self.served = true;
                    buf.fill(1);
                    Ok(buf.len())
                }
            }
        }

        let mut chunker = Chunker::new(Failing { served: false });
        assert!(chunker.next().unwrap().is_ok());
        let err = chunker.next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
        assert!(chunker.next().is_none());
    }

    #[test]
    fn test_index_grows_and_keeps_entries() {
        let mut index = DigestIndex::new();
        for i in 0..1000u32 {
            assert!(index.insert(Digest::hash(&i.to_le_bytes()), i));
        }
        assert_eq!(index.len(), 1000);
        for i in 0..1000u32 {
            assert_eq!(index.get(&Digest::hash(&i.to_le_bytes())), Some(i));
        }
        assert_eq!(index.get(&Digest::hash(b"absent")), None);
    }

    #[test]
    fn test_index_keeps_first_ordinal() {
        let mut index = DigestIndex::new();
        let digest = Digest::hash(b"same");
        index.insert(digest, 3);
        index.insert(digest, 9);
        assert_eq!(index.get(&digest), Some(3));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_full_index_leaves_literals() {
        // 4 slots hold at most 3 digests
        let index = DigestIndex::with_max_slots(4);
        let blocks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; CHUNK_SIZE]).collect();
        let mut data = blocks.concat();
        data.extend_from_slice(&blocks[4]);
        data.extend_from_slice(&blocks[0]);

        let chunks: Vec<Chunk> = Chunker::with_index(&data[..], index)
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 7);
        // blocks[4] was never indexed, so its repeat is literal
        assert!(!chunks[5].is_reference());
        assert_eq!(chunks[6].payload, Payload::Reference(0));

        let mut out = Vec::new();
        concat(&chunks, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
