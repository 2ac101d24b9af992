//! Binary format of `.dedup` artifacts.
//!
//! ```text
//! chunk_count: u32 LE
//! chunk_count times:
//!   digest:  16 bytes
//!   kind:    u8        0 = literal, 1 = reference
//!   size:    u32 LE    literal: 1..=CHUNK_SIZE (short only for the last chunk)
//!                      reference: 4
//!   payload: size bytes (literal bytes, or the u32 LE ordinal referenced)
//! ```
//!
//! The kind byte makes a four-byte final literal unambiguous with a reference.
//! Decoding resolves references against chunks already decoded and checks
//! every chunk against its digest.

use std::io::{self, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::chunk::{CHUNK_SIZE, Chunk, Payload};
use crate::digest::{DIGEST_LEN, Digest};

const KIND_LITERAL: u8 = 0;
const KIND_REFERENCE: u8 = 1;

/// Width of an encoded ordinal.
pub const ORDINAL_WIDTH: usize = size_of::<u32>();

const COUNT_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = DIGEST_LEN + 1 + 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated data")]
    Truncated,
    #[error("Chunk {index}: invalid kind {kind}")]
    InvalidKind { index: u32, kind: u8 },
    #[error("Chunk {index}: invalid size {size}")]
    InvalidSize { index: u32, size: u32 },
    #[error("Chunk {index}: reference to {ordinal} does not point at an earlier literal")]
    BadReference { index: u32, ordinal: u32 },
    #[error("Chunk {index}: content does not match its digest")]
    DigestMismatch { index: u32 },
    #[error("{0} trailing bytes after last chunk")]
    TrailingData(usize),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Counters from encoding one artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub chunks: u64,
    pub literals: u64,
    pub references: u64,
    /// Bytes of literal payload, i.e. content actually stored.
    pub literal_bytes: u64,
    /// Total encoded size, headers included.
    pub encoded_bytes: u64,
}

impl EncodeStats {
    pub fn add(&mut self, other: &EncodeStats) {
        self.chunks += other.chunks;
        self.literals += other.literals;
        self.references += other.references;
        self.literal_bytes += other.literal_bytes;
        self.encoded_bytes += other.encoded_bytes;
    }
}

/// Encode a chunk sequence to `writer`.
pub fn encode(chunks: &[Chunk], mut writer: impl Write) -> io::Result<EncodeStats> {
    let count = u32::try_from(chunks.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many chunks"))?;

    let mut stats = EncodeStats::default();
    let mut header = BytesMut::with_capacity(RECORD_HEADER_SIZE + ORDINAL_WIDTH);

    header.put_u32_le(count);
    writer.write_all(&header)?;
    stats.encoded_bytes += COUNT_SIZE as u64;

    for chunk in chunks {
        header.clear();
        header.put_slice(chunk.digest.as_slice());
        match &chunk.payload {
            Payload::Literal(data) => {
                debug_assert!(!data.is_empty() && data.len() <= CHUNK_SIZE);
                header.put_u8(KIND_LITERAL);
                header.put_u32_le(data.len() as u32);
                writer.write_all(&header)?;
                writer.write_all(data)?;
                stats.literals += 1;
                stats.literal_bytes += data.len() as u64;
                stats.encoded_bytes += (header.len() + data.len()) as u64;
            }
            Payload::Reference(ordinal) => {
                header.put_u8(KIND_REFERENCE);
                header.put_u32_le(ORDINAL_WIDTH as u32);
                header.put_u32_le(*ordinal);
                writer.write_all(&header)?;
                stats.references += 1;
                stats.encoded_bytes += header.len() as u64;
            }
        }
        stats.chunks += 1;
    }

    Ok(stats)
}

/// Encode a chunk sequence into a fresh buffer.
pub fn encode_to_vec(chunks: &[Chunk]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    encode(chunks, &mut out)?;
    Ok(out)
}

/// Decode an artifact, resolving every reference.
///
/// All returned chunks carry [`Payload::Literal`].
pub fn decode(mut data: &[u8]) -> Result<Vec<Chunk>, CodecError> {
    if data.remaining() < COUNT_SIZE {
        return Err(CodecError::Truncated);
    }
    let count = data.get_u32_le();

    // Don't trust the count for preallocation
    let mut chunks: Vec<Chunk> =
        Vec::with_capacity((count as usize).min(data.remaining() / RECORD_HEADER_SIZE));

    for index in 0..count {
        if data.remaining() < RECORD_HEADER_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut digest = [0u8; DIGEST_LEN];
        data.copy_to_slice(&mut digest);
        let digest = Digest::from(digest);
        let kind = data.get_u8();
        let size = data.get_u32_le();

        if data.remaining() < size as usize {
            return Err(CodecError::Truncated);
        }

        let bytes = match kind {
            KIND_LITERAL => {
                let size_ok = size as usize == CHUNK_SIZE;
                let short_tail = index + 1 == count && size > 0 && (size as usize) < CHUNK_SIZE;
                let valid = size_ok || short_tail;
                if !valid {
                    return Err(CodecError::InvalidSize { index, size });
                }
                let bytes = data[..size as usize].to_vec();
                data.advance(size as usize);
                bytes
            }
            KIND_REFERENCE => {
                if size as usize != ORDINAL_WIDTH {
                    return Err(CodecError::InvalidSize { index, size });
                }
                let ordinal = data.get_u32_le();
                if ordinal >= index {
                    return Err(CodecError::BadReference { index, ordinal });
                }
                match &chunks[ordinal as usize].payload {
                    Payload::Literal(bytes) => bytes.clone(),
                    Payload::Reference(_) => {
                        return Err(CodecError::BadReference { index, ordinal });
                    }
                }
            }
            kind => return Err(CodecError::InvalidKind { index, kind }),
        };

        if Digest::hash(&bytes) != digest {
            return Err(CodecError::DigestMismatch { index });
        }

        chunks.push(Chunk {
            digest,
            payload: Payload::Literal(bytes),
        });
    }

    if data.has_remaining() {
        return Err(CodecError::TrailingData(data.remaining()));
    }

    Ok(chunks)
}

/// Decode an artifact and write the bytes it stands for.
///
/// Nothing is written unless the whole artifact decodes.
pub fn decode_into(data: &[u8], writer: impl Write) -> Result<u64, CodecError> {
    let chunks = decode(data)?;
    Ok(crate::chunk::concat(&chunks, writer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_stream;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let chunks = chunk_stream(data).unwrap();
        let encoded = encode_to_vec(&chunks).unwrap();
        let mut out = Vec::new();
        decode_into(&encoded, &mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_boundary_lengths() {
        for len in [
            0,
            1,
            CHUNK_SIZE - 1,
            CHUNK_SIZE,
            CHUNK_SIZE + 1,
            10 * CHUNK_SIZE,
        ] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            assert_eq!(roundtrip(&data), data, "length {len}");
        }
    }

    #[test]
    fn test_empty_artifact() {
        let encoded = encode_to_vec(&[]).unwrap();
        assert_eq!(encoded, 0u32.to_le_bytes());
        assert!(decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_doubled_block_has_one_literal_and_one_reference() {
        let block: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 7) as u8).collect();
        let data = [block.clone(), block].concat();
        let chunks = chunk_stream(&data[..]).unwrap();

        let mut encoded = Vec::new();
        let stats = encode(&chunks, &mut encoded).unwrap();
        assert_eq!(stats.literals, 1);
        assert_eq!(stats.references, 1);
        assert_eq!(stats.literal_bytes, CHUNK_SIZE as u64);
        assert_eq!(stats.encoded_bytes, encoded.len() as u64);
        assert_eq!(
            encoded.len(),
            COUNT_SIZE + 2 * RECORD_HEADER_SIZE + CHUNK_SIZE + ORDINAL_WIDTH
        );

        let mut out = Vec::new();
        decode_into(&encoded, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_four_byte_final_literal_is_not_a_reference() {
        let block = vec![9u8; CHUNK_SIZE];
        let data = [block, vec![0, 0, 0, 0]].concat();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn test_decode_truncated() {
        let chunks = chunk_stream(&b"some bytes"[..]).unwrap();
        let encoded = encode_to_vec(&chunks).unwrap();
        for cut in [0, 2, COUNT_SIZE + 5, encoded.len() - 1] {
            let result = decode(&encoded[..cut]);
            assert!(matches!(result, Err(CodecError::Truncated)), "cut {cut}");
        }
    }

    #[test]
    fn test_decode_forward_reference() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(Digest::hash(b"x").as_slice());
        data.push(KIND_REFERENCE);
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // points at itself

        let result = decode(&data);
        assert!(matches!(
            result,
            Err(CodecError::BadReference {
                index: 0,
                ordinal: 0
            })
        ));
    }

    #[test]
    fn test_decode_digest_mismatch() {
        let chunks = chunk_stream(&b"original content"[..]).unwrap();
        let mut encoded = encode_to_vec(&chunks).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = decode(&encoded);
        assert!(matches!(result, Err(CodecError::DigestMismatch { index: 0 })));
    }

    #[test]
    fn test_decode_invalid_kind() {
        let chunks = chunk_stream(&b"abc"[..]).unwrap();
        let mut encoded = encode_to_vec(&chunks).unwrap();
        encoded[COUNT_SIZE + DIGEST_LEN] = 7;

        let result = decode(&encoded);
        assert!(matches!(
            result,
            Err(CodecError::InvalidKind { index: 0, kind: 7 })
        ));
    }

    #[test]
    fn test_decode_short_literal_before_end() {
        // Two short literals: only the last may be short
        let chunks = vec![Chunk::literal(b"ab".to_vec()), Chunk::literal(b"cd".to_vec())];
        let encoded = encode_to_vec(&chunks).unwrap();

        let result = decode(&encoded);
        assert!(matches!(
            result,
            Err(CodecError::InvalidSize { index: 0, size: 2 })
        ));
    }

    #[test]
    fn test_encode_reports_writer_errors() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::StorageFull))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let chunks = chunk_stream(&b"abc"[..]).unwrap();
        let err = encode(&chunks, Full).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        assert_eq!(encode_to_vec(&chunks).unwrap().len(), COUNT_SIZE + RECORD_HEADER_SIZE + 3);
    }

    #[test]
    fn test_decode_trailing_data() {
        let mut encoded = encode_to_vec(&chunk_stream(&b"abc"[..]).unwrap()).unwrap();
        encoded.extend_from_slice(b"junk");
        assert!(matches!(decode(&encoded), Err(CodecError::TrailingData(4))));
    }
}
