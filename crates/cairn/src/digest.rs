//! 128-bit content digests.
//!
//! Digests are the first 16 bytes of BLAKE3's extended output. The same type
//! is used for per-chunk digests inside artifacts and for whole-file digests
//! in the manifest, but the two are always computed in separate passes.

use std::{
    fmt,
    io::{self, Read},
    ops::Deref,
    str::FromStr,
};

use blake3::Hasher;

/// Width of a digest in bytes.
pub const DIGEST_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Digest a byte slice.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        Self::finish(&hasher)
    }

    /// Digest everything a reader yields, until end of stream.
    pub fn hash_reader(reader: impl Read) -> io::Result<Self> {
        let mut hasher = Hasher::new();
        hasher.update_reader(reader)?;
        Ok(Self::finish(&hasher))
    }

    fn finish(hasher: &Hasher) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        hasher.finalize_xof().fill(&mut out);
        Self(out)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bucket seed for hash tables: the leading eight bytes, little-endian.
    pub(crate) fn bucket_seed(&self) -> u64 {
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(seed)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Digest {
    type Target = [u8; DIGEST_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

/// Reader adapter that digests every byte passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            bytes: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Digest of everything read so far.
    pub fn digest(&self) -> Digest {
        Digest::finish(&self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_hex() {
        let digest = Digest::hash(b"hello world");
        let hex = digest.as_hex();
        assert_eq!(hex.len(), 32); // 16 bytes = 32 hex chars
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_display_matches_as_hex() {
        let digest = Digest::hash(b"test data");
        assert_eq!(digest.to_string(), digest.as_hex());
    }

    #[test]
    fn test_prefix_of_blake3() {
        let digest = Digest::hash(b"prefix");
        let full = blake3::hash(b"prefix");
        assert_eq!(digest.as_slice(), &full.as_bytes()[..DIGEST_LEN]);
    }

    #[test]
    fn test_reader_matches_slice() {
        let data = vec![0x5Au8; 100_000];
        let from_reader = Digest::hash_reader(&data[..]).unwrap();
        assert_eq!(from_reader, Digest::hash(&data));
    }

    #[test]
    fn test_hashing_reader() {
        let data = b"streamed through".to_vec();
        let mut reader = HashingReader::new(&data[..]);
        let mut sink = Vec::new();
        io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(reader.digest(), Digest::hash(&data));
        assert_eq!(HashingReader::bytes(&reader), data.len() as u64);
    }

    #[test]
    fn test_parse_hex() {
        let digest = Digest::hash(b"parse me");
        let parsed: Digest = digest.as_hex().parse().unwrap();
        assert_eq!(parsed, digest);

        // Wrong length should fail
        assert!("abcd".parse::<Digest>().is_err());
        assert!("zz".repeat(16).parse::<Digest>().is_err());
    }
}
