//! Content checksums for small files and archive bundles
//!
//! Members are verified with CRC32C on every extraction; xxHash64 gives a
//! second, independent comparison key for duplicate detection. SHA-256 is
//! only computed when a caller asks for it (whole-bundle digests).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;

/// Checksum of a member or of a whole bundle
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub crc32c: u32,
    pub xxhash64: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "sha256_hex")]
    pub sha256: Option<[u8; 32]>,
}

impl Checksum {
    /// CRC32C + xxHash64 of `data`
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
            sha256: None,
        }
    }

    /// Same as [`Checksum::of`] plus a SHA-256 digest
    #[must_use]
    pub fn with_sha256(data: &[u8]) -> Self {
        Self {
            sha256: Some(Sha256::digest(data).into()),
            ..Self::of(data)
        }
    }

    /// Verify `data` against every digest this checksum carries
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        if crc32c::crc32c(data) != self.crc32c {
            return false;
        }
        if xxhash_rust::xxh64::xxh64(data, 0) != self.xxhash64 {
            return false;
        }
        match &self.sha256 {
            Some(expected) => {
                let actual: [u8; 32] = Sha256::digest(data).into();
                &actual == expected
            }
            None => true,
        }
    }

    /// Compare two checksums on the fast digests only.
    ///
    /// A checksum computed with SHA-256 still matches one computed without it.
    #[must_use]
    pub const fn same_content(&self, other: &Self) -> bool {
        self.crc32c == other.crc32c && self.xxhash64 == other.xxhash64
    }

    /// Compact hex form used as an object ETag / log key
    #[must_use]
    pub fn hex(&self) -> String {
        format!("{:08x}{:016x}", self.crc32c, self.xxhash64)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

mod sha256_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// Streaming checksum calculator for bundle files
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    sha256: Option<Sha256>,
    len: u64,
}

impl ChecksumCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            sha256: None,
            len: 0,
        }
    }

    #[must_use]
    pub fn with_sha256() -> Self {
        Self {
            sha256: Some(Sha256::new()),
            ..Self::new()
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        if let Some(ref mut sha256) = self.sha256 {
            sha256.update(data);
        }
        self.len += data.len() as u64;
    }

    /// Feed everything `reader` yields; returns the number of bytes consumed.
    pub fn update_from_reader(&mut self, mut reader: impl Read) -> std::io::Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            self.update(&buf[..n]);
            total += n as u64;
        }
    }

    /// Bytes seen so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
            sha256: self.sha256.map(|h| h.finalize().into()),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_detects_single_bit_flip() {
        let data = b"small file payload".to_vec();
        let checksum = Checksum::of(&data);
        assert!(checksum.verify(&data));

        let mut flipped = data;
        flipped[3] ^= 0x01;
        assert!(!checksum.verify(&flipped));
    }

    #[test]
    fn test_same_content_ignores_sha256() {
        let data = b"abc";
        assert!(Checksum::of(data).same_content(&Checksum::with_sha256(data)));
        assert!(!Checksum::of(data).same_content(&Checksum::of(b"abd")));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut calc = ChecksumCalculator::with_sha256();
        let consumed = calc.update_from_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(consumed, data.len() as u64);
        assert_eq!(calc.len(), data.len() as u64);
        assert_eq!(calc.finalize(), Checksum::with_sha256(&data));
    }

    #[test]
    fn test_json_round_trip_keeps_sha256() {
        let checksum = Checksum::with_sha256(b"bundle");
        let json = serde_json::to_string(&checksum).unwrap();
        assert!(json.contains("sha256"));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);

        let fast = serde_json::to_string(&Checksum::of(b"bundle")).unwrap();
        assert!(!fast.contains("sha256"));
    }
}
