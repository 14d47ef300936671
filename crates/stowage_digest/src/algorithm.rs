//! Selection of the hash algorithm, the textual encoding of its output and the
//! shard layout that is derived from it.

use std::fmt::{Display, Formatter};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use blake2::{digest::consts::U32, Blake2b};
use digest::DynDigest;
use serde::{Deserialize, Serialize};

/// The hash function used to derive the address of a piece of content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5, 128 bits. Only useful for interop with legacy indices.
    Md5,

    /// SHA-2 with a 224 bit output.
    #[default]
    Sha224,

    /// SHA-2 with a 256 bit output.
    Sha256,

    /// SHA-2 with a 384 bit output.
    Sha384,

    /// SHA-2 with a 512 bit output.
    Sha512,

    /// BLAKE2b truncated to 256 bits.
    Blake2b256,
}

impl HashAlgorithm {
    /// Returns the length of the raw digest in bytes.
    pub const fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 | HashAlgorithm::Blake2b256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Constructs a new, empty hasher for this algorithm.
    pub fn hasher(self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Md5 => Box::new(md5::Md5::default()),
            HashAlgorithm::Sha224 => Box::new(sha2::Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
            HashAlgorithm::Blake2b256 => Box::new(Blake2b::<U32>::default()),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake2b256 => "blake2b256",
        };
        f.write_str(name)
    }
}

/// How a raw digest is turned into the string that names the stored file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestEncoding {
    /// Lowercase hexadecimal.
    #[default]
    Hex,

    /// The URL and filename safe base64 alphabet without padding.
    Base64Url,
}

impl DigestEncoding {
    /// Returns the number of characters a digest of `raw_len` bytes occupies in
    /// this encoding.
    pub const fn encoded_len(self, raw_len: usize) -> usize {
        match self {
            DigestEncoding::Hex => raw_len * 2,
            DigestEncoding::Base64Url => (raw_len * 8).div_ceil(6),
        }
    }

    /// Encodes a raw digest.
    pub fn encode(self, digest: &[u8]) -> String {
        match self {
            DigestEncoding::Hex => hex::encode(digest),
            DigestEncoding::Base64Url => URL_SAFE_NO_PAD.encode(digest),
        }
    }

    /// Returns true if `encoded` only contains characters this encoding
    /// produces.
    pub fn is_encoded(self, encoded: &str) -> bool {
        match self {
            DigestEncoding::Hex => encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
            DigestEncoding::Base64Url => encoded
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
        }
    }
}

/// An error that is returned when a [`HashConfig`] describes a shard layout
/// that cannot be derived from the digest.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HashConfigError {
    /// The shard directories would consume more characters than the digest has.
    #[error(
        "a shard layout of {depth} levels of {width} characters does not fit in a {algorithm} digest of {digest_len} characters"
    )]
    ShardLayoutTooLarge {
        /// The configured number of characters per level.
        width: usize,
        /// The configured number of levels.
        depth: usize,
        /// The algorithm that was configured.
        algorithm: HashAlgorithm,
        /// The length of the encoded digest.
        digest_len: usize,
    },

    /// Shard levels were requested but each level would have an empty name.
    #[error("shard-width must be at least 1 when shard-depth is {0}")]
    EmptyShardSegment(usize),
}

/// Describes how content is hashed and how the resulting digest is fanned out
/// over nested directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HashConfig {
    /// The hash function.
    #[serde(default)]
    pub algorithm: HashAlgorithm,

    /// The textual encoding of the digest.
    #[serde(default)]
    pub encoding: DigestEncoding,

    /// The number of digest characters that make up each shard directory.
    #[serde(default = "default_shard_width")]
    pub shard_width: usize,

    /// The number of nested shard directories.
    #[serde(default = "default_shard_depth")]
    pub shard_depth: usize,
}

fn default_shard_width() -> usize {
    2
}

fn default_shard_depth() -> usize {
    2
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default(),
            encoding: DigestEncoding::default(),
            shard_width: default_shard_width(),
            shard_depth: default_shard_depth(),
        }
    }
}

impl HashConfig {
    /// Returns the number of characters of an encoded digest.
    pub const fn digest_len(&self) -> usize {
        self.encoding.encoded_len(self.algorithm.output_len())
    }

    /// Checks that the shard layout fits within the encoded digest.
    pub fn validate(&self) -> Result<(), HashConfigError> {
        if self.shard_depth > 0 && self.shard_width == 0 {
            return Err(HashConfigError::EmptyShardSegment(self.shard_depth));
        }

        let digest_len = self.digest_len();
        let fits = match self.shard_width.checked_mul(self.shard_depth) {
            Some(required) => required <= digest_len,
            None => false,
        };
        if !fits {
            return Err(HashConfigError::ShardLayoutTooLarge {
                width: self.shard_width,
                depth: self.shard_depth,
                algorithm: self.algorithm,
                digest_len,
            });
        }

        Ok(())
    }

    /// Splits an encoded digest into the names of its shard directories.
    ///
    /// Returns `None` if the digest is too short for the configured layout.
    pub fn shard_segments<'a>(&self, digest: &'a str) -> Option<Vec<&'a str>> {
        (0..self.shard_depth)
            .map(|level| {
                let start = level * self.shard_width;
                digest.get(start..start + self.shard_width)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(HashAlgorithm::Md5, "37b51d194a7513e45b56f6524f2d51f2")]
    #[case(
        HashAlgorithm::Sha224,
        "07daf010de7f7f0d8d76a76eb8d1eb40182c8d1e7a3877a6686c9bf0"
    )]
    #[case(
        HashAlgorithm::Sha256,
        "fcde2b2edba56bf408601fb721fe9b5c338d10ee429ea04fae5511b68fbf8fb9"
    )]
    #[case(
        HashAlgorithm::Sha384,
        "14919aaff0da5efeb871fe8a438061c1996e88bfe199e2796b3b5c5c65714f61183adc53d48c3a32734ca6faf7d7fda8"
    )]
    #[case(
        HashAlgorithm::Blake2b256,
        "844181b39a1b15b417243e6231381b447a3f8b44aa15fbeb845c5d716696e71d"
    )]
    fn test_hasher(#[case] algorithm: HashAlgorithm, #[case] expected: &str) {
        let mut hasher = algorithm.hasher();
        hasher.update(b"bar");
        let digest = hasher.finalize();
        assert_eq!(digest.len(), algorithm.output_len());
        assert_eq!(DigestEncoding::Hex.encode(&digest), expected);
    }

    #[test]
    fn test_base64_encoding() {
        let mut hasher = HashAlgorithm::Sha224.hasher();
        hasher.update(b"bar");
        let encoded = DigestEncoding::Base64Url.encode(&hasher.finalize());
        assert_eq!(encoded, "B9rwEN5_fw2NdqduuNHrQBgsjR56OHemaGyb8A");
        assert_eq!(encoded.len(), DigestEncoding::Base64Url.encoded_len(28));
    }

    #[rstest]
    #[case(DigestEncoding::Hex, "07daf010de", true)]
    #[case(DigestEncoding::Hex, "07DAF010DE", false)]
    #[case(DigestEncoding::Hex, "07dag010de", false)]
    #[case(DigestEncoding::Hex, "07da-010de", false)]
    #[case(DigestEncoding::Base64Url, "B9rwEN5_fw-Z", true)]
    #[case(DigestEncoding::Base64Url, "B9rw/N5+fw", false)]
    fn test_is_encoded(
        #[case] encoding: DigestEncoding,
        #[case] encoded: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(encoding.is_encoded(encoded), expected);
    }

    #[rstest]
    #[case(2, 2, true)]
    #[case(1, 56, true)]
    #[case(0, 0, true)]
    #[case(8, 7, true)]
    #[case(8, 8, false)]
    #[case(57, 1, false)]
    fn test_validate_layout(#[case] width: usize, #[case] depth: usize, #[case] valid: bool) {
        let config = HashConfig {
            shard_width: width,
            shard_depth: depth,
            ..HashConfig::default()
        };
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_empty_segment_is_rejected() {
        let config = HashConfig {
            shard_width: 0,
            shard_depth: 3,
            ..HashConfig::default()
        };
        assert_matches!(
            config.validate(),
            Err(HashConfigError::EmptyShardSegment(3))
        );
    }

    #[test]
    fn test_shard_segments() {
        let config = HashConfig::default();
        assert_eq!(
            config.shard_segments("ab12cdef"),
            Some(vec!["ab", "12"])
        );
        assert_eq!(config.shard_segments("abc"), None);

        let flat = HashConfig {
            shard_depth: 0,
            ..HashConfig::default()
        };
        assert_eq!(flat.shard_segments("ab12cdef"), Some(vec![]));
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: HashConfig = toml::from_str("shard-depth = 3").unwrap();
        assert_eq!(config.algorithm, HashAlgorithm::Sha224);
        assert_eq!(config.encoding, DigestEncoding::Hex);
        assert_eq!(config.shard_width, 2);
        assert_eq!(config.shard_depth, 3);

        let config: HashConfig =
            toml::from_str("algorithm = \"blake2b256\"\nencoding = \"base64-url\"").unwrap();
        assert_eq!(config.algorithm, HashAlgorithm::Blake2b256);
        assert_eq!(config.encoding, DigestEncoding::Base64Url);
    }

    proptest! {
        #[test]
        fn shard_segments_are_consecutive_prefixes(
            digest in "[0-9a-f]{56}",
            width in 1usize..=8,
            depth in 0usize..=7,
        ) {
            let config = HashConfig { shard_width: width, shard_depth: depth, ..HashConfig::default() };
            prop_assert!(config.validate().is_ok());

            let segments = config.shard_segments(&digest).unwrap();
            prop_assert_eq!(segments.len(), depth);
            prop_assert!(segments.iter().all(|segment| segment.len() == width));
            prop_assert_eq!(segments.concat(), &digest[..width * depth]);
        }
    }
}
