#![deny(missing_docs)]

//! Computes content addresses for the stowage store.
//!
//! The hashing itself is done by the
//! [RustCrypto/hashes](https://github.com/RustCrypto/hashes) crates. This crate
//! adds the pieces needed to address content while it is streaming:
//!
//! - [`HashConfig`]: the hash algorithm, the encoding of the digest and how
//!   the digest is split into shard directories.
//! - [`DigestAccumulator`]: keeps a running digest, the number of bytes seen
//!   and the observed throughput.
//! - [`AccumulatingWriter`]: an [`tokio::io::AsyncWrite`] that forwards data to
//!   another writer while feeding the accumulator. Backpressure of the inner
//!   writer is passed on unchanged.
//! - [`compute_file_digest`] and [`compute_file_digest_sync`]: re-read a file
//!   from disk and compute its size and digest.
//!
//! # Examples
//!
//! ```
//! use stowage_digest::{DigestAccumulator, DigestEncoding, HashAlgorithm};
//!
//! let mut accumulator = DigestAccumulator::new(HashAlgorithm::Sha224, DigestEncoding::Hex);
//! accumulator.consume(b"bar").unwrap();
//! let state = accumulator.finalize().unwrap();
//! assert_eq!(state.size_bytes, 3);
//! assert_eq!(
//!     state.content_address.as_deref(),
//!     Some("07daf010de7f7f0d8d76a76eb8d1eb40182c8d1e7a3877a6686c9bf0")
//! );
//! ```

mod accumulator;
mod algorithm;
mod writer;

use std::{io::Read, path::Path};

use digest::DynDigest as _;
use tokio::io::AsyncReadExt;

pub use accumulator::{AccumulatorError, AccumulatorState, DigestAccumulator};
pub use algorithm::{DigestEncoding, HashAlgorithm, HashConfig, HashConfigError};
pub use digest;
pub use writer::AccumulatingWriter;

/// The size of the buffer used when re-reading files.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Computes the size and digest of the file at the specified location by
/// reading it from start to end.
pub async fn compute_file_digest(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
    encoding: DigestEncoding,
) -> Result<AccumulatorState, std::io::Error> {
    let mut file = fs_err::tokio::File::open(path.as_ref()).await?;
    let mut accumulator = DigestAccumulator::new(algorithm, encoding);

    let mut buf = vec![0; READ_BUFFER_SIZE];
    loop {
        let bytes = file.read(&mut buf).await?;
        if bytes == 0 {
            break;
        }
        accumulator
            .consume(&buf[..bytes])
            .map_err(std::io::Error::other)?;
    }

    accumulator.finalize().map_err(std::io::Error::other)
}

/// Blocking version of [`compute_file_digest`].
pub fn compute_file_digest_sync(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
    encoding: DigestEncoding,
) -> Result<AccumulatorState, std::io::Error> {
    let mut file = fs_err::File::open(path.as_ref())?;
    let mut accumulator = DigestAccumulator::new(algorithm, encoding);

    let mut buf = vec![0; READ_BUFFER_SIZE];
    loop {
        let bytes = file.read(&mut buf)?;
        if bytes == 0 {
            break;
        }
        accumulator
            .consume(&buf[..bytes])
            .map_err(std::io::Error::other)?;
    }

    accumulator.finalize().map_err(std::io::Error::other)
}

/// Computes the encoded digest of the specified bytes.
pub fn compute_bytes_digest(
    bytes: impl AsRef<[u8]>,
    algorithm: HashAlgorithm,
    encoding: DigestEncoding,
) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(bytes.as_ref());
    encoding.encode(&hasher.finalize())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&b""[..], "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f")]
    #[case(&b"bar"[..], "07daf010de7f7f0d8d76a76eb8d1eb40182c8d1e7a3877a6686c9bf0")]
    #[case(&b"1234567890"[..], "b564e8a5cf20a254eb34e1ae98c3d957c351ce854491ccbeaeb220ea")]
    #[tokio::test]
    async fn test_compute_file_digest(#[case] input: &[u8], #[case] expected: &str) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(input).unwrap();
        file.flush().unwrap();

        let state = compute_file_digest(file.path(), HashAlgorithm::Sha224, DigestEncoding::Hex)
            .await
            .unwrap();

        assert_eq!(state.size_bytes, input.len() as u64);
        assert_eq!(state.content_address.as_deref(), Some(expected));
        assert_eq!(
            compute_file_digest_sync(file.path(), HashAlgorithm::Sha224, DigestEncoding::Hex)
                .unwrap()
                .content_address,
            state.content_address
        );
        assert_eq!(
            compute_bytes_digest(input, HashAlgorithm::Sha224, DigestEncoding::Hex),
            expected
        );
    }

    #[tokio::test]
    async fn test_compute_file_digest_large() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0x7f; 10_000_000]).unwrap();
        file.flush().unwrap();

        let state = compute_file_digest(file.path(), HashAlgorithm::Sha224, DigestEncoding::Hex)
            .await
            .unwrap();
        assert_eq!(state.size_bytes, 10_000_000);
        assert_eq!(
            state.content_address.as_deref(),
            Some("dfd3b702949746ad61f1fe238312378c5c8250ccf13a58572357f02d")
        );
    }

    #[tokio::test]
    async fn test_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let err = compute_file_digest(&path, HashAlgorithm::Sha224, DigestEncoding::Hex)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn test_compute_file_digest_sync() {
        let data = vec![0x7f; 200_000];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let state =
            compute_file_digest_sync(file.path(), HashAlgorithm::Sha256, DigestEncoding::Base64Url)
                .unwrap();
        assert_eq!(state.size_bytes, 200_000);
        assert_eq!(
            state.content_address,
            Some(compute_bytes_digest(
                &data,
                HashAlgorithm::Sha256,
                DigestEncoding::Base64Url
            ))
        );

        let err = compute_file_digest_sync(
            file.path().with_extension("missing"),
            HashAlgorithm::Sha256,
            DigestEncoding::Hex,
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
