use std::{fmt::Debug, time::Instant};

use digest::DynDigest;

use crate::{DigestEncoding, HashAlgorithm};

/// An error raised by a [`DigestAccumulator`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AccumulatorError {
    /// Data was offered after the digest was already computed.
    #[error("the digest accumulator has already been finalized")]
    Finalized,
}

impl AccumulatorError {
    /// Returns the accumulator error wrapped by an I/O error, if any.
    ///
    /// The [`crate::AccumulatingWriter`] reports accumulator failures through
    /// the `std::io` error channel, this recovers them.
    pub fn from_io(err: &std::io::Error) -> Option<&AccumulatorError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<AccumulatorError>())
    }
}

/// A snapshot of what a [`DigestAccumulator`] has observed so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccumulatorState {
    /// The number of bytes consumed.
    pub size_bytes: u64,

    /// The observed throughput in bytes per second.
    pub bytes_per_second: u64,

    /// The encoded digest. Only present once the accumulator was finalized.
    pub content_address: Option<String>,
}

/// Computes the digest, size and throughput of a stream of chunks.
///
/// Chunks are fed in with [`DigestAccumulator::consume`]. Once the stream has
/// ended [`DigestAccumulator::finalize`] computes the encoded digest, after
/// which the accumulator no longer accepts data.
pub struct DigestAccumulator {
    algorithm: HashAlgorithm,
    encoding: DigestEncoding,
    hasher: Option<Box<dyn DynDigest + Send>>,
    started: Instant,
    state: AccumulatorState,
}

impl DigestAccumulator {
    /// Constructs a new accumulator for the given algorithm and encoding.
    pub fn new(algorithm: HashAlgorithm, encoding: DigestEncoding) -> Self {
        Self {
            algorithm,
            encoding,
            hasher: Some(algorithm.hasher()),
            started: Instant::now(),
            state: AccumulatorState::default(),
        }
    }

    /// Returns the algorithm this instance hashes with.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Returns true if [`Self::finalize`] has been called.
    pub fn is_finalized(&self) -> bool {
        self.hasher.is_none()
    }

    /// Adds a chunk of data.
    pub fn consume(&mut self, chunk: &[u8]) -> Result<(), AccumulatorError> {
        let hasher = self.hasher.as_mut().ok_or(AccumulatorError::Finalized)?;
        if chunk.is_empty() {
            return Ok(());
        }

        // Throughput is measured from the first byte, not from construction.
        if self.state.size_bytes == 0 {
            self.started = Instant::now();
        }

        hasher.update(chunk);
        self.state.size_bytes += chunk.len() as u64;
        self.update_throughput();
        Ok(())
    }

    /// Computes the final digest and returns the final state.
    pub fn finalize(&mut self) -> Result<AccumulatorState, AccumulatorError> {
        let hasher = self.hasher.take().ok_or(AccumulatorError::Finalized)?;
        let digest = hasher.finalize();
        self.update_throughput();
        self.state.content_address = Some(self.encoding.encode(&digest));
        Ok(self.state.clone())
    }

    /// Returns the current size and throughput, and the digest if finalized.
    pub fn current_state(&self) -> AccumulatorState {
        self.state.clone()
    }

    fn update_throughput(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis().max(1);
        let bytes_per_second = u128::from(self.state.size_bytes) * 1000 / elapsed_ms;
        self.state.bytes_per_second = u64::try_from(bytes_per_second).unwrap_or(u64::MAX);
    }
}

impl Debug for DigestAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("algorithm", &self.algorithm)
            .field("encoding", &self.encoding)
            .field("finalized", &self.is_finalized())
            .field("state", &self.state)
            .finish()
    }
}
