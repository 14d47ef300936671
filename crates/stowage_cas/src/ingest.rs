//! Streams data into the incoming directory and verifies what ended up on
//! disk.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_digest::{compute_file_digest, AccumulatingWriter, DigestAccumulator, HashConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::{
    error::{Phase, StageError, StoreFailure},
    fault::{FaultInjector, FaultSite, NoFaults},
    payload::{staging_filename, Payload},
};

/// Writes request data to a staging file while computing its address, and
/// independently re-verifies staged files.
#[derive(Debug, Clone)]
pub struct Ingest {
    incoming_root: PathBuf,
    hash: HashConfig,
    file_mode: u32,
    read_buffer_size: usize,
    faults: Arc<dyn FaultInjector>,
}

impl Ingest {
    /// Stages files in `incoming_root`, which must exist.
    pub fn new(incoming_root: impl Into<PathBuf>, hash: HashConfig) -> Self {
        Self {
            incoming_root: incoming_root.into(),
            hash,
            file_mode: 0o440,
            read_buffer_size: 64 * 1024,
            faults: Arc::new(NoFaults),
        }
    }

    /// Sets the unix permissions of staging files.
    #[must_use]
    pub fn with_file_mode(self, file_mode: u32) -> Self {
        Self { file_mode, ..self }
    }

    /// Sets the size of the chunks read from the source.
    #[must_use]
    pub fn with_read_buffer_size(self, read_buffer_size: usize) -> Self {
        Self {
            read_buffer_size: read_buffer_size.max(1),
            ..self
        }
    }

    /// Sets the fault injector consulted before every fallible step.
    #[must_use]
    pub fn with_faults(self, faults: Arc<dyn FaultInjector>) -> Self {
        Self { faults, ..self }
    }

    /// Returns the directory files are staged in.
    pub fn incoming_root(&self) -> &Path {
        &self.incoming_root
    }

    /// Returns the path of the staging file of a request.
    pub(crate) fn staging_path(&self, payload: &Payload) -> Result<PathBuf, StageError> {
        payload
            .staging_filename
            .as_ref()
            .map(|name| self.incoming_root.join(name))
            .ok_or(StageError::Incomplete("staging file"))
    }

    /// Streams `source` into a new staging file.
    ///
    /// The data is hashed as it is written. The first failure of reading the
    /// source, hashing or writing settles the request, after which neither
    /// the source nor the staging file is touched again. Once everything is
    /// written the size of the staging file is compared with the number of
    /// bytes that were streamed.
    ///
    /// On success the returned payload has its staging filename, content
    /// address, size and throughput filled in.
    #[instrument(skip_all, fields(correlation_id = %payload.correlation_id, upload_tag = payload.upload_tag.as_deref()))]
    pub async fn run_pipeline(
        &self,
        mut payload: Payload,
        source: impl AsyncRead + Unpin,
    ) -> Result<Payload, StoreFailure> {
        match self.stage(&mut payload, source).await {
            Ok(()) => Ok(payload),
            Err(err) => Err(StoreFailure::settle(payload, Phase::Ingest, err)),
        }
    }

    async fn stage(
        &self,
        payload: &mut Payload,
        mut source: impl AsyncRead + Unpin,
    ) -> Result<(), StageError> {
        let filename = staging_filename(&payload.correlation_id, payload.upload_tag.as_deref());
        let path = self.incoming_root.join(&filename);
        payload.staging_filename = Some(filename);

        self.faults.checkpoint(FaultSite::StagingCreate)?;
        let file = self
            .create_staging_file(&path)
            .await
            .map_err(|source| StageError::Write {
                path: path.clone(),
                source,
            })?;
        let accumulator = DigestAccumulator::new(self.hash.algorithm, self.hash.encoding);
        let mut writer = AccumulatingWriter::new(file, accumulator);

        let mut buf = vec![0; self.read_buffer_size];
        loop {
            self.faults.checkpoint(FaultSite::SourceRead)?;
            let bytes = source.read(&mut buf).await.map_err(StageError::Source)?;
            if bytes == 0 {
                break;
            }

            self.faults.checkpoint(FaultSite::DigestConsume)?;
            self.faults.checkpoint(FaultSite::StagingWrite)?;
            writer
                .write_all(&buf[..bytes])
                .await
                .map_err(|err| StageError::from_write(&path, err))?;
            payload.record_progress(&writer.accumulator().current_state());
        }

        self.faults.checkpoint(FaultSite::StagingSync)?;
        writer
            .flush()
            .await
            .map_err(|err| StageError::from_write(&path, err))?;
        let (file, mut accumulator) = writer.into_parts();
        file.sync_all()
            .await
            .map_err(|err| StageError::from_write(&path, err))?;
        drop(file);

        self.faults.checkpoint(FaultSite::DigestFinalize)?;
        let state = accumulator.finalize().map_err(StageError::Digest)?;
        payload.record_progress(&state);

        self.faults.checkpoint(FaultSite::ConsistencyStat)?;
        let metadata = fs_err::tokio::metadata(&path)
            .await
            .map_err(|source| StageError::Inspect {
                path: path.clone(),
                source,
            })?;
        if metadata.len() != state.size_bytes {
            return Err(StageError::SizeMismatch {
                path,
                expected: state.size_bytes,
                observed: metadata.len(),
            });
        }

        tracing::debug!(
            size_bytes = state.size_bytes,
            bytes_per_second = state.bytes_per_second,
            "staged {}",
            path.display()
        );
        payload.content_address = state.content_address;
        Ok(())
    }

    async fn create_staging_file(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(self.file_mode);
        options.open(path).await
    }

    /// Re-reads the staged file of a request and checks that its size and
    /// digest match the payload.
    ///
    /// The payload is returned unchanged if they do.
    #[instrument(skip_all, fields(correlation_id = %payload.correlation_id))]
    pub async fn validate(&self, payload: Payload) -> Result<Payload, StoreFailure> {
        match self.reread(&payload).await {
            Ok(()) => Ok(payload),
            Err(err) => Err(StoreFailure::settle(payload, Phase::Validate, err)),
        }
    }

    async fn reread(&self, payload: &Payload) -> Result<(), StageError> {
        let path = self.staging_path(payload)?;
        let expected_digest = payload
            .content_address
            .as_deref()
            .ok_or(StageError::Incomplete("content address"))?;

        self.faults.checkpoint(FaultSite::ValidateRead)?;
        let observed = compute_file_digest(&path, self.hash.algorithm, self.hash.encoding)
            .await
            .map_err(|source| StageError::Inspect {
                path: path.clone(),
                source,
            })?;
        let observed_digest = observed.content_address.unwrap_or_default();

        if observed.size_bytes != payload.size_bytes || observed_digest != expected_digest {
            tracing::warn!(
                expected_size = payload.size_bytes,
                observed_size = observed.size_bytes,
                "staged file {} changed after it was written",
                path.display()
            );
            return Err(StageError::ContentMismatch {
                path,
                expected_size: payload.size_bytes,
                expected_digest: expected_digest.to_string(),
                observed_size: observed.size_bytes,
                observed_digest,
            });
        }

        Ok(())
    }
}
