//! Places validated staging files into the digest sharded tree.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use fs_err::tokio as fs;
use parking_lot::Mutex;
use rand::Rng;
use simple_spawn_blocking::tokio::run_blocking_task;
use stowage_digest::HashConfig;
use tokio::io::AsyncRead;
use tracing::instrument;

use crate::{
    config::StoreConfig,
    error::{Phase, StageError, StoreError, StoreFailure},
    fault::{FaultInjector, FaultSite, NoFaults, RandomFaults},
    ingest::Ingest,
    payload::Payload,
};

/// A content addressable store on the local filesystem.
///
/// Data is streamed into a staging file in the incoming directory, verified,
/// and then moved to `<store root>/<shard dirs>/<digest>`. Content that is
/// already present is not stored twice.
///
/// The incoming directory and the store root should live on the same
/// filesystem, otherwise the final move cannot be a rename.
#[derive(Debug, Clone)]
pub struct ContentStore {
    store_root: PathBuf,
    hash: HashConfig,
    duplicate_retention: f64,
    dir_mode: u32,
    ingest: Ingest,
    faults: Arc<dyn FaultInjector>,
    /// Serializes the final existence check and rename of all clones of this
    /// store.
    placement_lock: Arc<Mutex<()>>,
}

impl ContentStore {
    /// Opens a store. Both directories must exist and be readable and
    /// writable.
    ///
    /// If the configuration enables fault injection a [`RandomFaults`]
    /// injector is installed, otherwise no faults are injected.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let faults: Arc<dyn FaultInjector> = match &config.faults {
            Some(faults) => Arc::new(RandomFaults::from_config(faults)),
            None => Arc::new(NoFaults),
        };
        Self::with_faults(config, faults)
    }

    /// Opens a store that consults `faults` before every fallible step.
    pub fn with_faults(
        config: StoreConfig,
        faults: Arc<dyn FaultInjector>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let incoming_root = accessible_root(&config.incoming_root)?;
        let store_root = accessible_root(&config.store_root)?;
        warn_if_on_different_devices(&incoming_root, &store_root);

        let ingest = Ingest::new(incoming_root, config.hash)
            .with_file_mode(config.file_mode)
            .with_read_buffer_size(config.read_buffer_size)
            .with_faults(faults.clone());

        Ok(Self {
            store_root,
            hash: config.hash,
            duplicate_retention: config.duplicate_retention,
            dir_mode: config.dir_mode,
            ingest,
            faults,
            placement_lock: Arc::default(),
        })
    }

    /// Returns the canonical path of the store root.
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Returns the canonical path of the incoming directory.
    pub fn incoming_root(&self) -> &Path {
        self.ingest.incoming_root()
    }

    /// Returns the ingest stage of this store.
    pub fn ingest(&self) -> &Ingest {
        &self.ingest
    }

    /// Returns the shard directories of a digest relative to the store root,
    /// e.g. `ab/12` for `ab12cd...` with the default layout.
    ///
    /// Returns `None` if `digest` is not a digest this store can contain.
    pub fn shard_path(&self, digest: &str) -> Option<PathBuf> {
        if !self.is_valid_digest(digest) {
            return None;
        }
        self.hash
            .shard_segments(digest)
            .map(|segments| segments.into_iter().collect())
    }

    /// Returns the absolute path an object with the given digest is stored at.
    pub fn object_path(&self, digest: &str) -> Option<PathBuf> {
        self.shard_path(digest)
            .map(|shard| self.store_root.join(shard).join(digest))
    }

    /// Returns true if the store contains an object with the given digest.
    ///
    /// A digest this store cannot contain is never present.
    pub async fn contains(&self, digest: &str) -> std::io::Result<bool> {
        match self.object_path(digest) {
            Some(path) => fs::try_exists(&path).await,
            None => Ok(false),
        }
    }

    fn is_valid_digest(&self, digest: &str) -> bool {
        digest.len() == self.hash.digest_len() && self.hash.encoding.is_encoded(digest)
    }

    /// Streams `source` into the store.
    ///
    /// The data is staged, re-verified and then moved into the store. The
    /// returned payload tells where the content lives and whether it was
    /// already present.
    #[instrument(skip_all, fields(upload_tag = upload_tag.as_deref()))]
    pub async fn store_stream(
        &self,
        source: impl AsyncRead + Unpin,
        upload_tag: Option<String>,
    ) -> Result<Payload, StoreFailure> {
        let payload = Payload::new(upload_tag);
        let request = payload.clone();
        let result = self
            .ingest_and_place(payload, source)
            .await
            .map_err(|err| StoreFailure::settle(request, Phase::Placement, err));

        match &result {
            Ok(payload) => tracing::debug!(
                correlation_id = %payload.correlation_id,
                content_address = payload.content_address.as_deref(),
                is_duplicate = payload.is_duplicate,
                "stored {} bytes",
                payload.size_bytes
            ),
            Err(failure) => tracing::warn!("{failure}"),
        }
        result
    }

    async fn ingest_and_place(
        &self,
        payload: Payload,
        source: impl AsyncRead + Unpin,
    ) -> Result<Payload, StageError> {
        let payload = self.ingest.run_pipeline(payload, source).await?;
        let payload = self.ingest.validate(payload).await?;
        self.move_into_store(payload)
            .await
            .map_err(StageError::from)
    }

    /// Opens the file at `path` and stores its content, using the file name
    /// as upload tag.
    pub async fn store_file(&self, path: impl AsRef<Path>) -> Result<Payload, StoreFailure> {
        let path = path.as_ref();
        let upload_tag = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        match fs::File::open(path).await {
            Ok(file) => self.store_stream(file, upload_tag).await,
            Err(err) => Err(StoreFailure::settle(
                Payload::new(upload_tag),
                Phase::Ingest,
                StageError::Source(err),
            )),
        }
    }

    /// Moves the validated staging file of a request into the store.
    ///
    /// If an object with the same digest already exists the request is marked
    /// as a duplicate and its staging file is removed, unless it is sampled
    /// for retention.
    ///
    /// Within a process, and across clones of this store, an object is
    /// placed exactly once and every other request for the same content is
    /// reported as a duplicate. Other processes writing to the same store are
    /// not synchronized with, so one of two such writers of the same content
    /// may not be reported as a duplicate.
    #[instrument(skip_all, fields(correlation_id = %payload.correlation_id))]
    pub async fn move_into_store(&self, mut payload: Payload) -> Result<Payload, StoreFailure> {
        match self.place(&mut payload).await {
            Ok(()) => Ok(payload),
            Err(err) => Err(StoreFailure::settle(payload, Phase::Placement, err)),
        }
    }

    async fn place(&self, payload: &mut Payload) -> Result<(), StageError> {
        let staged = self.ingest.staging_path(payload)?;
        let digest = payload
            .content_address
            .clone()
            .ok_or(StageError::Incomplete("content address"))?;
        let sharded_path = self
            .shard_path(&digest)
            .ok_or_else(|| StageError::InvalidAddress(digest.clone()))?;
        let target = self.store_root.join(&sharded_path).join(&digest);

        self.faults.checkpoint(FaultSite::PlacementAccess)?;
        fs::File::open(&staged)
            .await
            .map_err(|err| StageError::placement("open staged file", &staged, err))?;

        self.faults.checkpoint(FaultSite::PlacementExists)?;
        let mut is_duplicate = exists(&target).await?;

        if !is_duplicate {
            self.faults.checkpoint(FaultSite::PlacementMkdir)?;
            let shard_dir = self.store_root.join(&sharded_path);
            self.create_shard_dirs(&shard_dir).await?;

            // Another request may have placed the object in the meantime.
            self.faults.checkpoint(FaultSite::PlacementExists)?;
            is_duplicate = exists(&target).await?;
        }

        if !is_duplicate {
            self.faults.checkpoint(FaultSite::PlacementRename)?;
            is_duplicate = rename_if_absent(
                self.placement_lock.clone(),
                staged.clone(),
                target.clone(),
            )
            .await?;
        }

        payload.sharded_path = Some(sharded_path);
        payload.store_path = Some(target);
        payload.is_duplicate = is_duplicate;

        if is_duplicate {
            self.discard_duplicate(&staged).await?;
        }
        Ok(())
    }

    async fn create_shard_dirs(&self, dir: &Path) -> Result<(), StageError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.dir_mode);
        builder
            .create(dir)
            .await
            .map_err(|err| StageError::placement("create shard directory", dir, err))
    }

    fn sample_for_retention(&self) -> bool {
        self.duplicate_retention > 0.0
            && rand::thread_rng().gen_bool(self.duplicate_retention.min(1.0))
    }

    async fn discard_duplicate(&self, staged: &Path) -> Result<(), StageError> {
        if self.sample_for_retention() {
            tracing::debug!(
                "retaining duplicate staging file {} for inspection",
                staged.display()
            );
            return Ok(());
        }

        self.faults.checkpoint(FaultSite::DuplicateCleanup)?;
        fs::remove_file(staged)
            .await
            .map_err(|err| StageError::placement("remove duplicate staging file", staged, err))
    }
}

/// Canonicalizes a root directory and checks that it can be listed and
/// written to.
fn accessible_root(path: &Path) -> Result<PathBuf, StoreError> {
    let inaccessible = |source| StoreError::InaccessibleRoot {
        path: path.to_path_buf(),
        source,
    };

    let canonical = dunce::canonicalize(path).map_err(inaccessible)?;
    if !canonical.is_dir() {
        return Err(StoreError::NotADirectory(path.to_path_buf()));
    }

    fs_err::read_dir(&canonical).map_err(inaccessible)?;
    tempfile::Builder::new()
        .prefix(".stowage-probe")
        .tempfile_in(&canonical)
        .map_err(inaccessible)?;

    Ok(canonical)
}

#[cfg(unix)]
fn warn_if_on_different_devices(incoming_root: &Path, store_root: &Path) {
    use std::os::unix::fs::MetadataExt;

    if let (Ok(incoming), Ok(store)) = (
        std::fs::metadata(incoming_root),
        std::fs::metadata(store_root),
    ) {
        if incoming.dev() != store.dev() {
            tracing::warn!(
                "{} and {} are on different devices, moving files into the store will fail",
                incoming_root.display(),
                store_root.display()
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_on_different_devices(_incoming_root: &Path, _store_root: &Path) {}

async fn exists(path: &Path) -> Result<bool, StageError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|err| StageError::placement("check for existing object", path, err))
}

/// Renames `staged` to `target` unless `target` exists. Returns true if the
/// target already existed.
///
/// The check and the rename happen while `lock` is held.
async fn rename_if_absent(
    lock: Arc<Mutex<()>>,
    staged: PathBuf,
    target: PathBuf,
) -> Result<bool, StageError> {
    run_blocking_task(move || {
        let _guard = lock.lock();
        if target
            .try_exists()
            .map_err(|err| StageError::placement("check for existing object", &target, err))?
        {
            return Ok(true);
        }
        fs_err::rename(&staged, &target)
            .map_err(|err| StageError::placement("move staged file into the store", &staged, err))?;
        Ok(false)
    })
    .await
}
