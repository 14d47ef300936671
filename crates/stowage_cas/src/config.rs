//! Configuration of a [`crate::ContentStore`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stowage_digest::HashConfig;
use thiserror::Error;

use crate::fault::FaultSite;

/// The configuration is not valid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid value for a field.
    #[error("Invalid value for field {0}: {1}")]
    InvalidValue(String, String),
}

/// An error that occurs while loading a configuration file.
#[derive(Error, Debug)]
pub enum LoadError {
    /// IO error while reading configuration file.
    #[error("IO error while reading configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing configuration file.
    #[error("Error parsing configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Error validating configuration.
    #[error("Error validating configuration: {0}")]
    ValidationError(#[from] ValidationError),
}

/// Configures a store.
///
/// ```toml
/// incoming-root = "incoming"
/// store-root = "objects"
/// duplicate-retention = 0.05
///
/// [hash]
/// algorithm = "sha224"
/// encoding = "hex"
/// shard-width = 2
/// shard-depth = 2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// The directory data is staged in before it is moved into the store.
    pub incoming_root: PathBuf,

    /// The root of the content addressed tree.
    pub store_root: PathBuf,

    /// How content is hashed and sharded.
    #[serde(default)]
    pub hash: HashConfig,

    /// The fraction of duplicate uploads whose staging file is kept in the
    /// incoming directory instead of being removed.
    #[serde(default = "default_duplicate_retention")]
    pub duplicate_retention: f64,

    /// The unix permissions of staged and stored files. Ignored on other
    /// platforms.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,

    /// The unix permissions of created shard directories. Ignored on other
    /// platforms.
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,

    /// The size of the buffer used to read from the source.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Enables synthesized failures. Never set this in production.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faults: Option<FaultConfig>,
}

fn default_duplicate_retention() -> f64 {
    0.05
}

fn default_file_mode() -> u32 {
    0o440
}

fn default_dir_mode() -> u32 {
    0o750
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

/// Configures the [`crate::RandomFaults`] injector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FaultConfig {
    /// The seed of the random sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// The probability with which every site fails.
    #[serde(default)]
    pub probability: f64,

    /// Overrides the probability of individual sites.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sites: Vec<SiteProbability>,
}

/// The probability of a single [`FaultSite`] failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SiteProbability {
    /// The site.
    pub site: FaultSite,
    /// The probability it fails.
    pub probability: f64,
}

fn validate_fraction(field: &str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue(
            field.to_string(),
            format!("{value} is not between 0 and 1"),
        ))
    }
}

impl StoreConfig {
    /// Constructs a configuration with default settings for the given
    /// directories.
    pub fn new(incoming_root: impl Into<PathBuf>, store_root: impl Into<PathBuf>) -> Self {
        Self {
            incoming_root: incoming_root.into(),
            store_root: store_root.into(),
            hash: HashConfig::default(),
            duplicate_retention: default_duplicate_retention(),
            file_mode: default_file_mode(),
            dir_mode: default_dir_mode(),
            read_buffer_size: default_read_buffer_size(),
            faults: None,
        }
    }

    /// Loads a configuration from a TOML file.
    ///
    /// Relative directories are resolved against the directory that contains
    /// the file.
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let contents = fs_err::read_to_string(path)?;
        let mut config: StoreConfig = toml::from_str(&contents)?;

        if let Some(base) = path.parent() {
            config.incoming_root = base.join(&config.incoming_root);
            config.store_root = base.join(&config.store_root);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the values in this configuration are usable.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.hash
            .validate()
            .map_err(|err| ValidationError::InvalidValue("hash".to_string(), err.to_string()))?;

        validate_fraction("duplicate-retention", self.duplicate_retention)?;

        if self.read_buffer_size == 0 {
            return Err(ValidationError::InvalidValue(
                "read-buffer-size".to_string(),
                "must be larger than zero".to_string(),
            ));
        }

        if let Some(faults) = &self.faults {
            validate_fraction("faults.probability", faults.probability)?;
            for site in &faults.sites {
                validate_fraction(&format!("faults.sites.{}", site.site), site.probability)?;
            }
        }

        Ok(())
    }
}
