//! Hooks to synthesize failures at the fallible steps of a request.
//!
//! Every fallible operation of the ingest and placement pipeline calls
//! [`FaultInjector::checkpoint`] right before it performs the real work. The
//! default [`NoFaults`] never fails. Tests use [`FailAt`] to force a specific
//! branch, or [`RandomFaults`] to fail with a configured probability from a
//! reproducible seed.

use std::{
    collections::{HashMap, HashSet},
    fmt::{Debug, Display, Formatter},
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{config::FaultConfig, error::FailureKind};

/// A step of the pipeline that consults the [`FaultInjector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultSite {
    /// Reading a chunk from the source.
    SourceRead,
    /// Feeding a chunk into the digest.
    DigestConsume,
    /// Computing the final digest.
    DigestFinalize,
    /// Creating the staging file.
    StagingCreate,
    /// Writing a chunk to the staging file.
    StagingWrite,
    /// Flushing the staging file to disk.
    StagingSync,
    /// Checking the size of the staging file.
    ConsistencyStat,
    /// Re-reading the staged file.
    ValidateRead,
    /// Checking the staged file before it is moved.
    PlacementAccess,
    /// Creating the shard directories.
    PlacementMkdir,
    /// Checking whether the object already exists.
    PlacementExists,
    /// Moving the staged file into the store.
    PlacementRename,
    /// Removing the staged copy of a duplicate.
    DuplicateCleanup,
}

impl FaultSite {
    /// All sites, in pipeline order.
    pub const ALL: [FaultSite; 13] = [
        FaultSite::SourceRead,
        FaultSite::DigestConsume,
        FaultSite::DigestFinalize,
        FaultSite::StagingCreate,
        FaultSite::StagingWrite,
        FaultSite::StagingSync,
        FaultSite::ConsistencyStat,
        FaultSite::ValidateRead,
        FaultSite::PlacementAccess,
        FaultSite::PlacementMkdir,
        FaultSite::PlacementExists,
        FaultSite::PlacementRename,
        FaultSite::DuplicateCleanup,
    ];

    /// Returns the kind of failure a fault at this site is reported as.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            FaultSite::SourceRead => FailureKind::SourceStreamFailure,
            FaultSite::DigestConsume | FaultSite::DigestFinalize => FailureKind::DigestStageFailure,
            FaultSite::StagingCreate | FaultSite::StagingWrite | FaultSite::StagingSync => {
                FailureKind::WriteStageFailure
            }
            FaultSite::ConsistencyStat | FaultSite::ValidateRead => {
                FailureKind::ConsistencyMismatch
            }
            FaultSite::PlacementAccess
            | FaultSite::PlacementMkdir
            | FaultSite::PlacementExists
            | FaultSite::PlacementRename
            | FaultSite::DuplicateCleanup => FailureKind::PlacementFailure,
        }
    }

    /// Returns the name of the site as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            FaultSite::SourceRead => "source-read",
            FaultSite::DigestConsume => "digest-consume",
            FaultSite::DigestFinalize => "digest-finalize",
            FaultSite::StagingCreate => "staging-create",
            FaultSite::StagingWrite => "staging-write",
            FaultSite::StagingSync => "staging-sync",
            FaultSite::ConsistencyStat => "consistency-stat",
            FaultSite::ValidateRead => "validate-read",
            FaultSite::PlacementAccess => "placement-access",
            FaultSite::PlacementMkdir => "placement-mkdir",
            FaultSite::PlacementExists => "placement-exists",
            FaultSite::PlacementRename => "placement-rename",
            FaultSite::DuplicateCleanup => "duplicate-cleanup",
        }
    }
}

impl Display for FaultSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthesized failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("injected fault at {site}")]
pub struct InjectedFault {
    /// Where the fault was injected.
    pub site: FaultSite,
}

/// Decides whether a step of the pipeline should fail.
pub trait FaultInjector: Debug + Send + Sync {
    /// Called right before the operation at `site` is performed. Returning an
    /// error fails the request as if the operation itself had failed.
    fn checkpoint(&self, site: FaultSite) -> Result<(), InjectedFault>;
}

/// A [`FaultInjector`] that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn checkpoint(&self, _site: FaultSite) -> Result<(), InjectedFault> {
        Ok(())
    }
}

/// A [`FaultInjector`] that always fails at a fixed set of sites.
#[derive(Debug, Default, Clone)]
pub struct FailAt {
    sites: HashSet<FaultSite>,
}

impl FailAt {
    /// Fails every time one of `sites` is reached.
    pub fn new(sites: impl IntoIterator<Item = FaultSite>) -> Self {
        Self {
            sites: sites.into_iter().collect(),
        }
    }
}

impl FaultInjector for FailAt {
    fn checkpoint(&self, site: FaultSite) -> Result<(), InjectedFault> {
        if self.sites.contains(&site) {
            Err(InjectedFault { site })
        } else {
            Ok(())
        }
    }
}

/// A [`FaultInjector`] that fails each checkpoint independently with a
/// per-site probability.
///
/// The random sequence is derived from a seed so a run can be reproduced.
#[derive(Debug)]
pub struct RandomFaults {
    rng: Mutex<StdRng>,
    default_probability: f64,
    probabilities: HashMap<FaultSite, f64>,
}

impl RandomFaults {
    /// Fails every site with `default_probability`.
    pub fn new(seed: u64, default_probability: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            default_probability,
            probabilities: HashMap::new(),
        }
    }

    /// Overrides the probability for a single site.
    pub fn with_probability(mut self, site: FaultSite, probability: f64) -> Self {
        self.probabilities.insert(site, probability);
        self
    }

    /// Constructs an instance from configuration. Without a configured seed a
    /// random one is used.
    pub fn from_config(config: &FaultConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        tracing::warn!(seed, "fault injection is enabled");
        config.sites.iter().fold(
            Self::new(seed, config.probability),
            |faults, site| faults.with_probability(site.site, site.probability),
        )
    }

    fn probability(&self, site: FaultSite) -> f64 {
        self.probabilities
            .get(&site)
            .copied()
            .unwrap_or(self.default_probability)
    }
}

impl FaultInjector for RandomFaults {
    fn checkpoint(&self, site: FaultSite) -> Result<(), InjectedFault> {
        let probability = self.probability(site);
        if probability <= 0.0 {
            return Ok(());
        }

        if self.rng.lock().gen_bool(probability.min(1.0)) {
            tracing::debug!(%site, "injecting fault");
            Err(InjectedFault { site })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_no_faults() {
        for site in FaultSite::ALL {
            assert_matches!(NoFaults.checkpoint(site), Ok(()));
        }
    }

    #[test]
    fn test_fail_at() {
        let faults = FailAt::new([FaultSite::StagingWrite]);
        assert_matches!(faults.checkpoint(FaultSite::SourceRead), Ok(()));
        assert_matches!(
            faults.checkpoint(FaultSite::StagingWrite),
            Err(InjectedFault {
                site: FaultSite::StagingWrite
            })
        );
    }

    #[test]
    fn test_random_faults_are_reproducible() {
        let outcomes = |seed| {
            let faults = RandomFaults::new(seed, 0.5);
            (0..64)
                .map(|_| faults.checkpoint(FaultSite::StagingWrite).is_err())
                .collect::<Vec<_>>()
        };

        let first = outcomes(42);
        assert_eq!(first, outcomes(42));
        assert!(first.iter().any(|failed| *failed));
        assert!(first.iter().any(|failed| !*failed));
    }

    #[test]
    fn test_random_faults_per_site() {
        let faults = RandomFaults::new(7, 0.0).with_probability(FaultSite::PlacementRename, 1.0);
        for _ in 0..16 {
            assert_matches!(faults.checkpoint(FaultSite::PlacementMkdir), Ok(()));
            assert_matches!(faults.checkpoint(FaultSite::PlacementRename), Err(_));
        }
    }

    #[test]
    fn test_site_names_match_serde() {
        for site in FaultSite::ALL {
            let json = serde_json::to_value(site).unwrap();
            assert_eq!(json, site.as_str());
        }
    }
}
