#![deny(missing_docs)]

//! A content addressable store (CAS) that ingests byte streams.
//!
//! # Architecture
//!
//! Every request goes through three steps:
//!
//! 1. [`Ingest::run_pipeline`] streams the source into a file in the incoming
//!    directory named `<correlation id>[__<upload tag>]`. The digest, size and
//!    throughput are computed while the bytes flow.
//! 2. [`Ingest::validate`] re-reads the staged file and checks it against what
//!    was streamed.
//! 3. [`ContentStore::move_into_store`] moves the staged file to its place in
//!    the store, based on its digest:
//!
//! ```text
//! <store_root>/
//!   <first 2 chars>/
//!     <next 2 chars>/
//!       <digest>
//! ```
//!
//! [`ContentStore::store_stream`] runs all three.
//!
//! # Failures
//!
//! A failed request yields a [`StoreFailure`]. It carries the [`Payload`] of
//! the request as far as it got, with every failure recorded as a
//! [`FailureRecord`]. The content address of a failed request is never
//! reported.
//!
//! Every fallible step consults a [`FaultInjector`] before it runs, which
//! allows tests to force any failure branch.
//!
//! # Usage
//!
//! ```rust,no_run
//! use stowage_cas::{ContentStore, StoreConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ContentStore::new(StoreConfig::new("/srv/incoming", "/srv/cas"))?;
//! let payload = store.store_stream(&b"bar"[..], Some("bar.txt".to_string())).await?;
//! println!(
//!     "stored {} bytes as {}",
//!     payload.size_bytes,
//!     payload.content_address.unwrap_or_default()
//! );
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod fault;
mod ingest;
mod payload;
mod store;

pub use config::{FaultConfig, LoadError, SiteProbability, StoreConfig, ValidationError};
pub use error::{FailureKind, FailureRecord, Phase, StoreError, StoreFailure};
pub use fault::{FailAt, FaultInjector, FaultSite, InjectedFault, NoFaults, RandomFaults};
pub use ingest::Ingest;
pub use payload::{staging_filename, CorrelationId, Payload};
pub use store::ContentStore;
pub use stowage_digest::{DigestEncoding, HashAlgorithm, HashConfig};
