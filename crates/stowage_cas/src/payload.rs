//! The record that describes a single store request as it moves through the
//! pipeline.

use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_digest::AccumulatorState;

use crate::error::FailureRecord;

/// The last timestamp handed out by [`CorrelationId::generate`].
static LAST_TIMESTAMP_NANOS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Uniquely identifies a single request within this process.
///
/// The identifier is a UTC timestamp with nanosecond resolution, formatted as
/// `YYYY-MM-DD_HHMM-SS_mmm-uuu-nnn`. Identifiers generated by the same process
/// are strictly increasing, so two requests never share one even if the clock
/// is coarse or goes backwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a new identifier from the current time.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = LAST_TIMESTAMP_NANOS.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match LAST_TIMESTAMP_NANOS.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self::from_timestamp_nanos(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Formats the identifier for the given number of nanoseconds since the
    /// unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        let time = DateTime::<Utc>::from_timestamp_nanos(nanos);
        let subsec = time.timestamp_subsec_nanos();
        Self(format!(
            "{}_{:03}-{:03}-{:03}",
            time.format("%Y-%m-%d_%H%M-%S"),
            subsec / 1_000_000,
            subsec / 1_000 % 1_000,
            subsec % 1_000
        ))
    }

    /// Returns the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the name of the staging file for a request.
///
/// The name is the correlation id, followed by `__` and the upload tag if
/// there is one. Characters of the tag that are not safe in a file name are
/// replaced by `_` so the file always ends up directly in the incoming
/// directory.
pub fn staging_filename(correlation_id: &CorrelationId, upload_tag: Option<&str>) -> String {
    match upload_tag {
        Some(tag) if !tag.is_empty() => {
            let tag: String = tag
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            format!("{correlation_id}__{tag}")
        }
        _ => correlation_id.to_string(),
    }
}

/// Describes the progress and outcome of one store request.
///
/// A payload is created when a request starts and is enriched by every stage
/// it passes through. Successful requests return it with all fields filled
/// in. Failed requests return it inside a [`crate::StoreFailure`] with `error`
/// set, at least one entry in `errors` and without a `content_address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// The label the caller attached to the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_tag: Option<String>,

    /// Identifies the request.
    pub correlation_id: CorrelationId,

    /// The name of the file in the incoming directory the data was staged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_filename: Option<String>,

    /// The encoded digest of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,

    /// The number of bytes received.
    #[serde(default)]
    pub size_bytes: u64,

    /// The throughput at which the bytes were received.
    #[serde(default)]
    pub bytes_per_second: u64,

    /// The shard directories of the object, relative to the store root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharded_path: Option<PathBuf>,

    /// The absolute path of the object in the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// True if the store already contained the content.
    #[serde(default)]
    pub is_duplicate: bool,

    /// True if the request failed.
    #[serde(default)]
    pub error: bool,

    /// Everything that went wrong, in the order it happened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FailureRecord>,
}

impl Payload {
    /// Creates the payload for a new request.
    pub fn new(upload_tag: Option<String>) -> Self {
        Self::with_correlation_id(CorrelationId::generate(), upload_tag)
    }

    /// Creates a payload for a request with a known correlation id.
    pub fn with_correlation_id(correlation_id: CorrelationId, upload_tag: Option<String>) -> Self {
        Self {
            upload_tag,
            correlation_id,
            staging_filename: None,
            content_address: None,
            size_bytes: 0,
            bytes_per_second: 0,
            sharded_path: None,
            store_path: None,
            is_duplicate: false,
            error: false,
            errors: Vec::new(),
        }
    }

    /// Copies the size and throughput of an accumulator into this payload.
    pub(crate) fn record_progress(&mut self, state: &AccumulatorState) {
        self.size_bytes = state.size_bytes;
        self.bytes_per_second = state.bytes_per_second;
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_correlation_id_format() {
        let id = CorrelationId::from_timestamp_nanos(1_611_665_450_542_383_044);
        assert_eq!(id.as_str(), "2021-01-26_1250-50_542-383-044");
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let mut ids: Vec<_> = (0..1000).map(|_| CorrelationId::generate()).collect();
        let generated = ids.clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
        assert_eq!(ids, generated);
    }

    #[rstest]
    #[case(None, "2021-01-26_1250-50_542-383-044")]
    #[case(Some(""), "2021-01-26_1250-50_542-383-044")]
    #[case(Some("report.pdf"), "2021-01-26_1250-50_542-383-044__report.pdf")]
    #[case(Some("../etc/passwd"), "2021-01-26_1250-50_542-383-044__.._etc_passwd")]
    #[case(Some("a b\\c"), "2021-01-26_1250-50_542-383-044__a_b_c")]
    fn test_staging_filename(#[case] tag: Option<&str>, #[case] expected: &str) {
        let id = CorrelationId::from_timestamp_nanos(1_611_665_450_542_383_044);
        assert_eq!(staging_filename(&id, tag), expected);
    }

    #[test]
    fn test_serialize_success_payload() {
        let mut payload = Payload::with_correlation_id(
            CorrelationId::from_timestamp_nanos(1_611_665_450_542_383_044),
            Some("bar".to_string()),
        );
        payload.content_address = Some("07da".to_string());
        payload.size_bytes = 3;

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["correlationId"], "2021-01-26_1250-50_542-383-044");
        assert_eq!(json["uploadTag"], "bar");
        assert_eq!(json["contentAddress"], "07da");
        assert_eq!(json["sizeBytes"], 3);
        assert_eq!(json["isDuplicate"], false);
        assert!(json.get("errors").is_none());
    }
}
