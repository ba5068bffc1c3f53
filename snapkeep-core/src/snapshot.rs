/*!
Snapshot records and naming.
*/

use crate::{Result, SnapkeepError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point-in-time image of an instance, as recorded in the catalog
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Provider-assigned image identifier (e.g. an AMI id)
    pub id: String,

    /// Identifier of the instance the image was taken from
    pub instance_id: String,

    /// Name proposed to the provider when the image was created
    pub name: String,

    /// When the provider confirmed the image
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot record
    ///
    /// # Example
    /// ```rust
    /// use chrono::Utc;
    /// use snapkeep_core::Snapshot;
    ///
    /// let snapshot = Snapshot::new("ami-1", "i-1", "i-1-snapshot", Utc::now());
    /// assert_eq!(snapshot.instance_id, "i-1");
    /// ```
    pub fn new<S1, S2, S3>(id: S1, instance_id: S2, name: S3, created_at: DateTime<Utc>) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            name: name.into(),
            created_at,
        }
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SnapkeepError::validation("snapshot id cannot be empty"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(SnapkeepError::validation("instance_id cannot be empty"));
        }
        Ok(())
    }
}

/// Name proposed to the provider for an image of `instance_id` taken in the
/// run `run_id` that started at `run_started_at`
///
/// Format: `{instance_id}-snapshot-{%Y%m%d-%H%M%S}-{run}` where `run` is the
/// first eight hex digits of the run id. The same run always proposes the
/// same name, so a retried creation finds the image an earlier attempt of
/// this run produced and never one from another run.
pub fn snapshot_name(instance_id: &str, run_started_at: DateTime<Utc>, run_id: Uuid) -> String {
    format!(
        "{}-snapshot-{}-{:08x}",
        instance_id,
        run_started_at.format("%Y%m%d-%H%M%S"),
        run_id.as_fields().0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_name_is_stable_within_a_run() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 5).unwrap();
        let run_id = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();

        assert_eq!(
            snapshot_name("i-1", at, run_id),
            "i-1-snapshot-20261019-123005-1a2b3c4d"
        );
        assert_eq!(snapshot_name("i-1", at, run_id), snapshot_name("i-1", at, run_id));
    }

    #[test]
    fn test_snapshot_name_differs_between_runs_in_the_same_second() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 5).unwrap();
        let first = Uuid::parse_str("00000001-0000-4000-8000-000000000000").unwrap();
        let second = Uuid::parse_str("00000002-0000-4000-8000-000000000000").unwrap();

        assert_ne!(snapshot_name("i-1", at, first), snapshot_name("i-1", at, second));
    }

    #[test]
    fn test_validation() {
        let mut snapshot = Snapshot::new("ami-1", "i-1", "i-1-snapshot", Utc::now());
        assert!(snapshot.validate().is_ok());

        snapshot.instance_id = String::new();
        assert!(snapshot.validate().is_err());

        snapshot.instance_id = "i-1".to_string();
        snapshot.id = "  ".to_string();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let snapshot = Snapshot::new("ami-1", "i-1", "i-1-snapshot-20261019-120000", at);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["id"], "ami-1");
        assert_eq!(json["instance_id"], "i-1");
        assert_eq!(json["created_at"], "2026-10-19T12:00:00Z");
    }
}
