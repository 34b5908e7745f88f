//! Backup descriptor wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    Failed,
}

/// Sidecar describing one backup. Every field is required on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub instance_id: String,
    pub backup_name: String,
    /// Instance display name when the backup was taken.
    pub instance_name: String,
    pub created_at: DateTime<Utc>,
    /// Compressed database dump, bytes.
    pub database_size: u64,
    /// Compressed file store archive, bytes.
    pub data_size: u64,
    pub total_size: u64,
    pub workload_version: String,
    pub status: BackupStatus,
}

/// `<instance_id>_<YYYYmmddHHMMSS>`.
pub fn backup_id(instance_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", instance_id, at.format("%Y%m%d%H%M%S"))
}

/// Instance id encoded in a backup id: everything before the last `_`.
pub fn instance_prefix(backup_name: &str) -> Option<&str> {
    backup_name.rsplit_once('_').map(|(prefix, _)| prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_id_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap();
        let id = backup_id("abc_def", at);
        assert_eq!(id, "abc_def_20260309140507");
        assert_eq!(instance_prefix(&id), Some("abc_def"));
        assert_eq!(instance_prefix("nounderscore"), None);
    }

    #[test]
    fn test_missing_field_rejected() {
        let raw = r#"{"instance_id": "a", "backup_name": "a_1", "instance_name": "x",
            "created_at": "2026-01-01T00:00:00Z", "database_size": 1, "data_size": 2,
            "total_size": 3, "status": "completed"}"#;
        assert!(serde_json::from_str::<BackupDescriptor>(raw).is_err());
    }
}
