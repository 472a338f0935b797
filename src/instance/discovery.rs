//! Discovery directory input
//!
//! The external discovery component owns the file watcher; the hub only
//! performs an initial scan of the instances directory at startup and
//! accepts pushed add/remove deltas afterwards, so instances registered
//! before discovery started are not missed.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::HubResult;
use crate::instance::Instance;

/// One instance record as written by the discovery component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub directory: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
}

/// Add/remove delta pushed by the external watcher
#[derive(Debug, Clone)]
pub enum DiscoveryDelta {
    Added(Instance),
    Removed(String),
}

/// Scan a discovery directory for instance records.
///
/// Each `*.json` file holds one [`InstanceRecord`]. Unreadable or invalid
/// files are logged and skipped; the scan itself only fails when the
/// directory cannot be read.
pub fn scan_instances_dir(dir: &Path) -> HubResult<Vec<Instance>> {
    let mut instances = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable instance record");
                continue;
            }
        };
        let record: InstanceRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping invalid instance record");
                continue;
            }
        };

        match instance_from_record(record) {
            Ok(instance) => {
                debug!(id = %instance.id, port = instance.port, "discovered instance");
                instances.push(instance);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping rejected instance record");
            }
        }
    }

    Ok(instances)
}

fn instance_from_record(record: InstanceRecord) -> HubResult<Instance> {
    let mut instance = Instance::new(record.id, record.name, record.directory, record.port)?;
    if let Some(pid) = record.pid {
        instance = instance.with_pid(pid);
    }
    if let Some(started_at) = record.started_at {
        instance.discovered_at = started_at;
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_record(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_scan_reads_valid_records() {
        let dir = tempfile::tempdir().unwrap();
        write_record(
            dir.path(),
            "dev.json",
            r#"{"id":"dev-server","name":"Dev","directory":"/work/app","port":3100,"pid":42}"#,
        );
        write_record(
            dir.path(),
            "build.json",
            r#"{"id":"build-1","name":"Build","directory":"/work/build","port":3101}"#,
        );

        let mut instances = scan_instances_dir(dir.path()).unwrap();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "build-1");
        assert_eq!(instances[1].pid, Some(42));
    }

    #[test]
    fn test_scan_skips_invalid_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "broken.json", "not json at all");
        write_record(dir.path(), "bad-id.json", r#"{"id":"has space","name":"x","directory":"/","port":1}"#);
        write_record(dir.path(), "notes.txt", "ignored");
        write_record(
            dir.path(),
            "ok.json",
            r#"{"id":"ok","name":"Ok","directory":"/","port":3102}"#,
        );

        let instances = scan_instances_dir(dir.path()).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "ok");
    }

    #[test]
    fn test_scan_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_instances_dir(&missing).is_err());
    }

    #[test]
    fn test_started_at_becomes_discovery_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_record(
            dir.path(),
            "dev.json",
            r#"{"id":"dev","name":"Dev","directory":"/","port":3100,"started_at":"2026-01-02T03:04:05Z"}"#,
        );

        let instances = scan_instances_dir(dir.path()).unwrap();
        assert_eq!(
            instances[0].discovered_at.to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
    }
}
