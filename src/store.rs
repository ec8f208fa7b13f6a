//! Durable storage for finished calibration tables.
//!
//! Tables are stored as pretty-printed JSON, one file per device identity,
//! under a directory per device kind (defaults to `~/.armcal/follower` and
//! `~/.armcal/leader`). A real bus adapter writes here from
//! `persist_calibration`; the web layer lists and deletes entries through
//! the same store.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::bus::MotorCalibration;
use crate::session::DeviceKind;

/// Metadata for one stored calibration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCalibration {
    /// Device identity (file stem).
    pub name: String,
    pub filename: String,
    /// File size in bytes.
    pub size: u64,
    /// Modification time as seconds since the Unix epoch.
    pub modified: u64,
}

/// Calibration file store rooted at a configurable directory.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    root: PathBuf,
}

impl CalibrationStore {
    /// Store under the default root, `~/.armcal`.
    pub fn new() -> io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root: PathBuf::from(home).join(".armcal"),
        })
    }

    /// Store under a custom root.
    pub fn with_path(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory for all stored calibrations.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: DeviceKind) -> PathBuf {
        self.root.join(kind.to_string())
    }

    fn table_path(&self, kind: DeviceKind, id: &str) -> io::Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid calibration id: {id:?}"),
            ));
        }
        Ok(self.kind_dir(kind).join(format!("{id}.json")))
    }

    /// Save a calibration table for a device. Creates the directory on
    /// demand and returns the path written.
    pub fn save(
        &self,
        kind: DeviceKind,
        id: &str,
        table: &HashMap<String, MotorCalibration>,
    ) -> io::Result<PathBuf> {
        let path = self.table_path(kind, id)?;
        std::fs::create_dir_all(self.kind_dir(kind))?;
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a stored table.
    ///
    /// Returns `None` if no table exists for this device, `Some(Err)` if it
    /// exists but cannot be read or parsed.
    pub fn load(
        &self,
        kind: DeviceKind,
        id: &str,
    ) -> Option<io::Result<HashMap<String, MotorCalibration>>> {
        let path = self.table_path(kind, id).ok()?;
        if !path.exists() {
            return None;
        }
        Some(std::fs::read_to_string(&path).and_then(|json| {
            serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }))
    }

    /// List stored calibrations for a device kind, sorted by name.
    pub fn list(&self, kind: DeviceKind) -> io::Result<Vec<StoredCalibration>> {
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let metadata = entry.metadata()?;
            let modified = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            entries.push(StoredCalibration {
                name: name.to_string(),
                filename: filename.to_string(),
                size: metadata.len(),
                modified,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Delete a stored calibration. Errors with `NotFound` when no table
    /// exists for this device.
    pub fn delete(&self, kind: DeviceKind, id: &str) -> io::Result<()> {
        let path = self.table_path(kind, id)?;
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no stored calibration for {id:?}"),
            ));
        }
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_table() -> HashMap<String, MotorCalibration> {
        let mut table = HashMap::new();
        table.insert(
            "shoulder".to_string(),
            MotorCalibration {
                id: 1,
                drive_mode: 0,
                homing_offset: 100,
                range_min: 1024,
                range_max: 3072,
            },
        );
        table
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());

        let table = sample_table();
        let path = store.save(DeviceKind::Follower, "left_arm", &table).unwrap();
        assert!(path.ends_with("follower/left_arm.json"));

        let loaded = store.load(DeviceKind::Follower, "left_arm").unwrap().unwrap();
        assert_eq!(loaded, table);

        // Different kind, same id: separate namespace.
        assert!(store.load(DeviceKind::Leader, "left_arm").is_none());
    }

    #[test]
    fn list_reports_saved_entries() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());
        assert!(store.list(DeviceKind::Leader).unwrap().is_empty());

        store.save(DeviceKind::Leader, "handle_b", &sample_table()).unwrap();
        store.save(DeviceKind::Leader, "handle_a", &sample_table()).unwrap();

        let entries = store.list(DeviceKind::Leader).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "handle_a");
        assert_eq!(entries[1].name, "handle_b");
        assert_eq!(entries[0].filename, "handle_a.json");
        assert!(entries[0].size > 0);
    }

    #[test]
    fn delete_missing_entry_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());

        let err = store.delete(DeviceKind::Follower, "ghost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        store.save(DeviceKind::Follower, "real", &sample_table()).unwrap();
        store.delete(DeviceKind::Follower, "real").unwrap();
        assert!(store.load(DeviceKind::Follower, "real").is_none());
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());

        let err = store
            .save(DeviceKind::Follower, "../escape", &sample_table())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(store.load(DeviceKind::Follower, "../escape").is_none());
    }
}
