//! File-based backup catalog.
//!
//! One `<backup id>.json` per backup in a shared directory. Writers to
//! distinct names never interfere; the same name is last-write-wins.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use hostplane_core::{Error, Result};

use crate::descriptor::{instance_prefix, BackupDescriptor};

const DESCRIPTOR_EXT: &str = "json";

pub struct BackupCatalog {
    dir: PathBuf,
}

impl BackupCatalog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self, backup_name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", backup_name, DESCRIPTOR_EXT))
    }

    /// Directory holding the dump artifacts of a backup.
    pub fn artifact_dir(&self, backup_name: &str) -> PathBuf {
        self.dir.join(backup_name)
    }

    /// Write a descriptor via a temporary file and rename.
    pub fn write(&self, descriptor: &BackupDescriptor) -> Result<PathBuf> {
        if instance_prefix(&descriptor.backup_name) != Some(descriptor.instance_id.as_str()) {
            return Err(Error::Validation(format!(
                "backup name {} does not belong to instance {}",
                descriptor.backup_name, descriptor.instance_id
            )));
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.descriptor_path(&descriptor.backup_name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", descriptor.backup_name, DESCRIPTOR_EXT));
        std::fs::write(&tmp, serde_json::to_vec_pretty(descriptor)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(backup = %descriptor.backup_name, path = %path.display(), "Descriptor written");
        Ok(path)
    }

    /// Read one descriptor. Absent, unreadable and inconsistent files are all `None`.
    pub fn read(&self, backup_name: &str) -> Option<BackupDescriptor> {
        let path = self.descriptor_path(backup_name);
        if !path.is_file() {
            return None;
        }
        Self::load(&path, backup_name)
    }

    fn load(path: &Path, stem: &str) -> Option<BackupDescriptor> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable backup descriptor");
                return None;
            }
        };
        let descriptor: BackupDescriptor = match serde_json::from_slice(&raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed backup descriptor");
                return None;
            }
        };
        if descriptor.backup_name != stem
            || instance_prefix(stem) != Some(descriptor.instance_id.as_str())
        {
            warn!(
                path = %path.display(),
                instance_id = %descriptor.instance_id,
                "Skipping backup descriptor whose name and instance disagree"
            );
            return None;
        }
        Some(descriptor)
    }

    /// Rebuild the catalog from the directory, newest first.
    pub fn scan(&self) -> Result<Vec<BackupDescriptor>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXT) || !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            if let Some(descriptor) = Self::load(&path, stem) {
                found.push(descriptor);
            }
        }

        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_name.cmp(&a.backup_name))
        });
        Ok(found)
    }

    /// Backups of one instance, newest first.
    pub fn list_for(&self, instance_id: &str) -> Result<Vec<BackupDescriptor>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|d| d.instance_id == instance_id)
            .collect())
    }
}
