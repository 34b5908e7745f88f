//! Hostplane Backup: backup/restore jobs and the descriptor catalog.
//!
//! Each completed backup leaves one JSON sidecar descriptor in the shared
//! backup directory. The directory is the catalog; listing rebuilds it by
//! scanning.

pub mod catalog;
pub mod controller;
pub mod descriptor;

pub use catalog::BackupCatalog;
pub use controller::{BackupController, BackupListing};
pub use descriptor::{backup_id, BackupDescriptor, BackupStatus};
