//! Creating and removing the backing storage of guest disks.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::guest::{DeviceDisk, DiskKind};

/// Allocates and deletes disk backing storage.
pub trait StorageBackend: std::fmt::Debug {
    /// True if `disk` still needs its backing storage created.
    fn needs_creation(&self, disk: &DeviceDisk) -> Result<bool> {
        let (Some(path), Some(_)) = (disk.path.as_ref(), disk.size_bytes) else {
            return Ok(false);
        };
        if disk.device != DiskKind::Disk || disk.storage_was_created {
            return Ok(false);
        }
        Ok(!path.try_exists()?)
    }

    /// Create the backing storage for `disk`.
    fn create(&self, disk: &DeviceDisk) -> Result<()>;

    /// Remove the backing storage for `disk`.
    fn delete(&self, disk: &DeviceDisk) -> Result<()>;
}

/// Sparse files on the local filesystem.
#[derive(Debug, Default)]
pub struct LocalFileStorage;

impl StorageBackend for LocalFileStorage {
    #[context("Creating disk storage")]
    fn create(&self, disk: &DeviceDisk) -> Result<()> {
        let path = disk
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Disk has no path"))?;
        let size = disk.size_bytes.unwrap_or_default();
        tracing::debug!("Creating {path} ({size} bytes)");
        let f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Opening {path}"))?;
        if let Err(e) = f.set_len(size) {
            drop(f);
            if let Err(rm) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove partially created {path}: {rm}");
            }
            return Err(e).with_context(|| format!("Allocating {path}"));
        }
        Ok(())
    }

    #[context("Removing disk storage")]
    fn delete(&self, disk: &DeviceDisk) -> Result<()> {
        let path = disk
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Disk has no path"))?;
        std::fs::remove_file(path).with_context(|| format!("Removing {path}"))
    }
}
