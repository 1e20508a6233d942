//! Helpers for interacting with mountpoints

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::task::Task;

/// Mount an NFS export read-only at the target path.
#[context("Mounting {export} at {target}")]
pub(crate) fn mount_nfs_ro(export: &str, target: &Utf8Path) -> Result<()> {
    tracing::debug!("Mounting {export} to {target}");
    Task::new_and_run(
        format!("Mounting {export}"),
        "mount",
        ["-t", "nfs", "-o", "ro,nolock", export, target.as_str()],
    )
}

/// Detach the mount at the target path. This is a lazy unmount, so
/// descriptors still open below it do not keep it busy.
#[context("Unmounting {target}")]
pub(crate) fn unmount(target: &Utf8Path) -> Result<()> {
    Task::new(format!("Unmounting {target}"), "umount")
        .quiet()
        .args(["--lazy", target.as_str()])
        .run()
}
