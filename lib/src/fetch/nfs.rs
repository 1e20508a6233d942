//! NFS install trees: the export is mounted read-only into the scratch
//! directory for the lifetime of the fetcher.

use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;

use super::local::LocalFetcher;
use super::{Fetcher, FetcherBase, Location};
use crate::Error;

#[derive(Debug)]
pub(crate) struct NfsFetcher {
    inner: LocalFetcher,
    /// Present until the export is unmounted.
    mountpoint: Option<Utf8PathBuf>,
    /// Removed after unmounting.
    _tempdir: tempfile::TempDir,
}

/// Convert `nfs:host:/path` or `nfs://host/path` into the `host:/path`
/// form that mount(8) accepts.
fn export_spec(location: &str) -> Option<String> {
    if let Some(rest) = location.strip_prefix("nfs://") {
        let (host, path) = rest.split_once('/')?;
        if host.is_empty() {
            return None;
        }
        return Some(format!("{host}:/{path}"));
    }
    let rest = location.strip_prefix("nfs:")?;
    let (host, path) = rest.split_once(':')?;
    if host.is_empty() || !path.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

impl NfsFetcher {
    pub(crate) fn new(base: FetcherBase) -> Result<Self> {
        let export = export_spec(base.location.as_str())
            .ok_or_else(|| Error::UnsupportedLocation(base.location.to_string()))?;
        let tempdir = tempfile::Builder::new()
            .prefix("vinstall-nfs.")
            .tempdir_in(&base.scratchdir)
            .with_context(|| format!("Creating mountpoint in {}", base.scratchdir))?;
        let mountpoint = Utf8Path::from_path(tempdir.path())
            .ok_or_else(|| anyhow::anyhow!("Invalid non-UTF8 scratch directory"))?
            .to_owned();
        crate::mount::mount_nfs_ro(&export, &mountpoint)?;
        let inner = match LocalFetcher::new_at(base, &mountpoint) {
            Ok(inner) => inner,
            Err(e) => {
                if let Err(e) = crate::mount::unmount(&mountpoint) {
                    tracing::warn!("{e:#}");
                }
                return Err(e);
            }
        };
        Ok(Self {
            inner,
            mountpoint: Some(mountpoint),
            _tempdir: tempdir,
        })
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mountpoint) = self.mountpoint.take() {
            crate::mount::unmount(&mountpoint)?;
        }
        Ok(())
    }
}

impl Drop for NfsFetcher {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release NFS mount: {e:#}");
        }
    }
}

impl Fetcher for NfsFetcher {
    fn location(&self) -> &Location {
        self.inner.location()
    }

    fn scratchdir(&self) -> &Utf8Path {
        self.inner.scratchdir()
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        self.inner.has_file(relpath)
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        self.inner.copy_to(relpath, w)
    }

    fn can_access(&self) -> bool {
        true
    }

    fn progress(&self) -> &ProgressBar {
        self.inner.progress()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

#[test]
fn test_export_spec() {
    assert_eq!(
        export_spec("nfs:server.example.com:/export/tree").as_deref(),
        Some("server.example.com:/export/tree")
    );
    assert_eq!(
        export_spec("nfs://server.example.com/export/tree").as_deref(),
        Some("server.example.com:/export/tree")
    );
    assert_eq!(export_spec("nfs:/export/tree"), None);
    assert_eq!(export_spec("nfs://"), None);
    assert_eq!(export_spec("nfs:server:relative"), None);
}
