//! Install trees in a local directory.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use indicatif::ProgressBar;

use super::{Fetcher, FetcherBase, Location};
use crate::Error;

/// Reads files relative to a directory handle; relative paths cannot
/// escape the tree.
#[derive(Debug)]
pub(crate) struct LocalFetcher {
    base: FetcherBase,
    root: Dir,
}

impl LocalFetcher {
    pub(crate) fn new(base: FetcherBase) -> Result<Self> {
        let root = open_root(Utf8Path::new(base.location.as_str()))?;
        Ok(Self { base, root })
    }

    /// Open a fetcher over `path`, which is reached through a different
    /// location (e.g. a mount of a network export).
    pub(crate) fn new_at(base: FetcherBase, path: &Utf8Path) -> Result<Self> {
        let root = open_root(path)?;
        Ok(Self { base, root })
    }
}

#[context("Opening {path}")]
fn open_root(path: &Utf8Path) -> Result<Dir> {
    Dir::open_ambient_dir(path, cap_std::ambient_authority()).map_err(Into::into)
}

fn normalize(relpath: &str) -> &str {
    let relpath = relpath.trim_start_matches('/');
    if relpath.is_empty() {
        "."
    } else {
        relpath
    }
}

impl Fetcher for LocalFetcher {
    fn location(&self) -> &Location {
        &self.base.location
    }

    fn scratchdir(&self) -> &Utf8Path {
        &self.base.scratchdir
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        let r = match self.root.try_exists(normalize(relpath)) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Checking {relpath}: {e}");
                false
            }
        };
        tracing::debug!("hasFile({}) returning {r}", self.base.location.join(relpath));
        Ok(r)
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        let url = self.base.location.join(relpath);
        let mut f = self
            .root
            .open_optional(normalize(relpath))
            .with_context(|| format!("Opening {url}"))?
            .ok_or_else(|| Error::Fetch {
                url: url.clone(),
                reason: "No such file or directory".into(),
            })?;
        std::io::copy(&mut f, w).with_context(|| format!("Reading {url}"))
    }

    fn can_access(&self) -> bool {
        true
    }

    fn progress(&self) -> &ProgressBar {
        &self.base.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir_all(dir.join("images/pxeboot"))?;
        std::fs::write(dir.join("images/pxeboot/vmlinuz"), b"kernel")?;
        let scratch = tempfile::tempdir()?;
        let base = FetcherBase {
            location: Location::parse(dir.as_str())?,
            scratchdir: Utf8Path::from_path(scratch.path()).unwrap().to_owned(),
            progress: ProgressBar::hidden(),
        };
        let f = LocalFetcher::new(base)?;
        assert!(f.has_file("images/pxeboot/vmlinuz")?);
        assert!(f.has_file("/images/pxeboot")?);
        assert!(!f.has_file("images/pxeboot/initrd.img")?);
        // Paths never escape the tree
        assert!(!f.has_file("../../../etc/passwd")?);
        assert_eq!(f.fetch_content("images/pxeboot/vmlinuz")?.as_deref(), Some("kernel"));
        assert_eq!(f.fetch_content(".treeinfo")?, None);
        let fetched = f.fetch_file("images/pxeboot/vmlinuz")?;
        assert!(fetched.starts_with(scratch.path()));
        assert!(fetched.file_name().unwrap().starts_with("vinstall-vmlinuz."));
        assert_eq!(std::fs::read(&fetched)?, b"kernel");
        let e = f.fetch_file("missing").unwrap_err();
        assert!(matches!(Error::find(&e), Some(Error::Fetch { .. })));
        Ok(())
    }
}
