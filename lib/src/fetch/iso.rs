//! Reading files straight out of an ISO image with `isoinfo`, which needs
//! no privileges (unlike a loopback mount).

use std::cell::OnceCell;
use std::io::Write;

use anyhow::Result;
use camino::Utf8Path;
use indicatif::ProgressBar;

use super::{Fetcher, FetcherBase, Location};
use crate::task::Task;
use crate::Error;

#[derive(Debug)]
pub(crate) struct IsoFetcher {
    base: FetcherBase,
    /// Every path in the image, as listed by `isoinfo -f`.
    files: OnceCell<Vec<String>>,
}

fn iso_path(relpath: &str) -> String {
    format!("/{}", relpath.trim_start_matches('/'))
}

/// Parse `isoinfo -f` output, one absolute path per line.
fn parse_file_list(buf: &str) -> Vec<String> {
    buf.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

impl IsoFetcher {
    pub(crate) fn new(base: FetcherBase) -> Self {
        Self {
            base,
            files: OnceCell::new(),
        }
    }

    fn files(&self) -> Result<&[String]> {
        if let Some(files) = self.files.get() {
            return Ok(files);
        }
        let buf = Task::new("Listing ISO contents", "isoinfo")
            .quiet()
            .args(["-J", "-i", self.base.location.as_str(), "-f"])
            .read()?;
        Ok(self.files.get_or_init(|| parse_file_list(&buf)))
    }
}

impl Fetcher for IsoFetcher {
    fn location(&self) -> &Location {
        &self.base.location
    }

    fn scratchdir(&self) -> &Utf8Path {
        &self.base.scratchdir
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        let path = iso_path(relpath);
        let r = self.files()?.iter().any(|f| *f == path);
        tracing::debug!("hasFile({path}) returning {r}");
        Ok(r)
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        let path = iso_path(relpath);
        if !self.has_file(relpath)? {
            return Err(Error::Fetch {
                url: format!("{}:{path}", self.base.location),
                reason: "isoinfo didn't find the file".into(),
            }
            .into());
        }
        Task::new(format!("Extracting {path}"), "isoinfo")
            .quiet()
            .args(["-J", "-i", self.base.location.as_str(), "-x", path.as_str()])
            .copy_stdout_to(w)
    }

    fn can_access(&self) -> bool {
        self.files().is_ok()
    }

    fn progress(&self) -> &ProgressBar {
        &self.base.progress
    }

    fn is_optical_image(&self) -> bool {
        true
    }
}

#[test]
fn test_parse_file_list() {
    let listing = "/.disk\n/.disk/info\n/install.amd/vmlinuz\n\n/install.amd/initrd.gz\n";
    let files = parse_file_list(listing);
    assert_eq!(files.len(), 4);
    assert!(files.iter().any(|f| f == &iso_path("install.amd/vmlinuz")));
    assert!(files.iter().any(|f| f == &iso_path("/.disk/info")));
}
