//! FTP install trees, driven through `curl`.

use std::io::Write;

use anyhow::Result;
use camino::Utf8Path;
use indicatif::ProgressBar;

use super::{Fetcher, FetcherBase, Location};
use crate::task::Task;
use crate::Error;

#[derive(Debug)]
pub(crate) struct FtpFetcher {
    base: FetcherBase,
}

impl FtpFetcher {
    pub(crate) fn new(base: FetcherBase) -> Self {
        Self { base }
    }

    fn probe(&self, url: &str) -> Result<bool> {
        // For a plain file curl issues SIZE/MDTM; a trailing slash lists the directory.
        let r = Task::new(format!("Probing {url}"), "curl")
            .quiet()
            .args(["--silent", "--fail", "--head", url])
            .succeeds()?;
        tracing::debug!("hasFile({url}) returning {r}");
        Ok(r)
    }
}

impl Fetcher for FtpFetcher {
    fn location(&self) -> &Location {
        &self.base.location
    }

    fn scratchdir(&self) -> &Utf8Path {
        &self.base.scratchdir
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        self.probe(&self.base.location.join(relpath))
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        let url = self.base.location.join(relpath);
        tracing::debug!("Fetching URI: {url}");
        let n = Task::new(format!("Fetching {url}"), "curl")
            .quiet()
            .args(["--silent", "--show-error", "--fail", url.as_str()])
            .copy_stdout_to(w)
            .map_err(|e| Error::Fetch {
                url: url.clone(),
                reason: format!("{e:#}"),
            })?;
        Ok(n)
    }

    fn can_access(&self) -> bool {
        let root = format!("{}/", self.base.location.as_str().trim_end_matches('/'));
        matches!(self.probe(&root), Ok(true))
    }

    fn progress(&self) -> &ProgressBar {
        &self.base.progress
    }
}
