//! # Install media transports
//!
//! A [`Fetcher`] is bound to one [`Location`] and answers two questions
//! about the install tree behind it: does a relative path exist, and what
//! are its bytes. Everything above this module (distro detection, media
//! preparation) is transport agnostic.

use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indicatif::ProgressBar;

use crate::Error;

mod ftp;
mod http;
mod iso;
mod local;
mod nfs;

/// The transport a location resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationKind {
    /// A directory on the local filesystem.
    LocalDirectory,
    /// An ISO image file or optical block device.
    OpticalImage,
    /// `http://` or `https://`.
    Http,
    /// `ftp://`.
    Ftp,
    /// An NFS export, `nfs:host:/path` or `nfs://host/path`.
    Nfs,
}

/// An install media location: an opaque URI or path, classified once at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    raw: String,
    kind: LocationKind,
}

impl Location {
    /// Classify `s`. Local paths must exist; anything unrecognized is
    /// [`Error::UnsupportedLocation`].
    pub fn parse(s: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedLocation(s.to_string());
        let kind = if s.starts_with("http://") || s.starts_with("https://") {
            url::Url::parse(s).map_err(|_| unsupported())?;
            LocationKind::Http
        } else if s.starts_with("ftp://") {
            url::Url::parse(s).map_err(|_| unsupported())?;
            LocationKind::Ftp
        } else if s.starts_with("nfs:") {
            LocationKind::Nfs
        } else {
            let p = Utf8Path::new(s);
            match p.metadata() {
                Ok(m) if m.is_dir() => LocationKind::LocalDirectory,
                Ok(_) => LocationKind::OpticalImage,
                Err(e) => {
                    tracing::debug!("Failed to stat {p}: {e}");
                    return Err(unsupported().into());
                }
            }
        };
        Ok(Self {
            raw: s.to_string(),
            kind,
        })
    }

    /// The location exactly as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The classified transport.
    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    /// True for transports reached over the network.
    pub fn is_network(&self) -> bool {
        matches!(
            self.kind,
            LocationKind::Http | LocationKind::Ftp | LocationKind::Nfs
        )
    }

    /// Join a tree-relative path onto this location, without doubling slashes.
    /// An empty `relpath` yields the location itself.
    pub(crate) fn join(&self, relpath: &str) -> String {
        let relpath = relpath.trim_start_matches('/');
        if relpath.is_empty() {
            return self.raw.clone();
        }
        format!("{}/{relpath}", self.raw.trim_end_matches('/'))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Access to the files of one install tree.
///
/// Existence probes are assumed to be cheap; fetches are not. Any resource
/// the fetcher acquired (mounts, sessions) is released when it is dropped,
/// or earlier and with error reporting by [`Fetcher::close`].
pub trait Fetcher: std::fmt::Debug {
    /// The location this fetcher is bound to.
    fn location(&self) -> &Location;

    /// The directory downloaded files are written to.
    fn scratchdir(&self) -> &Utf8Path;

    /// Test whether `relpath` exists in the tree.
    ///
    /// Transport failures are reported as `false`, except for proxy gateway
    /// errors which propagate as [`Error::ProxyGateway`].
    fn has_file(&self, relpath: &str) -> Result<bool>;

    /// Stream the content of `relpath` into `w`, returning the byte count.
    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64>;

    /// Whether the location itself can be reached at all.
    fn can_access(&self) -> bool;

    /// The progress reporter used for downloads.
    fn progress(&self) -> &ProgressBar;

    /// True if this fetcher reads directly out of an optical image.
    fn is_optical_image(&self) -> bool {
        false
    }

    /// Release transport resources, reporting any failure to do so.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    /// Download `relpath` into a new file in the scratch directory and return its path.
    /// The caller owns the file.
    fn fetch_file(&self, relpath: &str) -> Result<Utf8PathBuf> {
        let basename = relpath.rsplit('/').next().unwrap_or(relpath);
        let prefix = format!("vinstall-{basename}.");
        let mut tmpf = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(self.scratchdir())
            .with_context(|| format!("Creating temporary file in {}", self.scratchdir()))?;
        let pb = self.progress();
        pb.set_message(format!("Retrieving file {basename}..."));
        pb.set_position(0);
        let n = {
            let mut w = pb.wrap_write(tmpf.as_file_mut());
            self.copy_to(relpath, &mut w)?
        };
        pb.finish_with_message(format!("Retrieved {basename}"));
        tmpf.as_file_mut().flush()?;
        let (_, path) = tmpf.keep().context("Persisting temporary file")?;
        let path = Utf8PathBuf::try_from(path)?;
        tracing::debug!("Saved {} ({n} bytes) to {path}", self.location().join(relpath));
        Ok(path)
    }

    /// Read a small metadata file as text. Absence or an ordinary fetch
    /// failure is `None`; proxy gateway errors propagate so that the caller's
    /// retry policy sees them.
    fn fetch_content(&self, relpath: &str) -> Result<Option<String>> {
        let mut buf = Vec::new();
        match self.copy_to(relpath, &mut buf) {
            Ok(_) => Ok(Some(String::from_utf8_lossy(&buf).into_owned())),
            Err(e) if Error::is_proxy_gateway(&e) => Err(e),
            Err(e) => {
                tracing::debug!("Failed to acquire file={relpath}: {e:#}");
                Ok(None)
            }
        }
    }
}

/// Open a fetcher for `location`, writing downloads into `scratchdir`.
///
/// For NFS this mounts the export (in a subdirectory of `scratchdir`).
#[context("Opening install location {location}")]
pub fn open(
    location: &Location,
    scratchdir: &Utf8Path,
    progress: ProgressBar,
) -> Result<Box<dyn Fetcher>> {
    tracing::debug!("Using scratchdir={scratchdir}");
    let base = FetcherBase {
        location: location.clone(),
        scratchdir: scratchdir.to_owned(),
        progress,
    };
    let r: Box<dyn Fetcher> = match location.kind() {
        LocationKind::LocalDirectory => Box::new(local::LocalFetcher::new(base)?),
        LocationKind::OpticalImage => Box::new(iso::IsoFetcher::new(base)),
        LocationKind::Http => Box::new(http::HttpFetcher::new(base)?),
        LocationKind::Ftp => Box::new(ftp::FtpFetcher::new(base)),
        LocationKind::Nfs => Box::new(nfs::NfsFetcher::new(base)?),
    };
    Ok(r)
}

/// State shared by every transport.
#[derive(Debug)]
pub(crate) struct FetcherBase {
    pub(crate) location: Location,
    pub(crate) scratchdir: Utf8PathBuf,
    pub(crate) progress: ProgressBar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let iso = dir.join("boot.iso");
        std::fs::write(&iso, b"")?;
        for (s, kind) in [
            ("http://example.com/tree/", LocationKind::Http),
            ("https://example.com/tree", LocationKind::Http),
            ("ftp://example.com/pub", LocationKind::Ftp),
            ("nfs:example.com:/export/tree", LocationKind::Nfs),
            (dir.as_str(), LocationKind::LocalDirectory),
            (iso.as_str(), LocationKind::OpticalImage),
        ] {
            assert_eq!(Location::parse(s)?.kind(), kind, "{s}");
        }
        let missing = dir.join("nonexistent");
        for s in [missing.as_str(), "http://", "gopher://example.com/"] {
            let e = Location::parse(s).unwrap_err();
            assert!(
                matches!(Error::find(&e), Some(Error::UnsupportedLocation(_))),
                "{s}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_join() -> Result<()> {
        let l = Location::parse("http://example.com/tree/")?;
        assert_eq!(l.join(".treeinfo"), "http://example.com/tree/.treeinfo");
        assert_eq!(l.join("/images/pxeboot/vmlinuz"), "http://example.com/tree/images/pxeboot/vmlinuz");
        assert_eq!(l.join(""), "http://example.com/tree/");
        let l = Location::parse("http://example.com/tree")?;
        assert_eq!(l.join("content"), "http://example.com/tree/content");
        assert!(l.is_network());
        Ok(())
    }
}
