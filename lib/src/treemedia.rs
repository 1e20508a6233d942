//! # Tree media
//!
//! Turns an install location into a kernel and initrd on local disk plus
//! the kernel arguments the installer needs to find its way back to the
//! tree.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indicatif::ProgressBar;

use crate::config::InstallConfiguration;
use crate::detect::Detector;
use crate::distro::{DistroDescriptor, GuestShape};
use crate::fetch::{self, Fetcher, Location, LocationKind};
use crate::osdb::OsCatalog;
use crate::task::Task;
use crate::Error;

/// What the installer boots with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Local path of the fetched kernel.
    pub kernel: Utf8PathBuf,
    /// Local path of the fetched initrd.
    pub initrd: Utf8PathBuf,
    /// Kernel arguments to add for the install boot.
    pub extra_args: Vec<String>,
    /// Holds the files above; removed by [`TreeMedia::cleanup`].
    pub scratchdir: Utf8PathBuf,
}

#[derive(Debug)]
enum Detection {
    Pending,
    Done(DistroDescriptor),
    Failed(String),
}

/// Install media backed by a fetchable tree.
#[derive(Debug)]
pub struct TreeMedia {
    location: Location,
    location_kernel: Option<String>,
    location_initrd: Option<String>,
    /// Files appended to the initrd as an extra cpio archive.
    pub initrd_injections: Vec<Utf8PathBuf>,
    catalog: Arc<dyn OsCatalog>,
    config: InstallConfiguration,
    /// Exclusive to this instance; never shared between installs.
    scratch: Option<tempfile::TempDir>,
    fetcher: Option<Box<dyn Fetcher>>,
    detection: Detection,
}

impl TreeMedia {
    /// Set up media for `location`. An explicit kernel/initrd pair is either
    /// a path relative to the tree or a full URL.
    pub fn new(
        location: &str,
        location_kernel: Option<String>,
        location_initrd: Option<String>,
        catalog: Arc<dyn OsCatalog>,
        config: InstallConfiguration,
    ) -> Result<Self> {
        Ok(Self {
            location: Location::parse(location)?,
            location_kernel,
            location_initrd,
            initrd_injections: Vec::new(),
            catalog,
            config,
            scratch: None,
            fetcher: None,
            detection: Detection::Pending,
        })
    }

    /// The install location.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// An optical image location doubles as the install CDROM.
    pub fn cdrom_path(&self) -> Option<&str> {
        (self.location.kind() == LocationKind::OpticalImage).then(|| self.location.as_str())
    }

    /// The shared scratch root; the hypervisor needs search access to it.
    pub fn scratch_root(&self) -> Result<Utf8PathBuf> {
        self.config.make_scratchdir()
    }

    fn scratchdir(&mut self) -> Result<&Utf8Path> {
        let td = match self.scratch.take() {
            Some(td) => td,
            None => {
                let root = self.config.make_scratchdir()?;
                tempfile::Builder::new()
                    .prefix("vinstall.")
                    .tempdir_in(&root)
                    .with_context(|| format!("Creating scratch directory in {root}"))?
            }
        };
        let td = self.scratch.insert(td);
        Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow::anyhow!("Invalid non-UTF8 scratch directory"))
    }

    fn fetcher(&mut self) -> Result<&dyn Fetcher> {
        let f = match self.fetcher.take() {
            Some(f) => f,
            None => {
                let scratch = self.scratchdir()?.to_owned();
                fetch::open(&self.location, &scratch, ProgressBar::hidden())?
            }
        };
        Ok(&**self.fetcher.insert(f))
    }

    /// Detect the tree once; later calls see the same outcome.
    fn detect(&mut self, shape: &GuestShape) -> Result<DistroDescriptor> {
        match &self.detection {
            Detection::Done(d) => return Ok(d.clone()),
            Detection::Failed(msg) => return Err(Error::Detection(msg.clone()).into()),
            Detection::Pending => {}
        }
        let catalog = Arc::clone(&self.catalog);
        let retry = self.config.retry_policy();
        let fetcher = self.fetcher()?;
        let r = Detector::new(&*catalog).with_retry(retry).detect(fetcher, shape);
        match r {
            Ok(d) => {
                self.detection = Detection::Done(d.clone());
                Ok(d)
            }
            Err(e) => {
                self.detection = Detection::Failed(format!("{e:#}"));
                Err(e)
            }
        }
    }

    /// The OS variant of the tree, if it can be detected.
    pub fn detect_distro(&mut self, shape: &GuestShape) -> Option<String> {
        match self.detect(shape) {
            Ok(d) => d.os_variant,
            Err(e) => {
                tracing::debug!("Error attempting to detect distro: {e:#}");
                None
            }
        }
    }

    /// Fetch the kernel and initrd for a guest of `shape`.
    #[context("Preparing install media")]
    pub fn prepare(&mut self, shape: &GuestShape) -> Result<InstallPlan> {
        let explicit = self.location_kernel.clone().zip(self.location_initrd.clone());
        let (descriptor, (kernel, initrd)) = match explicit {
            Some(pair) => {
                // Detection only contributes the kernel argument here.
                let d = match self.detect(shape) {
                    Ok(d) => Some(d),
                    Err(e) => {
                        tracing::debug!("Ignoring detection failure for explicit kernel: {e:#}");
                        None
                    }
                };
                (d, pair)
            }
            None => {
                let d = self.detect(shape)?;
                let pair = (d.kernel.clone(), d.initrd.clone());
                (Some(d), pair)
            }
        };

        let kernel = self.fetch(&kernel)?;
        let initrd = self.fetch(&initrd)?;
        let scratchdir = self.scratchdir()?.to_owned();
        if !self.initrd_injections.is_empty() {
            inject_files(&initrd, &self.initrd_injections, &scratchdir)?;
        }

        let mut extra_args = Vec::new();
        if self.location.is_network() {
            if let Some(arg) = descriptor.and_then(|d| d.kernel_args) {
                extra_args.push(arg);
            }
        }
        extra_args.extend(self.config.kargs.iter().flatten().cloned());
        Ok(InstallPlan {
            kernel,
            initrd,
            extra_args,
            scratchdir,
        })
    }

    /// Fetch a tree-relative path, or a full URL.
    fn fetch(&mut self, path: &str) -> Result<Utf8PathBuf> {
        if let Some((dir, name)) = path.contains("://").then(|| path.rsplit_once('/')).flatten() {
            let scratch = self.scratchdir()?.to_owned();
            let f = fetch::open(&Location::parse(dir)?, &scratch, ProgressBar::hidden())?;
            let r = f.fetch_file(name);
            f.close()?;
            return r;
        }
        self.fetcher()?.fetch_file(path)
    }

    /// Release the transport and remove everything fetched. Safe to call
    /// more than once.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(f) = self.fetcher.take() {
            f.close()?;
        }
        if let Some(td) = self.scratch.take() {
            let path = td.path().to_owned();
            td.close()
                .with_context(|| format!("Removing {}", path.display()))?;
        }
        Ok(())
    }
}

/// Append `files` to `initrd` as a gzip compressed newc cpio archive; the
/// kernel unpacks concatenated archives in order, so these land on top of
/// the original contents.
#[context("Injecting files into {initrd}")]
fn inject_files(initrd: &Utf8Path, files: &[Utf8PathBuf], scratchdir: &Utf8Path) -> Result<()> {
    let td = tempfile::Builder::new()
        .prefix("vinstall-initrd.")
        .tempdir_in(scratchdir)?;
    for f in files {
        let name = f
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid injection path {f}"))?;
        tracing::debug!("Injecting {f} into {initrd}");
        std::fs::copy(f, td.path().join(name)).with_context(|| format!("Copying {f}"))?;
    }
    let out = OpenOptions::new()
        .append(true)
        .open(initrd)
        .with_context(|| format!("Opening {initrd}"))?;

    let mut children = Vec::new();
    let spawned = spawn_archive_pipeline(td.path(), out, &mut children);
    let waited = wait_all(children);
    spawned?;
    waited
}

/// Start `find | cpio | gzip > out` in `dir`, pushing each child as it starts.
fn spawn_archive_pipeline(
    dir: &Path,
    out: File,
    children: &mut Vec<(&'static str, Child)>,
) -> Result<()> {
    let mut find = Task::new("Listing injected files", "find")
        .quiet()
        .args([".", "-print0"]);
    find.cmd.current_dir(dir).stdout(Stdio::piped());
    let mut find = find.spawn()?;
    let find_out = find.stdout.take();
    children.push(("find", find));
    let find_out = find_out.ok_or_else(|| anyhow::anyhow!("find: no stdout"))?;

    let mut cpio = Task::new("Archiving injected files", "cpio")
        .quiet()
        .args(["-o", "--null", "-Hnewc", "--quiet"]);
    cpio.cmd
        .current_dir(dir)
        .stdin(find_out)
        .stdout(Stdio::piped());
    let mut cpio = cpio.spawn()?;
    let cpio_out = cpio.stdout.take();
    children.push(("cpio", cpio));
    let cpio_out = cpio_out.ok_or_else(|| anyhow::anyhow!("cpio: no stdout"))?;

    let mut gzip = Task::new("Compressing injected files", "gzip").quiet();
    gzip.cmd.stdin(cpio_out).stdout(out);
    children.push(("gzip", gzip.spawn()?));
    Ok(())
}

/// Reap every child, then report the first failure.
fn wait_all(children: Vec<(&str, Child)>) -> Result<()> {
    let mut first_err = None;
    for (name, mut child) in children {
        let r = match child.wait() {
            Ok(st) if st.success() => continue,
            Ok(st) => anyhow::anyhow!("{name} failed: {st:?}"),
            Err(e) => anyhow::Error::new(e).context(format!("Waiting for {name}")),
        };
        first_err.get_or_insert(r);
    }
    first_err.map_or(Ok(()), Err)
}
