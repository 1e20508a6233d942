//! # vinstall command line
//!
//! Debugging entry points over install tree detection. Guest creation is
//! driven through the library API by a higher level tool.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::Parser;
use fn_error_context::context;
use indicatif::ProgressBar;

use crate::config::load_config;
use crate::detect::Detector;
use crate::distro::{DistroDescriptor, GuestShape, VirtMode};
use crate::fetch::{self, Location};
use crate::osdb::BuiltinOsCatalog;

/// Options shared by the detection commands.
#[derive(Debug, Parser)]
pub(crate) struct DetectOpts {
    /// Install tree: http(s)://, ftp://, nfs:host:/path, a local directory or an ISO.
    location: String,

    /// Guest architecture; defaults to the host architecture.
    #[clap(long)]
    arch: Option<String>,

    /// Detect for a paravirtualized (Xen) guest.
    #[clap(long)]
    paravirt: bool,

    /// Only check the family of this OS variant, e.g. `fedora29`.
    #[clap(long)]
    os_variant: Option<String>,
}

impl DetectOpts {
    fn shape(&self) -> GuestShape {
        GuestShape {
            arch: self
                .arch
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            virt: if self.paravirt {
                VirtMode::Paravirt
            } else {
                VirtMode::Hvm
            },
            os_variant: self.os_variant.clone(),
        }
    }
}

/// Inspect install trees.
#[derive(Debug, Parser)]
#[clap(name = "vinstall")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Detect the distribution of an install tree and print it as JSON.
    Detect(DetectOpts),
    /// Print the full kernel and initrd locations of an install tree, and
    /// the kernel arguments the installer needs.
    KernelPaths(DetectOpts),
}

#[context("Detecting distribution")]
fn detect(opts: &DetectOpts) -> Result<(Location, DistroDescriptor)> {
    let config = load_config()?;
    let location = Location::parse(&opts.location)?;
    let root = config.make_scratchdir()?;
    let td = tempfile::Builder::new()
        .prefix("vinstall.")
        .tempdir_in(&root)
        .with_context(|| format!("Creating scratch directory in {root}"))?;
    let scratch = Utf8Path::from_path(td.path()).context("Invalid non-UTF8 scratch directory")?;
    let fetcher = fetch::open(&location, scratch, ProgressBar::hidden())?;
    let catalog = BuiltinOsCatalog::new();
    let r = Detector::new(&catalog)
        .with_retry(config.retry_policy())
        .detect(&*fetcher, &opts.shape());
    // Release mounts before the scratch directory goes away
    fetcher.close()?;
    Ok((location, r?))
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match opt {
        Opt::Detect(opts) => {
            let (_, d) = detect(&opts)?;
            serde_json::to_writer_pretty(&mut out, &d)?;
            writeln!(out)?;
        }
        Opt::KernelPaths(opts) => {
            let (location, d) = detect(&opts)?;
            writeln!(out, "kernel: {}", location.join(&d.kernel))?;
            writeln!(out, "initrd: {}", location.join(&d.initrd))?;
            if let Some(args) = d.kernel_args.as_deref() {
                writeln!(out, "kernel-args: {args}")?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

#[test]
fn test_parse_opts() {
    let opt = Opt::parse_from([
        "vinstall",
        "detect",
        "--arch",
        "aarch64",
        "--os-variant",
        "fedora29",
        "http://example.com/tree",
    ]);
    let Opt::Detect(opts) = opt else {
        panic!("Expected detect");
    };
    let shape = opts.shape();
    assert_eq!(shape.arch, "aarch64");
    assert_eq!(shape.virt, VirtMode::Hvm);
    assert_eq!(shape.os_variant.as_deref(), Some("fedora29"));
    assert!(matches!(
        Opt::parse_from(["vinstall", "kernel-paths", "--paravirt", "/srv/tree"]),
        Opt::KernelPaths(DetectOpts { paravirt: true, .. })
    ));
}
