//! Test suite fixture.  Should only be used by this library.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;

use crate::conn::{Connection, Domain, VirtError, VirtErrorCode};
use crate::distro::{DistroDescriptor, GuestShape};
use crate::detect::{proxy_retry_policy, Detector};
use crate::fetch::{self, Fetcher, Location};
use crate::guest::DeviceDisk;
use crate::osdb::BuiltinOsCatalog;
use crate::storage::StorageBackend;
use crate::Error;

/// A file in a fixture tree: path and contents.
pub(crate) type FileDef = (&'static str, &'static str);

pub(crate) const KERNEL: &str = "\x7fELF fake kernel";
pub(crate) const INITRD: &str = "fake initrd";

fn treeinfo(family: &str, version: &str, arch: &str, kernel: &str, initrd: &str) -> String {
    format!(
        "[general]\nfamily = {family}\nversion = {version}\narch = {arch}\n\n\
         [images-{arch}]\nkernel = {kernel}\ninitrd = {initrd}\n\n\
         [images-xen]\nkernel = images/xen/vmlinuz\ninitrd = images/xen/initrd.img\n"
    )
}

/// An install tree in a temporary directory.
#[derive(Debug)]
pub(crate) struct Fixture {
    // Held for its drop
    _tempdir: tempfile::TempDir,
    /// The tree root; may be nested below the tempdir, since some families
    /// read the variant from path components.
    pub(crate) path: Utf8PathBuf,
    /// Downloads land here.
    pub(crate) scratch: Utf8PathBuf,
}

impl Fixture {
    /// An empty tree at `subdir` (relative, may be empty).
    pub(crate) fn new(subdir: &str) -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let base = Utf8Path::from_path(tempdir.path())
            .context("non-UTF8 tempdir")?
            .to_owned();
        let path = if subdir.is_empty() {
            base.join("tree")
        } else {
            base.join(subdir)
        };
        let scratch = base.join("scratch");
        std::fs::create_dir_all(&path)?;
        std::fs::create_dir_all(&scratch)?;
        Ok(Self {
            _tempdir: tempdir,
            path,
            scratch,
        })
    }

    pub(crate) fn write(&self, relpath: &str, contents: &str) -> Result<()> {
        let p = self.path.join(relpath);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&p, contents).with_context(|| format!("Writing {p}"))
    }

    pub(crate) fn write_all(&self, defs: &[FileDef]) -> Result<()> {
        defs.iter().try_for_each(|(p, c)| self.write(p, c))
    }

    fn with_files(subdir: &str, defs: &[FileDef]) -> Result<Self> {
        let r = Self::new(subdir)?;
        r.write_all(defs)?;
        Ok(r)
    }

    /// A tree described by a treeinfo, with both bare metal and Xen images.
    pub(crate) fn treeinfo_tree(family: &str, version: &str, arch: &str) -> Result<Self> {
        let r = Self::new("")?;
        r.write(
            ".treeinfo",
            &treeinfo(
                family,
                version,
                arch,
                "images/pxeboot/vmlinuz",
                "images/pxeboot/initrd.img",
            ),
        )?;
        r.write_all(&[
            ("images/pxeboot/vmlinuz", KERNEL),
            ("images/pxeboot/initrd.img", INITRD),
            ("images/xen/vmlinuz", KERNEL),
            ("images/xen/initrd.img", INITRD),
        ])?;
        Ok(r)
    }

    pub(crate) fn fedora(version: &str) -> Result<Self> {
        Self::treeinfo_tree("Fedora", version, "x86_64")
    }

    /// Claims to be Fedora but ships no kernel.
    pub(crate) fn fedora_without_kernel() -> Result<Self> {
        let r = Self::new("")?;
        r.write(
            ".treeinfo",
            &treeinfo(
                "Fedora",
                "29",
                "x86_64",
                "images/pxeboot/vmlinuz",
                "images/pxeboot/initrd.img",
            ),
        )?;
        Ok(r)
    }

    /// Claims to be Fedora but lists the initrd as the kernel.
    pub(crate) fn fedora_bad_kernel_name() -> Result<Self> {
        let r = Self::new("")?;
        r.write(
            ".treeinfo",
            &treeinfo(
                "Fedora",
                "29",
                "x86_64",
                "images/pxeboot/initrd.img",
                "images/pxeboot/initrd.img",
            ),
        )?;
        r.write("images/pxeboot/initrd.img", INITRD)?;
        Ok(r)
    }

    pub(crate) fn sles12sp2() -> Result<Self> {
        Self::with_files(
            "",
            &[
                (
                    "content",
                    "CONTENTSTYLE 11\nDISTRO cpe:/o:suse:sles:12:sp2,SUSE Linux Enterprise Server 12 SP2\n\
                     LABEL SUSE Linux Enterprise Server 12 SP2\nVERSION 12.2\nBASEARCHS x86_64\n",
                ),
                ("boot/x86_64/loader/linux", KERNEL),
                ("boot/x86_64/loader/initrd", INITRD),
            ],
        )
    }

    pub(crate) fn opensuse_leap() -> Result<Self> {
        Self::with_files(
            "",
            &[
                (
                    "content",
                    "LABEL openSUSE Leap 42.3\nVERSION 42.3\nBASEARCHS x86_64\n",
                ),
                ("boot/x86_64/loader/linux", KERNEL),
                ("boot/x86_64/loader/initrd", INITRD),
            ],
        )
    }

    pub(crate) fn debian_stretch() -> Result<Self> {
        Self::with_files(
            "debian/dists/stretch/main/installer-amd64",
            &[
                (
                    "current/images/MANIFEST",
                    "netboot/debian-installer/amd64/linux: kernel for the Debian installer\n",
                ),
                ("current/images/netboot/debian-installer/amd64/linux", KERNEL),
                ("current/images/netboot/debian-installer/amd64/initrd.gz", INITRD),
            ],
        )
    }

    pub(crate) fn ubuntu_bionic() -> Result<Self> {
        Self::with_files(
            "ubuntu/dists/bionic/main/installer-amd64",
            &[
                (
                    "current/images/MANIFEST",
                    "netboot/ubuntu-installer/amd64/linux: kernel for the Ubuntu installer\n",
                ),
                ("current/images/netboot/ubuntu-installer/amd64/linux", KERNEL),
                ("current/images/netboot/ubuntu-installer/amd64/initrd.gz", INITRD),
            ],
        )
    }

    pub(crate) fn mageia() -> Result<Self> {
        Self::with_files(
            "",
            &[
                ("VERSION", "Mageia 8 x86_64\n"),
                ("isolinux/x86_64/vmlinuz", KERNEL),
                ("isolinux/x86_64/all.rdz", INITRD),
            ],
        )
    }

    pub(crate) fn altlinux() -> Result<Self> {
        Self::with_files(
            "",
            &[
                (".disk/info", "ALT Linux 8.1 Starterkit\n"),
                ("syslinux/alt0/vmlinuz", KERNEL),
                ("syslinux/alt0/full.cz", INITRD),
            ],
        )
    }

    /// A treeinfo tree of an unknown distribution.
    pub(crate) fn generic() -> Result<Self> {
        let r = Self::new("")?;
        r.write(
            ".treeinfo",
            &treeinfo("Acme Linux", "1", "x86_64", "boot/kernel", "boot/initramfs"),
        )?;
        r.write_all(&[("boot/kernel", KERNEL), ("boot/initramfs", INITRD)])?;
        Ok(r)
    }

    pub(crate) fn location(&self) -> Result<Location> {
        Location::parse(self.path.as_str())
    }

    pub(crate) fn fetcher(&self) -> Result<Box<dyn Fetcher>> {
        fetch::open(&self.location()?, &self.scratch, ProgressBar::hidden())
    }

    /// Run detection against this tree without retries.
    pub(crate) fn detect(&self, shape: &GuestShape) -> Result<DistroDescriptor> {
        let catalog = BuiltinOsCatalog::new();
        let fetcher = self.fetcher()?;
        Detector::new(&catalog)
            .with_retry(proxy_retry_policy(1, std::time::Duration::ZERO))
            .detect(&*fetcher, shape)
    }
}

/// An in-memory network tree that can be told to fail with proxy gateway
/// errors, or to be unreachable altogether.
#[derive(Debug)]
pub(crate) struct MockFetcher {
    location: Location,
    scratch: Utf8PathBuf,
    progress: ProgressBar,
    files: HashMap<String, String>,
    accessible: bool,
    /// Number of upcoming requests which fail with a 502.
    pub(crate) proxy_failures: Mutex<u32>,
}

impl MockFetcher {
    pub(crate) fn new(url: &str, defs: &[(&str, &str)]) -> Result<Self> {
        Ok(Self {
            location: Location::parse(url)?,
            scratch: Utf8PathBuf::from("/nonexistent"),
            progress: ProgressBar::hidden(),
            files: defs
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            accessible: true,
            proxy_failures: Mutex::new(0),
        })
    }

    /// A location that can not be reached at all.
    pub(crate) fn unreachable(url: &str) -> Result<Self> {
        Ok(Self {
            accessible: false,
            ..Self::new(url, &[])?
        })
    }

    fn check_proxy(&self, relpath: &str) -> Result<()> {
        let mut n = self.proxy_failures.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            return Err(Error::ProxyGateway {
                url: self.location.join(relpath),
                status: 502,
            }
            .into());
        }
        Ok(())
    }
}

impl Fetcher for MockFetcher {
    fn location(&self) -> &Location {
        &self.location
    }

    fn scratchdir(&self) -> &Utf8Path {
        &self.scratch
    }

    fn has_file(&self, relpath: &str) -> Result<bool> {
        self.check_proxy(relpath)?;
        Ok(self.files.contains_key(relpath.trim_start_matches('/')))
    }

    fn copy_to(&self, relpath: &str, w: &mut dyn Write) -> Result<u64> {
        self.check_proxy(relpath)?;
        let c = self
            .files
            .get(relpath.trim_start_matches('/'))
            .ok_or_else(|| Error::Fetch {
                url: self.location.join(relpath),
                reason: "404 Not Found".into(),
            })?;
        w.write_all(c.as_bytes())?;
        Ok(c.len() as u64)
    }

    fn can_access(&self) -> bool {
        self.accessible
    }

    fn progress(&self) -> &ProgressBar {
        &self.progress
    }
}

/// Recorded interactions with, and injected failures of, the mock
/// hypervisor.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Names of guests that already exist.
    pub(crate) existing: Vec<String>,
    /// Every call, in order, e.g. `define`, `create_xml`, `create`.
    pub(crate) calls: Vec<String>,
    /// XML passed to `define_xml`, in order.
    pub(crate) defined: Vec<String>,
    /// XML passed to `create_xml`, in order.
    pub(crate) created: Vec<String>,
    pub(crate) fail_define: bool,
    pub(crate) fail_create_xml: bool,
    /// Fail starting a defined guest.
    pub(crate) fail_start: bool,
    pub(crate) fail_undefine: bool,
    pub(crate) autostart_error: Option<VirtErrorCode>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MockConnection {
    pub(crate) remote: bool,
    pub(crate) state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn domain(&self, xml: &str) -> Box<dyn Domain> {
        let name = xml
            .split_once("<name>")
            .and_then(|(_, r)| r.split_once("</name>"))
            .map(|(n, _)| n.to_string())
            .unwrap_or_default();
        Box::new(MockDomain {
            name,
            state: Arc::clone(&self.state),
        })
    }
}

fn failure(what: &str) -> anyhow::Error {
    VirtError::new(VirtErrorCode::OperationFailed, format!("injected {what} failure")).into()
}

impl Connection for MockConnection {
    fn is_remote(&self) -> bool {
        self.remote
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().existing.iter().any(|n| n == name))
    }

    fn define_xml(&self, xml: &str) -> Result<Box<dyn Domain>> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("define".into());
        if s.fail_define {
            return Err(failure("define"));
        }
        s.defined.push(xml.to_string());
        drop(s);
        Ok(self.domain(xml))
    }

    fn create_xml(&self, xml: &str) -> Result<Box<dyn Domain>> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("create_xml".into());
        if s.fail_create_xml {
            return Err(failure("create"));
        }
        s.created.push(xml.to_string());
        drop(s);
        Ok(self.domain(xml))
    }
}

#[derive(Debug)]
pub(crate) struct MockDomain {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl Domain for MockDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("create".into());
        if s.fail_start {
            return Err(failure("start"));
        }
        Ok(())
    }

    fn undefine(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("undefine".into());
        if s.fail_undefine {
            return Err(failure("undefine"));
        }
        Ok(())
    }

    fn set_autostart(&self, _: bool) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push("autostart".into());
        match s.autostart_error {
            Some(code) => Err(VirtError::new(code, "injected autostart failure").into()),
            None => Ok(()),
        }
    }

    fn xml_desc(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().defined.last().cloned().unwrap_or_default())
    }
}

/// Storage that only records what it was asked to do.
#[derive(Debug, Default, Clone)]
pub(crate) struct MockStorage {
    pub(crate) created: Arc<Mutex<Vec<Utf8PathBuf>>>,
    pub(crate) deleted: Arc<Mutex<Vec<Utf8PathBuf>>>,
    /// Deleting this path fails.
    pub(crate) fail_delete: Option<Utf8PathBuf>,
    /// Creating this path writes an empty file, then fails.
    pub(crate) fail_create: Option<Utf8PathBuf>,
}

impl StorageBackend for MockStorage {
    fn create(&self, disk: &DeviceDisk) -> Result<()> {
        let path = disk.path.clone().context("no path")?;
        if self.fail_create.as_ref() == Some(&path) {
            std::fs::write(&path, b"")?;
            anyhow::bail!("injected failure allocating {path}");
        }
        self.created.lock().unwrap().push(path);
        Ok(())
    }

    fn delete(&self, disk: &DeviceDisk) -> Result<()> {
        let path = disk.path.clone().context("no path")?;
        if self.fail_delete.as_ref() == Some(&path) {
            anyhow::bail!("injected failure removing {path}");
        }
        self.deleted.lock().unwrap().push(path);
        Ok(())
    }
}
