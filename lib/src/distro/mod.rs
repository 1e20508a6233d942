//! # Distro signature matching
//!
//! Each distro family knows how to recognize its own install tree layout
//! and, once it has claimed a tree, where the kernel and initrd live and
//! which kernel argument points the installer back at the tree. Families
//! are tried in a fixed priority order, see [`Family::ALL`].

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::fetch::Fetcher;
use crate::osdb::OsCatalog;
use crate::treeinfo::Treeinfo;
use crate::Error;

mod debian;
mod mandriva;
mod redhat;
mod suse;

/// A family of install tree layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    /// Fedora
    Fedora,
    /// Red Hat Enterprise Linux
    Rhel,
    /// CentOS and Scientific Linux
    Centos,
    /// SUSE Linux Enterprise Server
    Sles,
    /// SUSE Linux Enterprise Desktop
    Sled,
    /// openSUSE
    Opensuse,
    /// Debian
    Debian,
    /// Ubuntu
    Ubuntu,
    /// Mandriva and Mageia
    Mandriva,
    /// ALT Linux
    AltLinux,
    /// Any tree carrying a `.treeinfo` manifest.
    GenericTreeinfo,
}

impl Family {
    /// Every family, in matching priority order.
    pub const ALL: [Family; 11] = [
        Family::Fedora,
        Family::Rhel,
        Family::Centos,
        Family::Sles,
        Family::Sled,
        Family::Opensuse,
        Family::Debian,
        Family::Ubuntu,
        Family::Mandriva,
        Family::AltLinux,
        Family::GenericTreeinfo,
    ];

    /// Human readable name.
    pub fn pretty_name(self) -> &'static str {
        match self {
            Family::Fedora => "Fedora",
            Family::Rhel => "Red Hat Enterprise Linux",
            Family::Centos => "CentOS",
            Family::Sles => "SLES",
            Family::Sled => "SLED",
            Family::Opensuse => "openSUSE",
            Family::Debian => "Debian",
            Family::Ubuntu => "Ubuntu",
            Family::Mandriva => "Mandriva/Mageia",
            Family::AltLinux => "ALT Linux",
            Family::GenericTreeinfo => "Generic Treeinfo",
        }
    }

    /// OS catalog distro tags claimed by this family.
    pub fn matching_distros(self) -> &'static [&'static str] {
        match self {
            Family::Fedora => &["fedora"],
            Family::Rhel => &["rhel"],
            Family::Centos => &["centos"],
            Family::Sles => &["sles"],
            Family::Sled => &["sled"],
            Family::Opensuse => &["opensuse"],
            Family::Debian => &["debian"],
            Family::Ubuntu => &["ubuntu"],
            Family::Mandriva => &["mandriva", "mes", "mageia"],
            Family::AltLinux => &["altlinux"],
            Family::GenericTreeinfo => &[],
        }
    }

    /// The family claiming the catalog distro tag `distro`.
    pub fn for_distro(distro: &str) -> Option<Family> {
        Self::ALL
            .into_iter()
            .find(|f| f.matching_distros().contains(&distro))
    }

    /// The pattern a kernel file name from this family's trees must match.
    pub fn kernel_pattern(self) -> Option<&'static str> {
        match self {
            Family::Fedora | Family::Rhel | Family::Centos => Some(r"^(vmlinuz|vmlinux|kernel\.img)$"),
            Family::Sles | Family::Sled | Family::Opensuse => {
                Some(r"^(linux|linux64|vmlinuz-xen|vmrdr\.ikr)$")
            }
            Family::Debian | Family::Ubuntu => {
                Some(r"^(linux|vmlinuz|vmlinux|kernel\.(debian|ubuntu)|linux_vm)$")
            }
            Family::Mandriva | Family::AltLinux => Some(r"^vmlinuz$"),
            Family::GenericTreeinfo => None,
        }
    }

    fn strategy(self) -> &'static Strategy {
        // The table is indexed in the same order as ALL.
        &STRATEGIES[self as usize]
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pretty_name())
    }
}

/// Hardware virtualization versus paravirtualized boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VirtMode {
    /// Full hardware virtualization.
    #[default]
    Hvm,
    /// Xen-style paravirtualization; trees often ship a separate kernel for it.
    Paravirt,
}

/// What detection needs to know about the guest being installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestShape {
    /// Target CPU architecture, e.g. `x86_64`.
    pub arch: String,
    /// Virtualization mode.
    pub virt: VirtMode,
    /// A caller-asserted OS variant, used to test only the matching family.
    pub os_variant: Option<String>,
}

impl GuestShape {
    /// A fully virtualized guest.
    pub fn hvm(arch: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            virt: VirtMode::Hvm,
            os_variant: None,
        }
    }

    /// A paravirtualized guest.
    pub fn paravirt(arch: impl Into<String>) -> Self {
        Self {
            virt: VirtMode::Paravirt,
            ..Self::hvm(arch)
        }
    }

    /// Assert the OS variant ahead of detection.
    pub fn with_os_variant(mut self, os_variant: impl Into<String>) -> Self {
        self.os_variant = Some(os_variant.into());
        self
    }
}

/// The result of classifying an install tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DistroDescriptor {
    /// The family that claimed the tree.
    pub family: Family,
    /// The OS catalog variant, if it could be determined.
    pub os_variant: Option<String>,
    /// Tree-relative kernel path.
    pub kernel: String,
    /// Tree-relative initrd path.
    pub initrd: String,
    /// Kernel argument pointing the installer at the tree, e.g. `inst.repo=<location>`.
    pub kernel_args: Option<String>,
    /// Pattern the kernel file name must match.
    #[serde(skip)]
    pub kernel_pattern: Option<&'static str>,
}

impl DistroDescriptor {
    /// Check the kernel file name against the family's pattern; `location`
    /// is the tree the descriptor came from.
    pub(crate) fn validate(&self, location: &str) -> Result<()> {
        let Some(pattern) = self.kernel_pattern else {
            return Ok(());
        };
        let basename = self.kernel.rsplit('/').next().unwrap_or(&self.kernel);
        if !Regex::new(pattern)?.is_match(basename) {
            return Err(Error::Detection(format!(
                "Kernel '{}' found in {} tree at '{location}' does not look like a {} kernel",
                self.kernel, self.family, self.family
            ))
            .into());
        }
        Ok(())
    }
}

/// What a family reports after claiming a tree, before kernel paths are
/// checked for existence.
#[derive(Debug, Default)]
struct Candidate {
    os_variant: Option<String>,
    /// Tried in order; the first pair where both files exist wins.
    kernel_paths: Vec<(String, String)>,
    kernel_args: Option<String>,
}

/// One row of the matching table.
struct Strategy {
    family: Family,
    matches: fn(&TreeCache<'_>, Family) -> Result<bool>,
    build: fn(&TreeCache<'_>, Family, &GuestShape) -> Result<Candidate>,
}

static STRATEGIES: [Strategy; 11] = [
    Strategy {
        family: Family::Fedora,
        matches: redhat::matches,
        build: redhat::build,
    },
    Strategy {
        family: Family::Rhel,
        matches: redhat::matches,
        build: redhat::build,
    },
    Strategy {
        family: Family::Centos,
        matches: redhat::matches,
        build: redhat::build,
    },
    Strategy {
        family: Family::Sles,
        matches: suse::matches,
        build: suse::build,
    },
    Strategy {
        family: Family::Sled,
        matches: suse::matches,
        build: suse::build,
    },
    Strategy {
        family: Family::Opensuse,
        matches: suse::matches,
        build: suse::build,
    },
    Strategy {
        family: Family::Debian,
        matches: debian::matches,
        build: debian::build,
    },
    Strategy {
        family: Family::Ubuntu,
        matches: debian::matches,
        build: debian::build,
    },
    Strategy {
        family: Family::Mandriva,
        matches: mandriva::matches_mandriva,
        build: mandriva::build_mandriva,
    },
    Strategy {
        family: Family::AltLinux,
        matches: mandriva::matches_altlinux,
        build: mandriva::build_altlinux,
    },
    Strategy {
        family: Family::GenericTreeinfo,
        matches: matches_generic,
        build: build_generic,
    },
];

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("family", &self.family)
            .finish()
    }
}

impl Family {
    /// Test whether this family claims the tree behind `cache`.
    pub(crate) fn matches(self, cache: &TreeCache<'_>) -> Result<bool> {
        let s = self.strategy();
        (s.matches)(cache, s.family)
    }

    /// Build the descriptor for a tree this family claimed. Failing to find
    /// any kernel is a hard error.
    pub(crate) fn describe(
        self,
        cache: &TreeCache<'_>,
        shape: &GuestShape,
    ) -> Result<DistroDescriptor> {
        let s = self.strategy();
        let candidate = (s.build)(cache, s.family, shape)?;
        let os_variant = match candidate.os_variant {
            Some(v) if cache.catalog.lookup(&v).is_some() => Some(v),
            Some(v) => {
                tracing::debug!("Detected os_variant as {v}, which is not in the catalog");
                None
            }
            None => None,
        };
        for (kernel, initrd) in candidate.kernel_paths {
            if cache.fetcher.has_file(&kernel)? && cache.fetcher.has_file(&initrd)? {
                tracing::debug!("Found kernel={kernel} initrd={initrd} for {self}");
                return Ok(DistroDescriptor {
                    family: self,
                    os_variant,
                    kernel,
                    initrd,
                    kernel_args: candidate.kernel_args,
                    kernel_pattern: self.kernel_pattern(),
                });
            }
        }
        Err(Error::Detection(format!(
            "Couldn't find kernel for {self} tree at '{}'",
            cache.location()
        ))
        .into())
    }
}

fn matches_generic(cache: &TreeCache<'_>, _: Family) -> Result<bool> {
    if cache.treeinfo()?.is_some() {
        cache.treeinfo_matched.set(true);
        return Ok(true);
    }
    Ok(false)
}

fn build_generic(cache: &TreeCache<'_>, _: Family, shape: &GuestShape) -> Result<Candidate> {
    Ok(Candidate {
        kernel_paths: cache.treeinfo_media(shape)?,
        ..Default::default()
    })
}

/// Per-attempt memo of what has been learned about a tree, so that the
/// families probing it in turn do not refetch the same metadata.
#[derive(Debug)]
pub(crate) struct TreeCache<'a> {
    pub(crate) fetcher: &'a dyn Fetcher,
    pub(crate) catalog: &'a dyn OsCatalog,
    contents: RefCell<HashMap<String, Option<String>>>,
    treeinfo: OnceCell<Option<Treeinfo>>,
    /// Set once a family claimed the tree through its treeinfo.
    treeinfo_matched: Cell<bool>,
    suse_content: OnceCell<Option<suse::SuseContent>>,
    debian_media: Cell<Option<debian::MediaType>>,
}

impl<'a> TreeCache<'a> {
    pub(crate) fn new(fetcher: &'a dyn Fetcher, catalog: &'a dyn OsCatalog) -> Self {
        Self {
            fetcher,
            catalog,
            contents: Default::default(),
            treeinfo: OnceCell::new(),
            treeinfo_matched: Cell::new(false),
            suse_content: OnceCell::new(),
            debian_media: Cell::new(None),
        }
    }

    fn location(&self) -> &str {
        self.fetcher.location().as_str()
    }

    /// Fetch (once) the text of a small metadata file.
    fn content(&self, relpath: &str) -> Result<Option<String>> {
        if let Some(c) = self.contents.borrow().get(relpath) {
            return Ok(c.clone());
        }
        let c = if self.fetcher.has_file(relpath)? {
            self.fetcher.fetch_content(relpath)?
        } else {
            None
        };
        self.contents
            .borrow_mut()
            .insert(relpath.to_string(), c.clone());
        Ok(c)
    }

    /// True if some line of `relpath` matches `pattern`.
    fn content_regex(&self, relpath: &str, pattern: &str) -> Result<bool> {
        let Some(content) = self.content(relpath)? else {
            return Ok(false);
        };
        let re = Regex::new(pattern)?;
        let r = content.lines().any(|l| re.is_match(l));
        tracing::debug!("Checked {relpath} for {pattern}: {r}");
        Ok(r)
    }

    fn treeinfo(&self) -> Result<Option<&Treeinfo>> {
        if let Some(ti) = self.treeinfo.get() {
            return Ok(ti.as_ref());
        }
        let mut found = None;
        for path in [".treeinfo", "treeinfo"] {
            let Some(buf) = self.content(path)? else {
                continue;
            };
            match Treeinfo::parse(&buf) {
                Ok(ti) => {
                    tracing::debug!("Parsed {path}");
                    found = Some(ti);
                    break;
                }
                Err(e) => tracing::debug!("Failed to parse {path}: {e:#}"),
            }
        }
        Ok(self.treeinfo.get_or_init(|| found).as_ref())
    }

    /// Match the treeinfo family against `pattern`; a match means the
    /// claiming family takes its kernel paths from the treeinfo.
    fn treeinfo_family_matches(&self, pattern: &str) -> Result<bool> {
        let Some(family) = self.treeinfo()?.and_then(|ti| ti.family()) else {
            return Ok(false);
        };
        let r = Regex::new(pattern)?.is_match(&family);
        tracing::debug!("treeinfo family={family} pattern={pattern} matched={r}");
        if r {
            self.treeinfo_matched.set(true);
        }
        Ok(r)
    }

    /// The kernel/initrd pair the treeinfo lists for this guest.
    fn treeinfo_media(&self, shape: &GuestShape) -> Result<Vec<(String, String)>> {
        let Some(ti) = self.treeinfo()? else {
            return Ok(Vec::new());
        };
        let image_type = match shape.virt {
            VirtMode::Paravirt => "xen".to_string(),
            VirtMode::Hvm => ti.arch().unwrap_or_else(|| shape.arch.clone()),
        };
        match ti.images(&image_type) {
            Some(pair) => Ok(vec![pair]),
            None => {
                tracing::debug!("No images-{image_type} section in treeinfo");
                Ok(Vec::new())
            }
        }
    }
}
