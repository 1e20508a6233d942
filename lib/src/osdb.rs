//! The OS-variant catalog.
//!
//! Detection only needs a narrow view of OS metadata: does a variant name
//! exist, which variants share a prefix (newest first), and what codename
//! or label a variant carries. [`OsCatalog`] is that view; callers backed by
//! a real metadata database implement it themselves, everything else can use
//! [`BuiltinOsCatalog`].

use camino::Utf8Path;

/// One known operating system variant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OsVariant {
    /// Short identifier, e.g. `fedora29`, `rhel7.6`, `debian9`.
    pub name: String,
    /// The distro tag, e.g. `fedora`, `rhel`, `opensuse`.
    pub distro: String,
    /// Release codename as it appears in mirror paths (`stretch`, `bionic`, `42.3`).
    pub codename: Option<String>,
    /// Human readable name.
    pub label: String,
}

/// Read-only access to OS variant metadata.
pub trait OsCatalog: std::fmt::Debug {
    /// Find a variant by exact name.
    fn lookup(&self, name: &str) -> Option<&OsVariant>;

    /// All variants whose name starts with `prefix`, newest first.
    fn variants_with_prefix(&self, prefix: &str) -> Vec<&OsVariant>;

    /// The newest variant whose name starts with `prefix`.
    fn latest(&self, prefix: &str) -> Option<&OsVariant> {
        self.variants_with_prefix(prefix).into_iter().next()
    }

    /// Identify the OS on an optical image. The default implementation
    /// never has an answer.
    fn guess_from_iso(&self, path: &Utf8Path) -> Option<String> {
        tracing::debug!("No ISO inspection available for {path}");
        None
    }
}

/// A compiled-in catalog covering the distro families that can be detected
/// from an install tree.
#[derive(Debug, Clone)]
pub struct BuiltinOsCatalog {
    /// Oldest first.
    variants: Vec<OsVariant>,
}

const DEBIAN: &[(u32, &str)] = &[
    (4, "etch"),
    (5, "lenny"),
    (6, "squeeze"),
    (7, "wheezy"),
    (8, "jessie"),
    (9, "stretch"),
    (10, "buster"),
    (11, "bullseye"),
    (12, "bookworm"),
];

const UBUNTU: &[(&str, &str)] = &[
    ("10.04", "lucid"),
    ("10.10", "maverick"),
    ("11.04", "natty"),
    ("11.10", "oneiric"),
    ("12.04", "precise"),
    ("12.10", "quantal"),
    ("13.04", "raring"),
    ("13.10", "saucy"),
    ("14.04", "trusty"),
    ("14.10", "utopic"),
    ("15.04", "vivid"),
    ("15.10", "wily"),
    ("16.04", "xenial"),
    ("16.10", "yakkety"),
    ("17.04", "zesty"),
    ("17.10", "artful"),
    ("18.04", "bionic"),
    ("18.10", "cosmic"),
    ("19.04", "disco"),
    ("19.10", "eoan"),
    ("20.04", "focal"),
    ("20.10", "groovy"),
    ("21.04", "hirsute"),
    ("21.10", "impish"),
    ("22.04", "jammy"),
    ("22.10", "kinetic"),
    ("23.04", "lunar"),
    ("23.10", "mantic"),
    ("24.04", "noble"),
];

const OPENSUSE: &[&str] = &[
    "10.2", "10.3", "11.0", "11.1", "11.2", "11.3", "11.4", "12.1", "12.2", "12.3", "13.1",
    "13.2", "42.1", "42.2", "42.3", "15.0", "15.1", "15.2", "15.3", "15.4", "15.5",
];

/// (major, highest service pack)
const SUSE_ENTERPRISE: &[(u32, u32)] = &[(10, 4), (11, 4), (12, 5), (15, 5)];

/// (major, highest minor)
const RHEL: &[(u32, u32)] = &[(5, 11), (6, 10), (7, 9), (8, 10), (9, 4)];

impl Default for BuiltinOsCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinOsCatalog {
    /// Build the catalog.
    pub fn new() -> Self {
        let mut variants = Vec::new();
        let mut push = |name: String, distro: &str, codename: Option<&str>, label: String| {
            variants.push(OsVariant {
                name,
                distro: distro.to_string(),
                codename: codename.map(ToOwned::to_owned),
                label,
            })
        };

        for v in 16..=41 {
            push(format!("fedora{v}"), "fedora", None, format!("Fedora {v}"));
        }
        for &(major, maxminor) in RHEL {
            for minor in 0..=maxminor {
                push(
                    format!("rhel{major}.{minor}"),
                    "rhel",
                    None,
                    format!("Red Hat Enterprise Linux {major}.{minor}"),
                );
            }
        }
        for &(major, maxminor) in &RHEL[..2] {
            for minor in 0..=maxminor {
                push(
                    format!("centos{major}.{minor}"),
                    "centos",
                    None,
                    format!("CentOS {major}.{minor}"),
                );
            }
        }
        push("centos7.0".into(), "centos", None, "CentOS 7".into());
        push("centos8".into(), "centos", None, "CentOS 8".into());
        for (prefix, product) in [("sles", "Server"), ("sled", "Desktop")] {
            for &(major, maxsp) in SUSE_ENTERPRISE {
                push(
                    format!("{prefix}{major}"),
                    prefix,
                    None,
                    format!("SUSE Linux Enterprise {product} {major}"),
                );
                for sp in 1..=maxsp {
                    push(
                        format!("{prefix}{major}sp{sp}"),
                        prefix,
                        None,
                        format!("SUSE Linux Enterprise {product} {major} SP{sp}"),
                    );
                }
            }
        }
        for &v in OPENSUSE {
            let label = if v.starts_with('4') || v.starts_with("15") {
                format!("openSUSE Leap {v}")
            } else {
                format!("openSUSE {v}")
            };
            push(format!("opensuse{v}"), "opensuse", Some(v), label);
        }
        push(
            "opensusetumbleweed".into(),
            "opensuse",
            Some("tumbleweed"),
            "openSUSE Tumbleweed".into(),
        );
        for &(v, codename) in DEBIAN {
            let label = format!("Debian {}", capitalize(codename));
            push(format!("debian{v}"), "debian", None, label);
        }
        for &(v, codename) in UBUNTU {
            let label = format!("Ubuntu {v} ({codename})");
            push(format!("ubuntu{v}"), "ubuntu", Some(codename), label);
        }
        for v in 1..=9 {
            push(format!("mageia{v}"), "mageia", None, format!("Mageia {v}"));
        }
        push("altlinux".into(), "altlinux", None, "ALT Linux".into());
        Self { variants }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl OsCatalog for BuiltinOsCatalog {
    fn lookup(&self, name: &str) -> Option<&OsVariant> {
        self.variants.iter().find(|v| v.name == name)
    }

    fn variants_with_prefix(&self, prefix: &str) -> Vec<&OsVariant> {
        self.variants
            .iter()
            .rev()
            .filter(|v| v.name.starts_with(prefix))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin() {
        let c = BuiltinOsCatalog::new();
        assert_eq!(c.lookup("fedora29").unwrap().distro, "fedora");
        assert!(c.lookup("fedora12").is_none());
        assert_eq!(c.latest("fedora").unwrap().name, "fedora41");
        assert_eq!(c.latest("rhel7").unwrap().name, "rhel7.9");
        assert!(c.lookup("rhel5.11").is_some());
        assert!(c.lookup("centos7.6").is_none());
        assert!(c.lookup("sles12sp3").is_some());
        assert!(c.lookup("sled11").is_some());
        assert_eq!(c.latest("debian").unwrap().name, "debian12");
        assert_eq!(c.lookup("debian9").unwrap().label, "Debian Stretch");
        assert_eq!(
            c.lookup("ubuntu18.04").unwrap().codename.as_deref(),
            Some("bionic")
        );
        assert_eq!(
            c.lookup("opensuse42.3").unwrap().codename.as_deref(),
            Some("42.3")
        );
        let ubuntu = c.variants_with_prefix("ubuntu");
        assert_eq!(ubuntu.first().unwrap().name, "ubuntu24.04");
        assert_eq!(ubuntu.last().unwrap().name, "ubuntu10.04");
        assert!(c.guess_from_iso(Utf8Path::new("/tmp/boot.iso")).is_none());
    }
}
