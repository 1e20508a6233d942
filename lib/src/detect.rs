//! # Distro detection
//!
//! Runs the family table of [`crate::distro`] against one fetcher,
//! validates the winner, and wraps the whole attempt in the proxy error
//! retry policy.

use std::time::Duration;

use anyhow::Result;
use vinstall_utils::RetryPolicy;

use crate::distro::{DistroDescriptor, Family, GuestShape, TreeCache};
use crate::fetch::Fetcher;
use crate::osdb::OsCatalog;
use crate::Error;

/// Default number of detection attempts when a proxy gateway error is seen.
pub const DEFAULT_DETECT_RETRIES: u32 = 10;
/// Default delay between those attempts.
pub const DEFAULT_DETECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A retry policy that only retries [`Error::ProxyGateway`].
pub fn proxy_retry_policy(max_attempts: u32, delay: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay,
        retryable: Error::is_proxy_gateway,
    }
}

/// Classifies install trees.
#[derive(Debug)]
pub struct Detector<'a> {
    catalog: &'a dyn OsCatalog,
    retry: RetryPolicy,
}

impl<'a> Detector<'a> {
    /// A detector with the default retry policy.
    pub fn new(catalog: &'a dyn OsCatalog) -> Self {
        Self {
            catalog,
            retry: proxy_retry_policy(DEFAULT_DETECT_RETRIES, DEFAULT_DETECT_RETRY_DELAY),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The families to try for `shape`. An OS variant hint known to the
    /// catalog restricts matching to its family; otherwise every family is
    /// tried in priority order.
    fn families_for(&self, shape: &GuestShape) -> Vec<Family> {
        if let Some(hint) = shape.os_variant.as_deref() {
            match self.catalog.lookup(hint) {
                Some(v) => {
                    if let Some(family) = Family::for_distro(&v.distro) {
                        tracing::debug!("os_variant={hint}, only checking {family}");
                        return vec![family];
                    }
                    tracing::debug!("No tree family for distro={}", v.distro);
                }
                None => tracing::debug!("Unknown os_variant={hint}, scanning all families"),
            }
        }
        Family::ALL.to_vec()
    }

    /// Classify the tree behind `fetcher` for a guest of `shape`.
    pub fn detect(&self, fetcher: &dyn Fetcher, shape: &GuestShape) -> Result<DistroDescriptor> {
        tracing::debug!("Finding distro store for location={}", fetcher.location());
        let families = self.families_for(shape);
        self.retry
            .run(|| self.detect_once(fetcher, shape, &families))
    }

    fn detect_once(
        &self,
        fetcher: &dyn Fetcher,
        shape: &GuestShape,
        families: &[Family],
    ) -> Result<DistroDescriptor> {
        let cache = TreeCache::new(fetcher, self.catalog);
        for &family in families {
            if !family.matches(&cache)? {
                continue;
            }
            // No backtracking: once claimed, failures here are final.
            let d = family.describe(&cache, shape)?;
            d.validate(fetcher.location().as_str())?;
            tracing::debug!(
                "Detected family={family} os_variant={}",
                d.os_variant.as_deref().unwrap_or("none")
            );
            return Ok(d);
        }
        Err(no_match_error(fetcher, families).into())
    }
}

fn no_match_error(fetcher: &dyn Fetcher, families: &[Family]) -> Error {
    let attempted = match families {
        [family] => format!("expected {family}"),
        _ => format!(
            "tried {}",
            families
                .iter()
                .map(|f| f.pretty_name())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    // Some webservers refuse directory listings, so an accessible-looking
    // miss does not prove the location is wrong.
    let hint = if fetcher.can_access() {
        "The location must be the root directory of an install tree, maybe you mistyped the path?"
    } else {
        "The URL could not be accessed, maybe you mistyped?"
    };
    Error::Detection(format!(
        "Could not find an installable distribution at '{}' ({attempted}): {hint}",
        fetcher.location()
    ))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::distro::Family;
    use crate::fixture::{Fixture, MockFetcher, INITRD, KERNEL};
    use crate::osdb::BuiltinOsCatalog;

    fn x86_64() -> GuestShape {
        GuestShape::hvm("x86_64")
    }

    #[test]
    fn test_detect_families() -> Result<()> {
        type Case = (fn() -> Result<Fixture>, Family, Option<&'static str>, &'static str);
        let cases: &[Case] = &[
            (
                || Fixture::fedora("29"),
                Family::Fedora,
                Some("fedora29"),
                "images/pxeboot/vmlinuz",
            ),
            (
                || Fixture::treeinfo_tree("Red Hat Enterprise Linux", "7.6", "x86_64"),
                Family::Rhel,
                Some("rhel7.6"),
                "images/pxeboot/vmlinuz",
            ),
            (
                // Newer than the catalog knows; maps onto the closest predecessor
                || Fixture::treeinfo_tree("CentOS", "7.6", "x86_64"),
                Family::Centos,
                Some("centos7.0"),
                "images/pxeboot/vmlinuz",
            ),
            (
                Fixture::sles12sp2,
                Family::Sles,
                Some("sles12sp2"),
                "boot/x86_64/loader/linux",
            ),
            (
                Fixture::opensuse_leap,
                Family::Opensuse,
                Some("opensuse42.3"),
                "boot/x86_64/loader/linux",
            ),
            (
                Fixture::debian_stretch,
                Family::Debian,
                Some("debian9"),
                "current/images/netboot/debian-installer/amd64/linux",
            ),
            (
                Fixture::ubuntu_bionic,
                Family::Ubuntu,
                Some("ubuntu18.04"),
                "current/images/netboot/ubuntu-installer/amd64/linux",
            ),
            (Fixture::mageia, Family::Mandriva, None, "isolinux/x86_64/vmlinuz"),
            (Fixture::altlinux, Family::AltLinux, None, "syslinux/alt0/vmlinuz"),
            (Fixture::generic, Family::GenericTreeinfo, None, "boot/kernel"),
        ];
        for (mk, family, variant, kernel) in cases {
            let fixture = mk()?;
            let d = fixture.detect(&x86_64())?;
            assert_eq!(d.family, *family);
            assert_eq!(d.os_variant.as_deref(), *variant, "{family}");
            assert_eq!(d.kernel, *kernel, "{family}");
        }
        Ok(())
    }

    #[test]
    fn test_kernel_args() -> Result<()> {
        let f = Fixture::fedora("29")?;
        let d = f.detect(&x86_64())?;
        assert_eq!(d.kernel_args, Some(format!("inst.repo={}", f.path)));
        let f = Fixture::treeinfo_tree("CentOS", "6.10", "x86_64")?;
        let d = f.detect(&x86_64())?;
        assert_eq!(d.os_variant.as_deref(), Some("centos6.10"));
        assert_eq!(d.kernel_args, Some(format!("method={}", f.path)));
        let f = Fixture::sles12sp2()?;
        assert_eq!(
            f.detect(&x86_64())?.kernel_args,
            Some(format!("install={}", f.path))
        );
        assert_eq!(Fixture::debian_stretch()?.detect(&x86_64())?.kernel_args, None);
        Ok(())
    }

    #[test]
    fn test_paravirt() -> Result<()> {
        let f = Fixture::fedora("29")?;
        let d = f.detect(&GuestShape::paravirt("x86_64"))?;
        assert_eq!(d.kernel, "images/xen/vmlinuz");
        assert_eq!(d.initrd, "images/xen/initrd.img");
        Ok(())
    }

    #[test]
    fn test_short_circuit() -> Result<()> {
        let f = Fixture::fedora("29")?;
        let scanned = f.detect(&x86_64())?;
        let hinted = f.detect(&x86_64().with_os_variant("fedora29"))?;
        assert_eq!(scanned, hinted);
        // Unknown hints fall back to the full scan
        let unknown = f.detect(&x86_64().with_os_variant("notanos1"))?;
        assert_eq!(scanned, unknown);

        // A hint for another family only tries that family
        let e = Fixture::debian_stretch()?
            .detect(&x86_64().with_os_variant("fedora29"))
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("(expected Fedora)"), "{msg}");
        assert!(matches!(Error::find(&e), Some(Error::Detection(_))));
        Ok(())
    }

    #[test]
    fn test_no_fallthrough() -> Result<()> {
        // Fedora claims the tree, so Generic Treeinfo is never consulted
        let f = Fixture::fedora_without_kernel()?;
        let e = f.detect(&x86_64()).unwrap_err();
        let msg = e.to_string();
        assert!(msg.starts_with("Couldn't find kernel for Fedora tree"), "{msg}");
        assert!(msg.contains(f.path.as_str()), "{msg}");
        let f = Fixture::fedora_bad_kernel_name()?;
        let e = f.detect(&x86_64()).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("does not look like a Fedora kernel"), "{msg}");
        assert!(msg.contains(f.path.as_str()), "{msg}");
        Ok(())
    }

    #[test]
    fn test_no_match() -> Result<()> {
        let f = Fixture::new("")?;
        let e = f.detect(&x86_64()).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("tried Fedora, Red Hat Enterprise Linux, CentOS"), "{msg}");
        assert!(msg.contains("root directory of an install tree"), "{msg}");

        let catalog = BuiltinOsCatalog::new();
        let fetcher = MockFetcher::unreachable("http://aksdkakskdfa-idontexist.com/foo/tree")?;
        let e = Detector::new(&catalog)
            .with_retry(RetryPolicy::none())
            .detect(&fetcher, &x86_64())
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("maybe you mistyped"), "{msg}");
        assert!(msg.contains("could not be accessed"), "{msg}");
        Ok(())
    }

    #[test]
    fn test_proxy_retry() -> Result<()> {
        let treeinfo = std::fs::read_to_string(Fixture::fedora("29")?.path.join(".treeinfo"))?;
        let files = [
            (".treeinfo", treeinfo.as_str()),
            ("images/pxeboot/vmlinuz", KERNEL),
            ("images/pxeboot/initrd.img", INITRD),
        ];
        let catalog = BuiltinOsCatalog::new();
        let url = "http://mirror.example.com/fedora/29/Server/x86_64/os/";

        let fetcher = MockFetcher::new(url, &files)?;
        *fetcher.proxy_failures.lock().unwrap() = 3;
        let d = Detector::new(&catalog)
            .with_retry(proxy_retry_policy(5, Duration::ZERO))
            .detect(&fetcher, &x86_64())?;
        assert_eq!(d.os_variant.as_deref(), Some("fedora29"));
        assert_eq!(d.kernel_args, Some(format!("inst.repo={url}")));

        let fetcher = MockFetcher::new(url, &files)?;
        *fetcher.proxy_failures.lock().unwrap() = 3;
        let e = Detector::new(&catalog)
            .with_retry(proxy_retry_policy(2, Duration::ZERO))
            .detect(&fetcher, &x86_64())
            .unwrap_err();
        assert!(Error::is_proxy_gateway(&e));
        Ok(())
    }

    #[test]
    fn test_repeatable() -> Result<()> {
        let f = Fixture::opensuse_leap()?;
        let fetcher = f.fetcher()?;
        let catalog = BuiltinOsCatalog::new();
        let detector = Detector::new(&catalog);
        let a = detector.detect(&*fetcher, &x86_64())?;
        let b = detector.detect(&*fetcher, &x86_64())?;
        assert_eq!(a, b);
        Ok(())
    }
}
