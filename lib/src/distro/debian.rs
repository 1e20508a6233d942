//! Debian and Ubuntu. These trees have no treeinfo; the layout depends on
//! how the media is published.

use anyhow::Result;
use regex::Regex;

use super::{Candidate, Family, GuestShape, TreeCache, VirtMode};

/// How a Debian-style tree is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MediaType {
    /// A mirror, `current/images`.
    Url,
    /// A mirror, `current/legacy-images`.
    LegacyUrl,
    /// The daily installer builds.
    Daily,
    /// An install ISO loop-mounted and exported over a network protocol.
    MountedIsoUrl,
    /// An install ISO read directly; the kernels there expect the ISO to be
    /// attached as a CDROM.
    Disk,
}

fn debname(family: Family) -> &'static str {
    match family {
        Family::Ubuntu => "ubuntu",
        _ => "debian",
    }
}

pub(super) fn matches(cache: &TreeCache<'_>, family: Family) -> Result<bool> {
    let is_ubuntu = family == Family::Ubuntu;
    let check_manifest = |mfile: &str| -> Result<bool> {
        if cache.content_regex(mfile, "[Uu]buntu")? {
            return Ok(is_ubuntu);
        }
        cache.content_regex(mfile, "[Dd]ebian")
    };
    let media_type = if check_manifest("current/images/MANIFEST")? {
        Some(MediaType::Url)
    } else if check_manifest("current/legacy-images/MANIFEST")? {
        Some(MediaType::LegacyUrl)
    } else if check_manifest("daily/MANIFEST")? {
        Some(MediaType::Daily)
    } else if cache.content_regex(".disk/info", if is_ubuntu { "^Ubuntu" } else { "^Debian" })? {
        if cache.fetcher.is_optical_image() {
            Some(MediaType::Disk)
        } else {
            Some(MediaType::MountedIsoUrl)
        }
    } else {
        None
    };
    if let Some(m) = media_type {
        tracing::debug!("Found {family} media type {m:?}");
        cache.debian_media.set(Some(m));
    }
    Ok(media_type.is_some())
}

pub(super) fn build(cache: &TreeCache<'_>, family: Family, shape: &GuestShape) -> Result<Candidate> {
    let debname = debname(family);
    let media = cache.debian_media.get().unwrap_or(MediaType::Url);
    let kernel_paths = if media == MediaType::Disk {
        vec![installcd_paths(debname, &shape.arch)]
    } else {
        url_paths(debname, media, &find_treearch(cache.location())?, shape.virt)
    };
    Ok(Candidate {
        os_variant: detect_variant(cache, debname, media),
        kernel_paths,
        kernel_args: None,
    })
}

/// The Debian architecture name embedded in the location.
fn find_treearch(location: &str) -> Result<String> {
    for pattern in [r"^.*/installer-(\w+)/?$", r"^.*/daily-images/(\w+)/?$"] {
        if let Some(c) = Regex::new(pattern)?.captures(location) {
            tracing::debug!("Found pattern={pattern} treearch={} in uri", &c[1]);
            return Ok(c[1].to_string());
        }
    }
    // Standard arch strings appear in the name of ISOs mounted for --location
    for arch in ["i386", "amd64", "x86_64", "arm64"] {
        if location.contains(arch) {
            tracing::debug!("Found treearch={arch} in uri");
            let arch = if arch == "x86_64" { "amd64" } else { arch };
            return Ok(arch.to_string());
        }
    }
    tracing::debug!("No treearch found in uri, defaulting to arch=i386");
    Ok("i386".to_string())
}

fn url_paths(
    debname: &str,
    media: MediaType,
    tree_arch: &str,
    virt: VirtMode,
) -> Vec<(String, String)> {
    let prefix = match media {
        MediaType::Daily => "daily",
        MediaType::MountedIsoUrl => "install",
        MediaType::LegacyUrl => "current/legacy-images",
        MediaType::Url | MediaType::Disk => "current/images",
    };
    let mut hvmroot = format!("{prefix}/netboot/{debname}-installer/{tree_arch}/");
    let mut kernel = "linux".to_string();
    let mut initrd = "initrd.gz".to_string();
    if tree_arch == "ppc64el" {
        kernel = "vmlinux".into();
    }
    if tree_arch == "s390x" {
        hvmroot = format!("{prefix}/generic/");
        kernel = format!("kernel.{debname}");
        initrd = format!("initrd.{debname}");
    }
    let mut r = Vec::new();
    if virt == VirtMode::Paravirt {
        let xenroot = format!("{prefix}/netboot/xen/");
        r.push((format!("{xenroot}vmlinuz"), format!("{xenroot}initrd.gz")));
    }
    r.push((format!("{hvmroot}{kernel}"), format!("{hvmroot}{initrd}")));
    r
}

fn installcd_paths(debname: &str, arch: &str) -> (String, String) {
    let (k, i) = match (debname, arch) {
        ("ubuntu", "s390x") => ("boot/kernel.ubuntu", "boot/initrd.ubuntu"),
        ("ubuntu", _) => ("install/vmlinuz", "install/initrd.gz"),
        (_, "x86_64") => ("install.amd/vmlinuz", "install.amd/initrd.gz"),
        (_, "i686") => ("install.386/vmlinuz", "install.386/initrd.gz"),
        (_, "aarch64") => ("install.a64/vmlinuz", "install.a64/initrd.gz"),
        (_, "ppc64le") => ("install/vmlinux", "install/initrd.gz"),
        (_, "s390x") => ("boot/linux_vm", "boot/root.bin"),
        _ => ("install/vmlinuz", "install/initrd.gz"),
    };
    (k.to_string(), i.to_string())
}

/// Variants are identified by a `/<codename>/` path component in the
/// location. Ubuntu catalog entries carry the codename; Debian ones only
/// have it in the label (`Debian Stretch`).
fn detect_variant(cache: &TreeCache<'_>, debname: &str, media: MediaType) -> Option<String> {
    let variants = cache.catalog.variants_with_prefix(debname);
    if media == MediaType::Daily {
        tracing::debug!("Appears to be {debname} 'daily' URL, using latest");
        return variants.first().map(|v| v.name.clone());
    }
    let location = cache.location();
    variants.into_iter().find_map(|v| {
        let codename = match v.codename.as_deref() {
            Some(c) => c.split_whitespace().next()?.to_ascii_lowercase(),
            None => v.label.split_whitespace().nth(1)?.to_ascii_lowercase(),
        };
        location
            .contains(&format!("/{codename}/"))
            .then(|| v.name.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_treearch() -> Result<()> {
        for (loc, arch) in [
            (
                "http://ftp.debian.org/debian/dists/stretch/main/installer-amd64/",
                "amd64",
            ),
            (
                "http://d-i.debian.org/daily-images/arm64",
                "arm64",
            ),
            ("/mnt/debian-9.4.0-x86_64-DVD", "amd64"),
            ("http://example.com/tree", "i386"),
        ] {
            assert_eq!(find_treearch(loc)?, arch, "{loc}");
        }
        Ok(())
    }

    #[test]
    fn test_url_paths() {
        let p = url_paths("debian", MediaType::Url, "amd64", VirtMode::Paravirt);
        assert_eq!(p[0].0, "current/images/netboot/xen/vmlinuz");
        assert_eq!(
            p[1].0,
            "current/images/netboot/debian-installer/amd64/linux"
        );
        let p = url_paths("ubuntu", MediaType::Daily, "s390x", VirtMode::Hvm);
        assert_eq!(
            p,
            [(
                "daily/generic/kernel.ubuntu".to_string(),
                "daily/generic/initrd.ubuntu".to_string()
            )]
        );
    }

    #[test]
    fn test_installcd_paths() {
        assert_eq!(installcd_paths("debian", "x86_64").0, "install.amd/vmlinuz");
        assert_eq!(installcd_paths("debian", "s390x").1, "boot/root.bin");
        assert_eq!(installcd_paths("ubuntu", "x86_64").0, "install/vmlinuz");
    }
}
