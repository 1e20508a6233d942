//! SLES, SLED and openSUSE. Newer trees carry a treeinfo; older ones only
//! the `content` product file.

use anyhow::Result;
use regex::Regex;

use super::{Candidate, Family, GuestShape, TreeCache, VirtMode};

/// The fields of a SUSE `content` file detection cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct SuseContent {
    product_name: String,
    /// `major.minor`, where minor is the service pack for enterprise products.
    product_version: Option<String>,
    tree_arch: Option<String>,
}

fn field<'a>(buf: &'a str, key: &str) -> Option<&'a str> {
    buf.lines().find_map(|l| {
        let (k, v) = l.split_once(char::is_whitespace)?;
        (k == key).then(|| v.trim()).filter(|v| !v.is_empty())
    })
}

/// Parse the `content` file. Returns `None` if no product name is present.
fn parse_content(buf: &str) -> Option<SuseContent> {
    let distro = field(buf, "DISTRO");
    // DISTRO looks like: cpe:/o:suse:sles:12:sp2,SUSE Linux Enterprise Server 12 SP2
    let product_name = field(buf, "LABEL")
        .or_else(|| distro.and_then(|d| d.split_once(',')).map(|(_, name)| name.trim()))?
        .to_string();

    let mut version = field(buf, "VERSION").map(|v| match v.split_once('-') {
        Some((v, _)) => v.to_string(),
        None => v.to_string(),
    });
    if version.is_none() {
        version = distro
            .and_then(|d| d.split_once(',').map(|(cpe, _)| cpe))
            .and_then(version_from_cpe);
    }
    if let Some(v) = version.as_mut() {
        if !v.contains('.') {
            if let Some(sp) = Regex::new(r"SP(\d+)")
                .ok()
                .and_then(|re| re.captures(&product_name))
            {
                v.push('.');
                v.push_str(&sp[1]);
            }
        }
    }

    let tree_arch = field(buf, "BASEARCHS")
        .and_then(|v| v.split_whitespace().next())
        .or_else(|| field(buf, "DEFAULTBASE"))
        .or_else(|| field(buf, "REPOID").and_then(|r| r.rsplit('/').next()))
        .map(normalize_arch);

    Some(SuseContent {
        product_name,
        product_version: version,
        tree_arch,
    })
}

/// `cpe:/o:suse:sles:12:sp2` -> `12.2`
fn version_from_cpe(cpe: &str) -> Option<String> {
    let mut parts = cpe.split(':').skip(4);
    let major = parts.next().filter(|m| m.chars().all(|c| c.is_ascii_digit()))?;
    match parts.next().and_then(|sp| sp.strip_prefix("sp")) {
        Some(sp) => Some(format!("{major}.{sp}")),
        None => Some(major.to_string()),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch {
        "i486" | "i586" | "i686" => "i386".to_string(),
        o => o.to_string(),
    }
}

fn family_regex(family: Family) -> &'static str {
    match family {
        Family::Sles => "SUSE Linux Enterprise Server",
        Family::Sled => "SUSE Linux Enterprise Desktop",
        _ => "openSUSE",
    }
}

fn product_regexes(family: Family) -> &'static [&'static str] {
    match family {
        Family::Sles => &["SUSE Linux Enterprise Server", "SUSE SLES"],
        Family::Sled => &["SUSE Linux Enterprise Desktop", "SUSE SLED"],
        _ => &["openSUSE"],
    }
}

fn variant_prefix(family: Family) -> &'static str {
    match family {
        Family::Sles => "sles",
        Family::Sled => "sled",
        _ => "opensuse",
    }
}

impl TreeCache<'_> {
    fn suse_content(&self) -> Result<Option<&SuseContent>> {
        if let Some(c) = self.suse_content.get() {
            return Ok(c.as_ref());
        }
        let parsed = self.content("content")?.as_deref().and_then(parse_content);
        if let Some(c) = parsed.as_ref() {
            tracing::debug!("Parsed SUSE content: {c:?}");
        }
        Ok(self.suse_content.get_or_init(|| parsed).as_ref())
    }
}

pub(super) fn matches(cache: &TreeCache<'_>, family: Family) -> Result<bool> {
    if cache.treeinfo_family_matches(family_regex(family))? {
        return Ok(true);
    }
    let Some(content) = cache.suse_content()? else {
        return Ok(false);
    };
    for pattern in product_regexes(family) {
        if Regex::new(pattern)?.is_match(&content.product_name) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(super) fn build(cache: &TreeCache<'_>, family: Family, shape: &GuestShape) -> Result<Candidate> {
    let prefix = variant_prefix(family);
    let os_variant = detect_variant(cache, family, prefix)?;
    let kernel_paths = if cache.treeinfo_matched.get() {
        cache.treeinfo_media(shape)?
    } else {
        let tree_arch = cache
            .suse_content()?
            .and_then(|c| c.tree_arch.clone())
            .unwrap_or_else(|| normalize_arch(&shape.arch));
        manual_kernel_paths(&tree_arch, shape, os_variant.as_deref())
    };
    Ok(Candidate {
        os_variant,
        kernel_paths,
        kernel_args: Some(format!("install={}", cache.location())),
    })
}

fn detect_variant(cache: &TreeCache<'_>, family: Family, prefix: &str) -> Result<Option<String>> {
    if family == Family::Opensuse {
        let name = cache.treeinfo()?.and_then(|ti| ti.name());
        if name.is_some_and(|n| n.contains("Tumbleweed")) {
            return Ok(Some("opensusetumbleweed".into()));
        }
    }
    let location = cache.location();
    for v in cache.catalog.variants_with_prefix(prefix) {
        let Some(codename) = v.codename.as_deref() else {
            continue;
        };
        if location.contains(&format!("/{codename}/")) {
            tracing::debug!("Found codename={codename} in the URL string");
            return Ok(Some(v.name.clone()));
        }
    }
    let Some(version) = cache.suse_content()?.and_then(|c| c.product_version.as_deref()) else {
        return Ok(None);
    };
    if family == Family::Opensuse {
        return Ok(Some(format!("{prefix}{version}")));
    }
    let r = match version.split_once('.') {
        Some((major, sp)) if sp != "0" => format!("{prefix}{major}sp{sp}"),
        Some((major, _)) => format!("{prefix}{major}"),
        None => format!("{prefix}{version}"),
    };
    Ok(Some(r))
}

fn manual_kernel_paths(
    tree_arch: &str,
    shape: &GuestShape,
    os_variant: Option<&str>,
) -> Vec<(String, String)> {
    let (oldkern, oldinit) = if tree_arch == "x86_64" {
        ("linux64", "initrd64")
    } else {
        ("linux", "initrd")
    };
    let mut r = Vec::new();
    if shape.virt == VirtMode::Paravirt {
        r.push((
            format!("boot/{tree_arch}/vmlinuz-xen"),
            format!("boot/{tree_arch}/initrd-xen"),
        ));
    }
    if shape.arch == "s390x"
        && os_variant.is_some_and(|v| v.starts_with("sles11") || v.starts_with("sled11"))
    {
        r.push(("boot/s390x/vmrdr.ikr".into(), "boot/s390x/initrd".into()));
    }
    r.push((
        format!("boot/{tree_arch}/linux"),
        format!("boot/{tree_arch}/initrd"),
    ));
    r.push((
        format!("boot/loader/{oldkern}"),
        format!("boot/loader/{oldinit}"),
    ));
    r.push((
        format!("boot/{tree_arch}/loader/linux"),
        format!("boot/{tree_arch}/loader/initrd"),
    ));
    r
}
