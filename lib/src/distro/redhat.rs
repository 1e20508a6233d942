//! Fedora, RHEL and CentOS: always carry a treeinfo.

use anyhow::Result;

use super::{Candidate, Family, GuestShape, TreeCache};
use crate::treeinfo::split_version;

fn family_regex(family: Family) -> &'static str {
    match family {
        Family::Fedora => "Fedora",
        Family::Rhel => "(Red Hat Enterprise Linux|RHEL)",
        _ => "(CentOS|Scientific)",
    }
}

fn variant_prefix(family: Family) -> &'static str {
    match family {
        Family::Fedora => "fedora",
        Family::Rhel => "rhel",
        _ => "centos",
    }
}

pub(super) fn matches(cache: &TreeCache<'_>, family: Family) -> Result<bool> {
    cache.treeinfo_family_matches(family_regex(family))
}

pub(super) fn build(cache: &TreeCache<'_>, family: Family, shape: &GuestShape) -> Result<Candidate> {
    let os_variant = match family {
        Family::Fedora => fedora_variant(cache)?,
        _ => rhel_variant(cache, variant_prefix(family))?,
    };
    let kernel_args = format!(
        "{}={}",
        url_arg_name(os_variant.as_deref()),
        cache.location()
    );
    Ok(Candidate {
        kernel_paths: cache.treeinfo_media(shape)?,
        os_variant,
        kernel_args: Some(kernel_args),
    })
}

fn fedora_variant(cache: &TreeCache<'_>) -> Result<Option<String>> {
    let latest = cache.catalog.latest("fedora").map(|v| v.name.clone());
    let Some(verstr) = cache.treeinfo()?.and_then(|ti| ti.version()) else {
        return Ok(latest);
    };
    if matches!(verstr.to_ascii_lowercase().as_str(), "development" | "rawhide") {
        return Ok(latest);
    }
    let variant = format!("fedora{verstr}");
    if cache.catalog.lookup(&variant).is_some() {
        return Ok(Some(variant));
    }
    tracing::debug!("No catalog entry for {variant}, using latest fedora");
    Ok(latest)
}

/// Walk `<prefix><major>.<minor>` downward from the tree version until the
/// catalog knows the variant, so that a point release newer than the
/// catalog still maps onto its closest predecessor.
fn rhel_variant(cache: &TreeCache<'_>, prefix: &str) -> Result<Option<String>> {
    let Some(verstr) = cache.treeinfo()?.and_then(|ti| ti.version()) else {
        return Ok(None);
    };
    let (major, minor) = split_version(&verstr);
    if major == 0 {
        return Ok(None);
    }
    for m in (0..=minor).rev() {
        let variant = format!("{prefix}{major}.{m}");
        if cache.catalog.lookup(&variant).is_some() {
            return Ok(Some(variant));
        }
    }
    let variant = format!("{prefix}{major}");
    Ok(cache.catalog.lookup(&variant).map(|v| v.name.clone()))
}

/// Older anaconda releases only understand `method=`.
fn url_arg_name(os_variant: Option<&str>) -> &'static str {
    let Some(variant) = os_variant else {
        return "inst.repo";
    };
    let (major, _) = split_version(variant.trim_start_matches(|c: char| !c.is_ascii_digit()));
    let threshold = if variant.starts_with("fedora") { 19 } else { 7 };
    if major < threshold {
        "method"
    } else {
        "inst.repo"
    }
}

#[test]
fn test_url_arg_name() {
    assert_eq!(url_arg_name(None), "inst.repo");
    assert_eq!(url_arg_name(Some("fedora18")), "method");
    assert_eq!(url_arg_name(Some("fedora29")), "inst.repo");
    assert_eq!(url_arg_name(Some("rhel6.10")), "method");
    assert_eq!(url_arg_name(Some("centos7.0")), "inst.repo");
    assert_eq!(url_arg_name(Some("centos8")), "inst.repo");
}
