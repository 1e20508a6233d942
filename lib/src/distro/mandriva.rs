//! Mandriva/Mageia and ALT Linux: identified by a version marker file,
//! kernels at fixed isolinux/syslinux paths.

use anyhow::Result;

use super::{Candidate, Family, GuestShape, TreeCache};

pub(super) fn matches_mandriva(cache: &TreeCache<'_>, _: Family) -> Result<bool> {
    cache.content_regex("VERSION", "(Mandriva|Mageia)")
}

pub(super) fn build_mandriva(
    _: &TreeCache<'_>,
    _: Family,
    shape: &GuestShape,
) -> Result<Candidate> {
    let arch = &shape.arch;
    Ok(Candidate {
        kernel_paths: vec![
            // Mageia 5 and later include the arch in the path
            (
                format!("isolinux/{arch}/vmlinuz"),
                format!("isolinux/{arch}/all.rdz"),
            ),
            (
                "isolinux/alt0/vmlinuz".into(),
                "isolinux/alt0/all.rdz".into(),
            ),
        ],
        ..Default::default()
    })
}

pub(super) fn matches_altlinux(cache: &TreeCache<'_>, _: Family) -> Result<bool> {
    cache.content_regex(".disk/info", "ALT ")
}

pub(super) fn build_altlinux(_: &TreeCache<'_>, _: Family, _: &GuestShape) -> Result<Candidate> {
    Ok(Candidate {
        kernel_paths: vec![(
            "syslinux/alt0/vmlinuz".into(),
            "syslinux/alt0/full.cz".into(),
        )],
        ..Default::default()
    })
}
