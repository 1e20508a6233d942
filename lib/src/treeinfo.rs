//! Parser for the `.treeinfo` install tree manifest.
//!
//! The format is INI-like:
//!
//! ```text
//! [general]
//! family = Fedora
//! version = 29
//! arch = x86_64
//!
//! [images-x86_64]
//! kernel = images/pxeboot/vmlinuz
//! initrd = images/pxeboot/initrd.img
//! ```
//!
//! Newer (productmd 1.x) trees carry `[release]` and `[tree]` sections
//! instead of, or in addition to, `[general]`; both layouts are understood.

use anyhow::{Context, Result};

/// The parsed manifest.
#[derive(Debug)]
pub struct Treeinfo {
    ini: tini::Ini,
}

/// Older trees (RHEL 5 era) write `key: value`; rewrite those lines as
/// `key = value` so the INI parser accepts them.
fn normalize_legacy(buf: &str) -> String {
    let mut out = String::with_capacity(buf.len());
    for line in buf.lines() {
        let trimmed = line.trim_start();
        let is_entry = !(trimmed.is_empty()
            || trimmed.starts_with('[')
            || trimmed.starts_with('#')
            || trimmed.starts_with(';'));
        match line.split_once(':') {
            Some((k, v)) if is_entry && !line.contains('=') => {
                out.push_str(k.trim_end());
                out.push_str(" = ");
                out.push_str(v.trim_start());
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

impl Treeinfo {
    /// Parse manifest text.
    pub fn parse(buf: &str) -> Result<Self> {
        let ini = tini::Ini::from_string(&normalize_legacy(buf)).context("Parse to ini")?;
        let ti = Self { ini };
        if ti.family().is_none() && ti.arch().is_none() {
            anyhow::bail!("No [general], [release] or [tree] section found");
        }
        Ok(ti)
    }

    /// Look up `key` in `section`; empty values are treated as absent.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.ini
            .get::<String>(section, key)
            .filter(|v| !v.is_empty())
    }

    /// The distribution family, e.g. `Fedora` or `Red Hat Enterprise Linux`.
    pub fn family(&self) -> Option<String> {
        self.get("general", "family")
            .or_else(|| self.get("release", "name"))
    }

    /// The distribution version string, e.g. `29` or `7.6`.
    pub fn version(&self) -> Option<String> {
        self.get("general", "version")
            .or_else(|| self.get("release", "version"))
    }

    /// The product name, e.g. `openSUSE Tumbleweed`.
    pub fn name(&self) -> Option<String> {
        if let Some(name) = self.get("general", "name") {
            return Some(name);
        }
        let name = self.get("release", "name")?;
        Some(match self.get("release", "version") {
            Some(v) => format!("{name} {v}"),
            None => name,
        })
    }

    /// The tree architecture.
    pub fn arch(&self) -> Option<String> {
        self.get("general", "arch").or_else(|| self.get("tree", "arch"))
    }

    /// The kernel/initrd pair from the `images-<image_type>` section.
    pub fn images(&self, image_type: &str) -> Option<(String, String)> {
        let section = format!("images-{image_type}");
        Some((self.get(&section, "kernel")?, self.get(&section, "initrd")?))
    }
}

/// Split a version like `7.6` into `(7, 6)`. Trees may carry just a major
/// version (`7`); unparseable components are zero.
pub(crate) fn split_version(verstr: &str) -> (u32, u32) {
    let mut parts = verstr.split('.');
    let parse = |p: Option<&str>| p.and_then(|p| p.trim().parse::<u32>().ok()).unwrap_or(0);
    let major = parse(parts.next());
    let minor = parse(parts.next());
    (major, minor)
}
