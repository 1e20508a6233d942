//! # Configuration
//!
//! TOML fragments in `vinstall/config.d` under the usual systemd-style
//! base directories, e.g. `/etc/vinstall/config.d/10-mirror.toml`:
//!
//! ```toml
//! [install]
//! scratchdir = "/srv/vinstall/boot"
//! detect-retries = 5
//! kargs = ["console=ttyS0"]
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use vinstall_utils::RetryPolicy;

use crate::detect::{proxy_retry_policy, DEFAULT_DETECT_RETRIES, DEFAULT_DETECT_RETRY_DELAY};

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
const CONFIG_DIR: &str = "vinstall/config.d";

/// The toplevel of a config fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigurationToplevel {
    install: Option<InstallConfiguration>,
}

/// The serialized `[install]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename = "install", rename_all = "kebab-case")]
pub struct InstallConfiguration {
    /// Root for downloaded kernels and initrds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratchdir: Option<Utf8PathBuf>,
    /// Detection attempts when a proxy reports a gateway error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_retries: Option<u32>,
    /// Delay between those attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_retry_delay_ms: Option<u64>,
    /// Kernel arguments appended to every tree based install.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kargs: Option<Vec<String>>,
}

impl InstallConfiguration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.scratchdir, other.scratchdir);
        mergeopt(&mut self.detect_retries, other.detect_retries);
        mergeopt(&mut self.detect_retry_delay_ms, other.detect_retry_delay_ms);
        if let Some(other_kargs) = other.kargs {
            self.kargs
                .get_or_insert_with(Default::default)
                .extend(other_kargs)
        }
    }

    /// The proxy gateway retry policy for detection.
    pub fn retry_policy(&self) -> RetryPolicy {
        proxy_retry_policy(
            self.detect_retries.unwrap_or(DEFAULT_DETECT_RETRIES),
            self.detect_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DETECT_RETRY_DELAY),
        )
    }

    /// The scratch root, created if missing.
    #[context("Creating scratch directory")]
    pub fn make_scratchdir(&self) -> Result<Utf8PathBuf> {
        let dir = match self.scratchdir.as_ref() {
            Some(d) => d.clone(),
            None => default_scratchdir()?,
        };
        std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        Ok(dir)
    }
}

/// `/var/lib/libvirt/boot` for root, otherwise the user cache directory.
fn default_scratchdir() -> Result<Utf8PathBuf> {
    if rustix::process::getuid().is_root() {
        return Ok(Utf8PathBuf::from("/var/lib/libvirt/boot"));
    }
    let cache = match std::env::var("XDG_CACHE_HOME") {
        Ok(v) if !v.is_empty() => Utf8PathBuf::from(v),
        _ => {
            let home = std::env::var("HOME").context("Neither XDG_CACHE_HOME nor HOME is set")?;
            Utf8Path::new(&home).join(".cache")
        }
    };
    Ok(cache.join("vinstall/boot"))
}

/// Load the configuration, merging all found fragments. No fragments at all
/// yields the defaults.
pub fn load_config() -> Result<InstallConfiguration> {
    load_config_from(SYSTEMD_CONVENTIONAL_BASES)
}

#[context("Loading configuration")]
fn load_config_from(bases: &[&str]) -> Result<InstallConfiguration> {
    let fragments = liboverdrop::scan(bases, CONFIG_DIR, &["toml"], true);
    let mut config = InstallConfiguration::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        let mut unused = std::collections::HashSet::new();
        let de = toml::Deserializer::new(&buf);
        let c: ConfigurationToplevel = serde_ignored::deserialize(de, |path| {
            unused.insert(path.to_string());
        })
        .with_context(|| format!("Parsing {path:?}"))?;
        for key in unused {
            tracing::warn!("{path:?}: Unknown key {key}");
        }
        if let Some(install) = c.install {
            tracing::debug!("Merging install config: {install:?}");
            config.merge(install);
        }
    }
    Ok(config)
}
