//! Error kinds surfaced by detection and installation.
//!
//! Functions in this crate return [`anyhow::Result`]; when a failure belongs
//! to one of the classes below, the root error is an [`Error`] and callers
//! can classify it with [`Error::find`].

use thiserror::Error;

/// The classified failure kinds.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    /// No transport knows how to handle the location.
    #[error("Unsupported install location '{0}'")]
    UnsupportedLocation(String),
    /// Transport failure acquiring one specific file.
    #[error("Couldn't acquire file {url}: {reason}")]
    Fetch { url: String, reason: String },
    /// An upstream proxy answered with a gateway error; these are transient
    /// against real mirror infrastructure and retried at the detection level.
    #[error("Proxy gateway error ({status}) acquiring {url}")]
    ProxyGateway { url: String, status: u16 },
    /// No distro family matched, or the matched family's result failed validation.
    #[error("{0}")]
    Detection(String),
    /// Caller-supplied configuration is inconsistent; raised before any I/O.
    #[error("{0}")]
    Validation(String),
    /// The virtualization connection failed to define or create the domain.
    #[error("{0}")]
    DomainCreate(String),
}

impl Error {
    /// Find the first classified error in the chain of `e`.
    pub fn find(e: &anyhow::Error) -> Option<&Error> {
        e.chain().find_map(|c| c.downcast_ref::<Error>())
    }

    /// Returns true if `e` is, or wraps, a proxy gateway failure.
    pub fn is_proxy_gateway(e: &anyhow::Error) -> bool {
        matches!(Self::find(e), Some(Error::ProxyGateway { .. }))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_find_through_context() {
        let r: anyhow::Result<()> = Err(Error::ProxyGateway {
            url: "http://mirror/.treeinfo".into(),
            status: 502,
        })
        .context("Detecting distro");
        let e = r.unwrap_err();
        assert!(Error::is_proxy_gateway(&e));
        assert!(format!("{e:#}").contains("502"));

        let e = anyhow::Error::new(Error::Validation("bad".into())).context("outer");
        assert!(matches!(Error::find(&e), Some(Error::Validation(_))));
        assert!(!Error::is_proxy_gateway(&e));
        assert!(Error::find(&anyhow::anyhow!("plain")).is_none());
    }
}
