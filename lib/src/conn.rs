//! The virtualization connection the installer drives.
//!
//! Only the handful of calls needed to bring up a guest are modelled;
//! implementations wrap a real hypervisor API.

use anyhow::Result;

/// Classification of hypervisor API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtErrorCode {
    /// The operation is not supported by this connection or driver.
    NoSupport,
    /// The operation was attempted and failed.
    OperationFailed,
    /// Anything else.
    Other,
}

/// An error reported by the hypervisor API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct VirtError {
    /// Failure class.
    pub code: VirtErrorCode,
    /// Message from the hypervisor.
    pub message: String,
}

impl VirtError {
    /// Construct an error.
    pub fn new(code: VirtErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True if `e` wraps a [`VirtErrorCode::NoSupport`] error.
    pub fn is_nosupport(e: &anyhow::Error) -> bool {
        e.chain()
            .filter_map(|c| c.downcast_ref::<VirtError>())
            .any(|v| v.code == VirtErrorCode::NoSupport)
    }
}

/// A defined or running guest.
pub trait Domain: std::fmt::Debug {
    /// The guest name.
    fn name(&self) -> &str;
    /// Boot a defined guest.
    fn create(&self) -> Result<()>;
    /// Remove the persistent definition.
    fn undefine(&self) -> Result<()>;
    /// Set the start-on-host-boot flag.
    fn set_autostart(&self, autostart: bool) -> Result<()>;
    /// The live XML description.
    fn xml_desc(&self) -> Result<String>;
}

/// A connection to a hypervisor.
pub trait Connection: std::fmt::Debug {
    /// True if the hypervisor runs on another host, in which case local paths
    /// are not meaningful to it.
    fn is_remote(&self) -> bool;
    /// True if a guest with this name is already defined or running.
    fn domain_exists(&self, name: &str) -> Result<bool>;
    /// Persistently define a guest.
    fn define_xml(&self, xml: &str) -> Result<Box<dyn Domain>>;
    /// Start a transient guest.
    fn create_xml(&self, xml: &str) -> Result<Box<dyn Domain>>;
}

#[test]
fn test_nosupport() {
    use anyhow::Context;
    let r: Result<()> = Err(VirtError::new(VirtErrorCode::NoSupport, "autostart unsupported").into());
    let e = r.context("Setting autostart").unwrap_err();
    assert!(VirtError::is_nosupport(&e));
    let e = anyhow::Error::new(VirtError::new(VirtErrorCode::OperationFailed, "nope"));
    assert!(!VirtError::is_nosupport(&e));
}
