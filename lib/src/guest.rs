//! The guest configuration the installer mutates and renders.
//!
//! This is a deliberately small model of a libvirt domain: the fields the
//! install flow reads or temporarily overrides, plus enough to render
//! usable domain XML.

use std::fmt::Write as _;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::conn::Connection;
use crate::distro::{GuestShape, VirtMode};
use crate::Error;

/// The `<os><type>` of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsType {
    /// Fully virtualized.
    #[default]
    Hvm,
    /// Xen paravirtualized.
    Xen,
    /// An OS container.
    Exe,
}

impl OsType {
    fn as_str(self) -> &'static str {
        match self {
            OsType::Hvm => "hvm",
            OsType::Xen => "xen",
            OsType::Exe => "exe",
        }
    }
}

/// A firmware boot device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    /// Local disk.
    Hd,
    /// Optical media.
    Cdrom,
    /// PXE.
    Network,
    /// Floppy.
    Floppy,
}

impl BootDevice {
    /// The libvirt `<boot dev>` value.
    pub fn as_str(self) -> &'static str {
        match self {
            BootDevice::Hd => "hd",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Network => "network",
            BootDevice::Floppy => "fd",
        }
    }
}

impl std::str::FromStr for BootDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hd" => Ok(Self::Hd),
            "cdrom" => Ok(Self::Cdrom),
            "network" => Ok(Self::Network),
            "fd" | "floppy" => Ok(Self::Floppy),
            o => anyhow::bail!("Unknown boot device: {o}"),
        }
    }
}

/// What the hypervisor does when the guest reboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Tear the guest down.
    Destroy,
    /// Restart it.
    Restart,
    /// Leave it in place, stopped.
    Preserve,
}

impl LifecycleAction {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::Destroy => "destroy",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Preserve => "preserve",
        }
    }
}

/// The `<os>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsConfig {
    /// Virtualization type.
    pub os_type: OsType,
    /// Guest architecture; filled in by [`Guest::set_defaults`] if empty.
    pub arch: String,
    /// Firmware boot order.
    pub bootorder: Vec<BootDevice>,
    /// Direct kernel boot: kernel path on the host.
    pub kernel: Option<String>,
    /// Direct kernel boot: initrd path on the host.
    pub initrd: Option<String>,
    /// Direct kernel boot: command line.
    pub kernel_args: Option<String>,
}

impl OsConfig {
    /// True for OS containers, which have no firmware boot order.
    pub fn is_container(&self) -> bool {
        self.os_type == OsType::Exe
    }
}

/// The kind of a disk device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    /// A hard disk.
    Disk,
    /// Optical drive.
    Cdrom,
    /// Floppy drive.
    Floppy,
}

/// A disk, CDROM or floppy device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDisk {
    /// Device kind.
    pub device: DiskKind,
    /// Backing path; `None` for an empty removable drive.
    pub path: Option<Utf8PathBuf>,
    /// Size for storage that still has to be created.
    pub size_bytes: Option<u64>,
    /// Per-device boot order; when any device sets one, firmware boot order is not used.
    pub boot_order: Option<u32>,
    /// Set once the installer created the backing storage.
    pub storage_was_created: bool,
    /// This drive was added by the installer to carry the install media.
    pub install_media: bool,
}

impl DeviceDisk {
    /// A hard disk backed by `path`.
    pub fn disk(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            device: DiskKind::Disk,
            path: Some(path.into()),
            size_bytes: None,
            boot_order: None,
            storage_was_created: false,
            install_media: false,
        }
    }

    /// A hard disk whose backing file of `size_bytes` is created at install time.
    pub fn new_disk(path: impl Into<Utf8PathBuf>, size_bytes: u64) -> Self {
        Self {
            size_bytes: Some(size_bytes),
            ..Self::disk(path)
        }
    }

    /// An optical drive, optionally with media.
    pub fn cdrom(path: Option<Utf8PathBuf>) -> Self {
        Self {
            device: DiskKind::Cdrom,
            path,
            size_bytes: None,
            boot_order: None,
            storage_was_created: false,
            install_media: false,
        }
    }

    /// True for optical drives.
    pub fn is_cdrom(&self) -> bool {
        self.device == DiskKind::Cdrom
    }

    fn target_prefix(&self) -> &'static str {
        match self.device {
            DiskKind::Disk => "vd",
            DiskKind::Cdrom => "sd",
            DiskKind::Floppy => "fd",
        }
    }
}

/// A guest definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    /// Unique name on the connection.
    pub name: String,
    /// Hypervisor driver, e.g. `kvm`, `qemu`, `xen`, `vz`.
    pub domain_type: String,
    /// Memory in KiB.
    pub memory_kib: u64,
    /// Virtual CPUs.
    pub vcpus: u32,
    /// Boot configuration.
    pub os: OsConfig,
    /// Reboot policy; `None` uses the hypervisor default.
    pub on_reboot: Option<LifecycleAction>,
    /// Disk, CDROM and floppy devices, in bus order.
    pub disks: Vec<DeviceDisk>,
    /// OS catalog variant of the guest, if known.
    pub os_variant: Option<String>,
}

impl Guest {
    /// A guest with no devices and default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain_type: "kvm".into(),
            memory_kib: 2 * 1024 * 1024,
            vcpus: 1,
            os: OsConfig::default(),
            on_reboot: None,
            disks: Vec::new(),
            os_variant: None,
        }
    }

    /// True if the guest runs Windows, whose multi stage install needs the
    /// media to stay attached.
    pub fn is_windows(&self) -> bool {
        self.os_variant
            .as_deref()
            .is_some_and(|v| v.starts_with("win"))
    }

    /// The detection input for this guest.
    pub fn shape(&self) -> GuestShape {
        GuestShape {
            arch: self.os.arch.clone(),
            virt: match self.os.os_type {
                OsType::Xen => VirtMode::Paravirt,
                _ => VirtMode::Hvm,
            },
            os_variant: self.os_variant.clone(),
        }
    }

    /// Check that `name` is usable and not taken on `conn`.
    pub fn validate_name(conn: &dyn Connection, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Validation("Domain name must not be empty".into()).into());
        }
        if name.chars().any(|c| c == '/' || c.is_control()) {
            return Err(Error::Validation(format!("Invalid domain name '{name}'")).into());
        }
        if conn.domain_exists(name)? {
            return Err(Error::Validation(format!(
                "Guest name '{name}' is already in use."
            ))
            .into());
        }
        Ok(())
    }

    /// Fill in unset configuration.
    pub fn set_defaults(&mut self) {
        if self.os.arch.is_empty() {
            self.os.arch = std::env::consts::ARCH.to_string();
        }
        if self.vcpus == 0 {
            self.vcpus = 1;
        }
    }

    /// Render the libvirt domain XML.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_xml(&mut xml);
        xml
    }

    fn write_xml(&self, xml: &mut String) -> std::fmt::Result {
        writeln!(xml, r#"<domain type="{}">"#, escape(&self.domain_type))?;
        writeln!(xml, "  <name>{}</name>", escape(&self.name))?;
        writeln!(xml, r#"  <memory unit="KiB">{}</memory>"#, self.memory_kib)?;
        writeln!(xml, "  <vcpu>{}</vcpu>", self.vcpus)?;
        writeln!(xml, "  <os>")?;
        writeln!(
            xml,
            r#"    <type arch="{}">{}</type>"#,
            escape(&self.os.arch),
            self.os.os_type.as_str()
        )?;
        for (tag, v) in [
            ("kernel", &self.os.kernel),
            ("initrd", &self.os.initrd),
            ("cmdline", &self.os.kernel_args),
        ] {
            if let Some(v) = v {
                writeln!(xml, "    <{tag}>{}</{tag}>", escape(v))?;
            }
        }
        for dev in &self.os.bootorder {
            writeln!(xml, r#"    <boot dev="{}"/>"#, dev.as_str())?;
        }
        writeln!(xml, "  </os>")?;
        if let Some(action) = self.on_reboot {
            writeln!(xml, "  <on_reboot>{}</on_reboot>", action.as_str())?;
        }
        writeln!(xml, "  <devices>")?;
        let mut counters = [0u8; 3];
        for disk in &self.disks {
            let (kind, idx) = match disk.device {
                DiskKind::Disk => ("disk", 0),
                DiskKind::Cdrom => ("cdrom", 1),
                DiskKind::Floppy => ("floppy", 2),
            };
            let target = format!("{}{}", disk.target_prefix(), (b'a' + counters[idx]) as char);
            counters[idx] = counters[idx].saturating_add(1);
            writeln!(xml, r#"    <disk type="file" device="{kind}">"#)?;
            if let Some(path) = disk.path.as_ref() {
                writeln!(xml, r#"      <source file="{}"/>"#, escape(path.as_str()))?;
            }
            writeln!(xml, r#"      <target dev="{target}"/>"#)?;
            if let Some(order) = disk.boot_order {
                writeln!(xml, r#"      <boot order="{order}"/>"#)?;
            }
            if disk.is_cdrom() {
                writeln!(xml, "      <readonly/>")?;
            }
            writeln!(xml, "    </disk>")?;
        }
        writeln!(xml, "  </devices>")?;
        writeln!(xml, "</domain>")
    }
}

fn escape(s: &str) -> String {
    let mut r = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => r.push_str("&amp;"),
            '<' => r.push_str("&lt;"),
            '>' => r.push_str("&gt;"),
            '"' => r.push_str("&quot;"),
            '\'' => r.push_str("&apos;"),
            o => r.push(o),
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_to_xml() {
        let mut g = Guest::new("f29<test>");
        g.os.arch = "x86_64".into();
        g.os.kernel = Some("/var/lib/libvirt/boot/vinstall-vmlinuz.abc".into());
        g.os.kernel_args = Some("inst.repo=http://example.com/a&b".into());
        g.os.bootorder = vec![BootDevice::Cdrom, BootDevice::Hd];
        g.on_reboot = Some(LifecycleAction::Destroy);
        g.disks.push(DeviceDisk::disk("/var/lib/libvirt/images/f29.qcow2"));
        g.disks.push(DeviceDisk::cdrom(None));
        let expected = indoc! {r#"
            <domain type="kvm">
              <name>f29&lt;test&gt;</name>
              <memory unit="KiB">2097152</memory>
              <vcpu>1</vcpu>
              <os>
                <type arch="x86_64">hvm</type>
                <kernel>/var/lib/libvirt/boot/vinstall-vmlinuz.abc</kernel>
                <cmdline>inst.repo=http://example.com/a&amp;b</cmdline>
                <boot dev="cdrom"/>
                <boot dev="hd"/>
              </os>
              <on_reboot>destroy</on_reboot>
              <devices>
                <disk type="file" device="disk">
                  <source file="/var/lib/libvirt/images/f29.qcow2"/>
                  <target dev="vda"/>
                </disk>
                <disk type="file" device="cdrom">
                  <target dev="sda"/>
                  <readonly/>
                </disk>
              </devices>
            </domain>
        "#};
        assert_eq!(g.to_xml(), expected);
    }

    #[test]
    fn test_boot_device_parse() {
        assert_eq!("network".parse::<BootDevice>().unwrap(), BootDevice::Network);
        assert_eq!("floppy".parse::<BootDevice>().unwrap().as_str(), "fd");
        assert!("usb".parse::<BootDevice>().is_err());
    }

    #[test]
    fn test_shape() {
        let mut g = Guest::new("x");
        g.os.os_type = OsType::Xen;
        g.os.arch = "x86_64".into();
        g.os_variant = Some("win10".into());
        assert_eq!(g.shape().virt, VirtMode::Paravirt);
        assert!(g.is_windows());
    }
}
