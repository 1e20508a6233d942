//! # Guest installation
//!
//! The [`Installer`] tracks the install media choice, temporarily alters
//! the guest's boot configuration for the install boot, creates the guest,
//! and leaves behind the post-install configuration.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{load_config, InstallConfiguration};
use crate::conn::{Connection, Domain, VirtError};
use crate::fetch::Location;
use crate::guest::{BootDevice, DeviceDisk, DiskKind, Guest, LifecycleAction};
use crate::osdb::{BuiltinOsCatalog, OsCatalog};
use crate::storage::{LocalFileStorage, StorageBackend};
use crate::treemedia::TreeMedia;
use crate::Error;

/// Install media selection.
#[derive(Debug, Clone, Default)]
pub struct InstallerOptions {
    /// Path to an ISO or CDROM device to install from.
    pub cdrom: Option<Utf8PathBuf>,
    /// An install tree URL, local directory, or ISO.
    pub location: Option<String>,
    /// The device to boot the install from.
    pub install_bootdev: Option<BootDevice>,
    /// Kernel to use instead of the detected one: a path relative to
    /// `location`, or a URL.
    pub location_kernel: Option<String>,
    /// Initrd paired with `location_kernel`.
    pub location_initrd: Option<String>,
}

impl InstallerOptions {
    /// Reject inconsistent media selections.
    fn validate(&self) -> Result<()> {
        if self.location_kernel.is_some() || self.location_initrd.is_some() {
            if self.location.is_none() {
                return Err(Error::Validation(
                    "location kernel/initrd may only be specified with a location URL/path"
                        .into(),
                )
                .into());
            }
            if self.location_kernel.is_none() || self.location_initrd.is_none() {
                return Err(Error::Validation(
                    "location kernel/initrd must be specified as a pair".into(),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Options for [`Installer::start_install`].
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Go through every step but never create storage or the guest.
    pub dry: bool,
    /// Stop after rendering and return the XML.
    pub return_xml: bool,
    /// Boot the guest even if there is no install phase.
    pub doboot: bool,
    /// Create a transient guest with no persistent definition.
    pub transient: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            dry: false,
            return_xml: false,
            doboot: true,
            transient: false,
        }
    }
}

/// The result of [`Installer::start_install`].
#[derive(Debug)]
pub enum InstallOutcome {
    /// Rendered XML, for [`StartOptions::return_xml`].
    Xml {
        /// The install boot XML, if there is an install phase.
        install: Option<String>,
        /// The post-install XML.
        final_xml: String,
    },
    /// A dry run completed.
    DryRun,
    /// The created guest.
    Domain(Box<dyn Domain>),
}

/// A disk that could not be removed by [`Installer::cleanup_created_disks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackWarning {
    /// The disk backing path.
    pub path: Option<Utf8PathBuf>,
    /// What went wrong.
    pub message: String,
}

/// Drives one guest through install.
#[derive(Debug)]
pub struct Installer {
    conn: Arc<dyn Connection>,
    catalog: Arc<dyn OsCatalog>,
    storage: Box<dyn StorageBackend>,
    /// The cdrom is a live image; there is no install phase.
    pub livecd: bool,
    /// Mark the guest to start on host boot.
    pub autostart: bool,
    /// Extra kernel arguments for the install boot.
    pub extra_args: Vec<String>,
    install_bootdev: Option<BootDevice>,
    install_kernel: Option<Utf8PathBuf>,
    install_initrd: Option<Utf8PathBuf>,
    install_cdrom_added: bool,
    defaults_are_set: bool,
    cdrom: Option<Utf8PathBuf>,
    treemedia: Option<TreeMedia>,
}

/// Saves the boot fields of a guest, restoring them (and ejecting the
/// install media) when dropped.
struct BootConfigGuard<'g> {
    guest: &'g mut Guest,
    saved: Option<BootSnapshot>,
    eject: bool,
}

struct BootSnapshot {
    bootorder: Vec<BootDevice>,
    kernel: Option<String>,
    initrd: Option<String>,
    kernel_args: Option<String>,
    on_reboot: Option<LifecycleAction>,
}

impl<'g> BootConfigGuard<'g> {
    fn new(guest: &'g mut Guest, eject: bool) -> Self {
        let saved = BootSnapshot {
            bootorder: guest.os.bootorder.clone(),
            kernel: guest.os.kernel.clone(),
            initrd: guest.os.initrd.clone(),
            kernel_args: guest.os.kernel_args.clone(),
            on_reboot: guest.on_reboot,
        };
        Self {
            guest,
            saved: Some(saved),
            eject,
        }
    }
}

impl Deref for BootConfigGuard<'_> {
    type Target = Guest;

    fn deref(&self) -> &Guest {
        self.guest
    }
}

impl DerefMut for BootConfigGuard<'_> {
    fn deref_mut(&mut self) -> &mut Guest {
        self.guest
    }
}

impl Drop for BootConfigGuard<'_> {
    fn drop(&mut self) {
        if self.eject {
            if let Some(disk) = self.guest.disks.iter_mut().find(|d| d.install_media) {
                disk.path = None;
            }
        }
        if let Some(s) = self.saved.take() {
            self.guest.os.bootorder = s.bootorder;
            self.guest.os.kernel = s.kernel;
            self.guest.os.initrd = s.initrd;
            self.guest.os.kernel_args = s.kernel_args;
            self.guest.on_reboot = s.on_reboot;
        }
    }
}

/// Boot from `bootdev`, with the local disk as fallback if the guest has one.
pub fn build_boot_order(guest: &Guest, bootdev: BootDevice) -> Vec<BootDevice> {
    let mut bootorder = vec![bootdev];
    // Keeps disks bootable after a network or media install
    if guest.disks.iter().any(|d| d.device == DiskKind::Disk) && bootdev != BootDevice::Hd {
        bootorder.push(BootDevice::Hd);
    }
    bootorder
}

fn can_set_guest_bootorder(guest: &Guest) -> bool {
    !guest.os.is_container()
        && guest.os.kernel.is_none()
        && guest.disks.iter().all(|d| d.boot_order.is_none())
}

fn domain_create_error(e: anyhow::Error) -> anyhow::Error {
    Error::DomainCreate(format!("{e:#}")).into()
}

impl Installer {
    /// Set up an install using the system configuration and the built-in OS catalog.
    pub fn new(conn: Arc<dyn Connection>, opts: InstallerOptions) -> Result<Self> {
        Self::with_config(
            conn,
            opts,
            Arc::new(BuiltinOsCatalog::new()),
            load_config()?,
        )
    }

    /// Set up an install with explicit collaborators.
    pub fn with_config(
        conn: Arc<dyn Connection>,
        opts: InstallerOptions,
        catalog: Arc<dyn OsCatalog>,
        config: InstallConfiguration,
    ) -> Result<Self> {
        opts.validate()?;
        let mut install_bootdev = opts.install_bootdev;
        let cdrom = match opts.cdrom {
            Some(cdrom) => {
                if !conn.is_remote() && !cdrom.try_exists()? {
                    return Err(
                        Error::Validation(format!("Path '{cdrom}' does not exist")).into()
                    );
                }
                install_bootdev = Some(BootDevice::Cdrom);
                Some(cdrom)
            }
            None => None,
        };
        let treemedia = match opts.location.as_deref() {
            Some(location) => Some(TreeMedia::new(
                location,
                opts.location_kernel,
                opts.location_initrd,
                Arc::clone(&catalog),
                config,
            )?),
            None => None,
        };
        Ok(Self {
            conn,
            catalog,
            storage: Box::new(LocalFileStorage),
            livecd: false,
            autostart: false,
            extra_args: Vec::new(),
            install_bootdev,
            install_kernel: None,
            install_initrd: None,
            install_cdrom_added: false,
            defaults_are_set: false,
            cdrom,
            treemedia,
        })
    }

    /// Replace the storage backend used to create and remove disks.
    pub fn with_storage(mut self, storage: Box<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    /// The install tree location, if any.
    pub fn location(&self) -> Option<&Location> {
        self.treemedia.as_ref().map(|t| t.location())
    }

    /// The install CDROM, if any.
    pub fn cdrom(&self) -> Option<&Utf8Path> {
        self.cdrom.as_deref()
    }

    /// Files to add to the fetched initrd.
    pub fn set_initrd_injections(&mut self, injections: Vec<Utf8PathBuf>) {
        if let Some(t) = self.treemedia.as_mut() {
            t.initrd_injections = injections;
        }
    }

    fn cdrom_path(&self) -> Option<Utf8PathBuf> {
        match self.treemedia.as_ref() {
            Some(t) => t.cdrom_path().map(Utf8PathBuf::from),
            None => self.cdrom.clone(),
        }
    }

    fn add_install_cdrom_device(&mut self, guest: &mut Guest) {
        if self.install_cdrom_added {
            return;
        }
        let Some(path) = self.cdrom_path() else {
            return;
        };
        let dev = DeviceDisk {
            install_media: true,
            ..DeviceDisk::cdrom(Some(path))
        };
        // Before any other CDROM, so boot=cdrom picks it first
        let idx = guest
            .disks
            .iter()
            .position(|d| d.is_cdrom())
            .unwrap_or(guest.disks.len());
        guest.disks.insert(idx, dev);
        self.install_cdrom_added = true;
    }

    /// Whether to eject the install media once the install boot XML is rendered.
    fn install_media_to_eject(&self, guest: &Guest) -> bool {
        // Live media stays; Windows has a multi stage install
        self.install_cdrom_added && !self.livecd && !guest.is_windows()
    }

    fn alter_bootconfig(&self, guest: &mut Guest) {
        guest.on_reboot = Some(LifecycleAction::Destroy);
        if let Some(k) = self.install_kernel.as_ref() {
            guest.os.kernel = Some(k.to_string());
        }
        if let Some(i) = self.install_initrd.as_ref() {
            guest.os.initrd = Some(i.to_string());
        }
        if !self.extra_args.is_empty() {
            guest.os.kernel_args = Some(self.extra_args.join(" "));
        }
        guest.os.bootorder = match self.install_bootdev {
            Some(bootdev) if can_set_guest_bootorder(guest) => build_boot_order(guest, bootdev),
            _ => Vec::new(),
        };
    }

    fn prepare(&mut self, guest: &Guest) -> Result<()> {
        if let Some(t) = self.treemedia.as_mut() {
            let plan = t.prepare(&guest.shape())?;
            tracing::debug!("Install plan: {plan:?}");
            self.install_kernel = Some(plan.kernel);
            self.install_initrd = Some(plan.initrd);
            self.extra_args.extend(plan.extra_args);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(t) = self.treemedia.as_mut() {
            if let Err(e) = t.cleanup() {
                tracing::warn!("Failed to clean up install media: {e:#}");
            }
        }
    }

    fn postinstall_bootdev(&self, guest: &Guest) -> BootDevice {
        if self.cdrom.is_some() && self.livecd {
            return BootDevice::Cdrom;
        }
        if let Some(bootdev) = self.install_bootdev {
            if guest.disks.iter().any(|d| d.device == DiskKind::Disk) {
                return BootDevice::Hd;
            }
            return bootdev;
        }
        match guest.disks.first().map(|d| d.device) {
            Some(DiskKind::Cdrom) => BootDevice::Cdrom,
            Some(DiskKind::Floppy) => BootDevice::Floppy,
            Some(DiskKind::Disk) | None => BootDevice::Hd,
        }
    }

    /// Add install media and a boot order to `guest`. Called by
    /// [`Self::start_install`] if the caller did not do so earlier; only the
    /// first call has an effect.
    pub fn set_install_defaults(&mut self, guest: &mut Guest) {
        if self.defaults_are_set {
            return;
        }
        self.add_install_cdrom_device(guest);
        if guest.os.bootorder.is_empty() && can_set_guest_bootorder(guest) {
            let bootdev = self.postinstall_bootdev(guest);
            guest.os.bootorder = build_boot_order(guest, bootdev);
        }
        guest.set_defaults();
        self.defaults_are_set = true;
    }

    /// Paths the hypervisor needs search access to for this install.
    pub fn get_search_paths(&self) -> Result<Vec<Utf8PathBuf>> {
        let mut r = Vec::new();
        if let Some(t) = self.treemedia.as_ref() {
            r.push(t.scratch_root()?);
        }
        r.extend(self.cdrom_path());
        Ok(r)
    }

    /// True if this setup boots into an OS installer. Live CDs, imports and a
    /// plain boot order do not.
    pub fn has_install_phase(&self) -> bool {
        if self.cdrom.is_some() && self.livecd {
            return false;
        }
        self.cdrom.is_some() || self.install_bootdev.is_some() || self.treemedia.is_some()
    }

    /// Detect the OS variant of the install media. Any failure is `None`.
    pub fn detect_distro(&mut self, guest: &Guest) -> Option<String> {
        let r = if let Some(t) = self.treemedia.as_mut() {
            t.detect_distro(&guest.shape())
        } else if let Some(cdrom) = self.cdrom.as_deref() {
            if self.conn.is_remote() {
                tracing::debug!("Can't detect distro for cdrom remote connection.");
                None
            } else {
                self.catalog.guess_from_iso(cdrom)
            }
        } else {
            tracing::debug!("No media for distro detection.");
            None
        };
        tracing::debug!("installer.detect_distro returned={r:?}");
        r
    }

    fn get_install_xml(&self, guest: &mut Guest) -> String {
        let eject = self.install_media_to_eject(guest);
        let mut guard = BootConfigGuard::new(guest, eject);
        self.alter_bootconfig(&mut guard);
        guard.to_xml()
    }

    fn build_xml(&self, guest: &mut Guest) -> (Option<String>, String) {
        let install_xml = self
            .has_install_phase()
            .then(|| self.get_install_xml(guest));
        let final_xml = guest.to_xml();
        match install_xml.as_deref() {
            Some(xml) => tracing::debug!("Generated install XML:\n{xml}"),
            None => tracing::debug!("Generated install XML: None required"),
        }
        tracing::debug!("Generated boot XML:\n{final_xml}");
        (install_xml, final_xml)
    }

    /// For hypervisors without transient guests: define, start, and
    /// undefine again if the start fails.
    fn manual_transient_create(
        &self,
        install_xml: Option<&str>,
        final_xml: &str,
        needs_boot: bool,
    ) -> Result<Box<dyn Domain>> {
        let domain = self
            .conn
            .define_xml(install_xml.unwrap_or(final_xml))
            .map_err(domain_create_error)?;
        if !needs_boot {
            return Ok(domain);
        }
        if let Err(e) = domain.create() {
            if let Err(undefine_err) = domain.undefine() {
                tracing::debug!("Failed to undefine {}: {undefine_err:#}", domain.name());
            }
            return Err(domain_create_error(e));
        }
        match install_xml {
            Some(ix) if ix != final_xml => {
                self.conn.define_xml(final_xml).map_err(domain_create_error)
            }
            _ => Ok(domain),
        }
    }

    fn create_guest(
        &self,
        guest: &Guest,
        install_xml: Option<&str>,
        final_xml: &str,
        doboot: bool,
        transient: bool,
    ) -> Result<Box<dyn Domain>> {
        tracing::info!("Creating domain...");
        let needs_boot = doboot || self.has_install_phase();
        let domain = if guest.domain_type == "vz" {
            if transient {
                return Err(Error::DomainCreate(
                    "Domain type 'vz' doesn't support transient installs.".into(),
                )
                .into());
            }
            self.manual_transient_create(install_xml, final_xml, needs_boot)?
        } else if transient {
            self.conn
                .create_xml(install_xml.unwrap_or(final_xml))
                .map_err(domain_create_error)?
        } else {
            if needs_boot {
                self.conn
                    .create_xml(install_xml.unwrap_or(final_xml))
                    .map_err(domain_create_error)?;
            }
            self.conn
                .define_xml(final_xml)
                .map_err(domain_create_error)?
        };
        match domain.xml_desc() {
            Ok(xml) => tracing::debug!("XML fetched from domain object:\n{xml}"),
            Err(e) => tracing::debug!("Error fetching XML from domain object: {e:#}"),
        }
        Ok(domain)
    }

    fn flag_autostart(domain: &dyn Domain) -> Result<()> {
        match domain.set_autostart(true) {
            Ok(()) => Ok(()),
            Err(e) if VirtError::is_nosupport(&e) => {
                tracing::warn!(
                    "Could not set autostart flag: connection does not support autostart."
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the install: add install media to the guest, boot it, then
    /// redefine it with the post-install configuration. Downloaded media is
    /// cleaned up on every path; created disks are not, see
    /// [`Self::cleanup_created_disks`].
    pub fn start_install(
        &mut self,
        guest: &mut Guest,
        opts: StartOptions,
    ) -> Result<InstallOutcome> {
        Guest::validate_name(&*self.conn, &guest.name)?;
        self.set_install_defaults(guest);
        let r = self.start_install_impl(guest, opts);
        self.cleanup();
        r
    }

    fn start_install_impl(
        &mut self,
        guest: &mut Guest,
        opts: StartOptions,
    ) -> Result<InstallOutcome> {
        self.prepare(guest)?;

        if !opts.dry {
            for disk in guest.disks.iter_mut() {
                if self.storage.needs_creation(disk)? {
                    if let Err(e) = self.storage.create(disk) {
                        // Whatever a failed create left behind is still ours to roll back
                        disk.storage_was_created =
                            !self.storage.needs_creation(disk).unwrap_or(true);
                        return Err(e);
                    }
                    disk.storage_was_created = true;
                }
            }
        }

        let (install_xml, final_xml) = self.build_xml(guest);
        if opts.return_xml {
            return Ok(InstallOutcome::Xml {
                install: install_xml,
                final_xml,
            });
        }
        if opts.dry {
            return Ok(InstallOutcome::DryRun);
        }

        let domain = self.create_guest(
            guest,
            install_xml.as_deref(),
            &final_xml,
            opts.doboot,
            opts.transient,
        )?;
        if self.autostart {
            Self::flag_autostart(&*domain)?;
        }
        Ok(InstallOutcome::Domain(domain))
    }

    /// Disks whose storage was created by this installer.
    pub fn get_created_disks(guest: &Guest) -> Vec<&DeviceDisk> {
        guest
            .disks
            .iter()
            .filter(|d| d.storage_was_created)
            .collect()
    }

    /// Remove every disk created during install. Failures are logged and
    /// returned, never raised, so one bad disk does not block the rest.
    pub fn cleanup_created_disks(&self, guest: &mut Guest) -> Vec<RollbackWarning> {
        let mut warnings = Vec::new();
        for disk in guest.disks.iter_mut().filter(|d| d.storage_was_created) {
            let name = disk
                .path
                .as_deref()
                .and_then(|p| p.file_name())
                .unwrap_or_default()
                .to_string();
            tracing::debug!("Removing created disk path={:?}", disk.path);
            match self.storage.delete(disk) {
                Ok(()) => disk.storage_was_created = false,
                Err(e) => {
                    tracing::error!("Failed to remove disk '{name}': {e:#}");
                    warnings.push(RollbackWarning {
                        path: disk.path.clone(),
                        message: format!("{e:#}"),
                    });
                }
            }
        }
        warnings
    }
}
