//! Narrow interfaces to everything outside the format engine: raw devices,
//! the mount subsystem, OS filesystem formatters, the UI and progress display.

use std::path::Path;

use crate::device::VolumeDevice;
use crate::error::{FormatError, Result};
use crate::prf::Prf;
use crate::secret::Password;
use crate::volume::FileSystem;

/// A raw device opened for formatting.
pub struct OpenedDevice {
    pub device: Box<dyn VolumeDevice>,
    /// The provider fell back to shared access because exclusive access was refused.
    pub shared_access: bool,
}

/// Opens raw devices (partitions, disks). Dismounting a live filesystem,
/// extended DASD access and the exclusive-then-shared retry are its business.
pub trait DeviceProvider {
    /// `existing_layout` is set for hidden volumes and the FAT retry pass.
    fn open_device(&mut self, path: &Path, existing_layout: bool) -> Result<OpenedDevice>;

    /// Tears down any temporary device name created by `open_device`.
    fn release(&mut self, _path: &Path) {}
}

/// Rejects device-hosted requests.
#[derive(Debug, Default)]
pub struct NoDevices;

impl DeviceProvider for NoDevices {
    fn open_device(&mut self, path: &Path, _existing_layout: bool) -> Result<OpenedDevice> {
        log::error!("no device provider configured for {}", path.display());
        Err(FormatError::ParameterIncorrect("device-hosted volumes need a device provider"))
    }
}

/// Mount options used to verify a freshly created volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub removable: bool,
    pub protect_hidden_volume: bool,
    pub preserve_timestamps: bool,
    pub use_backup_header: bool,
}

pub trait VolumeMounter {
    /// Highest free drive letter, if any.
    fn last_available_drive(&self) -> Option<char>;

    fn mount(
        &mut self,
        drive: char,
        path: &Path,
        password: &Password,
        prf: Prf,
        pim: i32,
        options: &MountOptions,
    ) -> std::io::Result<()>;

    fn unmount(&mut self, drive: char) -> bool;
}

#[derive(Debug, Default)]
pub struct NoMounter;

impl VolumeMounter for NoMounter {
    fn last_available_drive(&self) -> Option<char> {
        None
    }

    fn mount(&mut self, _: char, _: &Path, _: &Password, _: Prf, _: i32, _: &MountOptions) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no mount subsystem"))
    }

    fn unmount(&mut self, _drive: char) -> bool {
        false
    }
}

/// OS quick-format of a mounted volume (NTFS, exFAT, ReFS).
pub trait FilesystemFormatter {
    fn format_filesystem(&mut self, drive: char, cluster_size: u32, fs: FileSystem) -> bool;
}

#[derive(Debug, Default)]
pub struct NoFilesystemFormatter;

impl FilesystemFormatter for NoFilesystemFormatter {
    fn format_filesystem(&mut self, _drive: char, _cluster_size: u32, _fs: FileSystem) -> bool {
        false
    }
}

/// Things the engine tells the user about without failing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The OS formatter failed and the FAT fallback is not available.
    FilesystemFormatFailed,
    /// The volume stayed mounted after formatting.
    CannotDismount(char),
}

/// Decision points of the format state machine that need a human.
pub trait UserPrompts {
    /// Exclusive access was refused; continue with shared access?
    fn confirm_shared_access(&mut self) -> bool {
        false
    }

    /// The OS formatter failed; format as FAT instead?
    fn ask_fat_fallback(&mut self) -> bool {
        false
    }

    fn notify(&mut self, _notice: Notice) {}
}

/// Declines every question.
#[derive(Debug, Default)]
pub struct Unattended;

impl UserPrompts for Unattended {
    fn notify(&mut self, notice: Notice) {
        log::warn!("{:?}", notice);
    }
}

/// Receives fill progress. Returning `true` cancels the fill.
pub trait ProgressObserver {
    fn report(&mut self, bytes_done: u64) -> bool;
}

impl ProgressObserver for () {
    fn report(&mut self, _bytes_done: u64) -> bool {
        false
    }
}

impl<F: FnMut(u64) -> bool> ProgressObserver for F {
    fn report(&mut self, bytes_done: u64) -> bool {
        self(bytes_done)
    }
}
