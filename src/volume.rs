//! Top-level format state machine.

use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::consts::{
    is_valid_sector_size, HIDDEN_VOLUME_HEADER_OFFSET, HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE,
    HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE_HIGH, MAX_FAT_SECTOR_COUNT, MAX_HIDDEN_VOLUME_HOST_SIZE, MAX_PIM_VALUE,
    MIN_HIDDEN_VOLUME_HOST_SIZE, TOTAL_VOLUME_HEADERS_SIZE, VOLUME_DATA_OFFSET, VOLUME_HEADER_EFFECTIVE_SIZE,
    VOLUME_HEADER_GROUP_SIZE, VOLUME_MIN_REQUIRED_PROGRAM_VERSION, VOLUME_SMALL_SIZE_THRESHOLD,
};
use crate::crypto::{CryptoContext, EncryptionAlgorithm};
use crate::device::{open_container, read_or_zero, seek_exact, HostTimestamps, VolumeDevice};
use crate::error::{FormatError, Result, Status};
use crate::fat::{StandardFatFormatter, FatFormatter};
use crate::formatter::{fill_data_area, fill_reserved_header_areas, write_fat_filesystem, DataArea};
use crate::header::{encode_header, HeaderBlock, HeaderParams};
use crate::host::{
    DeviceProvider, FilesystemFormatter, MountOptions, NoDevices, NoFilesystemFormatter, NoMounter, Notice,
    ProgressObserver, Unattended, UserPrompts, VolumeMounter,
};
use crate::prf::Prf;
use crate::secret::Password;
use crate::session::{FormatSession, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileSystem {
    #[default]
    None,
    Fat,
    Ntfs,
    ExFat,
    ReFs,
}

impl FileSystem {
    /// Created by the OS formatter on the mounted volume rather than written here.
    pub fn needs_os_formatter(self) -> bool {
        matches!(self, FileSystem::Ntfs | FileSystem::ExFat | FileSystem::ReFs)
    }
}

/// Everything the caller decides about a new volume.
#[derive(Debug, Clone)]
pub struct FormatRequest {
    pub path: PathBuf,
    pub is_device: bool,
    pub hidden: bool,
    /// Size of the outer volume's host; only read for hidden volumes.
    pub hidden_host_size: u64,
    /// Total volume size in bytes including headers.
    pub size: u64,
    pub algorithm: EncryptionAlgorithm,
    pub prf: Prf,
    pub pim: i32,
    pub password: Password,
    pub file_system: FileSystem,
    /// Sectors per cluster; 0 picks the default.
    pub cluster_size: u32,
    pub sector_size: u32,
    pub quick_format: bool,
    pub sparse_file: bool,
    /// Continue without asking when only shared device access is available.
    pub force: bool,
    pub drive_letter: Option<char>,
    pub header_flags: u32,
    pub preserve_timestamps: bool,
    pub interactive: bool,
}

impl FormatRequest {
    /// A container file with AES, SHA-512, PIM 0, 512-byte sectors and a full format.
    pub fn file(path: impl Into<PathBuf>, size: u64, password: Password) -> Self {
        FormatRequest {
            path: path.into(),
            is_device: false,
            hidden: false,
            hidden_host_size: 0,
            size,
            algorithm: EncryptionAlgorithm::Aes,
            prf: Prf::Sha512,
            pim: 0,
            password,
            file_system: FileSystem::None,
            cluster_size: 0,
            sector_size: 512,
            quick_format: false,
            sparse_file: false,
            force: false,
            drive_letter: None,
            header_flags: 0,
            preserve_timestamps: true,
            interactive: false,
        }
    }

    pub fn device(path: impl Into<PathBuf>, size: u64, password: Password) -> Self {
        FormatRequest { is_device: true, ..Self::file(path, size, password) }
    }

    /// Turns the request into a hidden volume of `self.size` bytes inside a host of `host_size` bytes.
    pub fn hidden_in(mut self, host_size: u64) -> Self {
        self.hidden = true;
        self.hidden_host_size = host_size;
        self
    }

    /// Rejects parameters that would otherwise only fail deep inside the header codec.
    pub fn validate(&self) -> Result<()> {
        if self.pim > MAX_PIM_VALUE {
            log::error!("PIM {} is above the maximum of {}", self.pim, MAX_PIM_VALUE);
            return Err(FormatError::ParameterIncorrect("PIM out of range"));
        }
        Ok(())
    }
}

/// Size of the encrypted data area of a volume of `volume_size` bytes.
///
/// Normal volumes lose both header groups. Hidden volumes only keep a small
/// tail free at the end of the host, larger above 2 GiB so their size stays
/// a multiple of every sector size. Returns 0 when nothing is left.
pub fn volume_data_area_size(hidden: bool, volume_size: u64) -> u64 {
    let reserved = if !hidden {
        TOTAL_VOLUME_HEADERS_SIZE
    } else if volume_size < VOLUME_SMALL_SIZE_THRESHOLD {
        HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE
    } else {
        HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE_HIGH
    };
    volume_size.saturating_sub(reserved)
}

/// Where everything goes on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub data_area_size: u64,
    /// Byte offset of the data area within the host.
    pub data_offset: u64,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub header_offset: u64,
    pub backup_header_offset: u64,
}

impl VolumeGeometry {
    pub fn compute(request: &FormatRequest) -> Result<Self> {
        let ss = request.sector_size as u64;
        if !is_valid_sector_size(request.sector_size) {
            return Err(FormatError::SectorSizeUnsupported(request.sector_size));
        }

        let (data_offset, header_offset, backup_header_offset) = if request.hidden {
            let host = request.hidden_host_size;
            if !(MIN_HIDDEN_VOLUME_HOST_SIZE..=MAX_HIDDEN_VOLUME_HOST_SIZE).contains(&host) {
                return Err(FormatError::VolumeSizeWrong { size: host });
            }
            let offset = host
                .checked_sub(VOLUME_HEADER_GROUP_SIZE)
                .and_then(|rest| rest.checked_sub(request.size))
                .ok_or(FormatError::VolumeSizeWrong { size: request.size })?;
            if offset % ss != 0 {
                log::error!("hidden volume data offset {} is not a multiple of {}", offset, ss);
                return Err(FormatError::VolumeSizeWrong { size: request.size });
            }
            (offset, HIDDEN_VOLUME_HEADER_OFFSET, host - HIDDEN_VOLUME_HEADER_OFFSET)
        } else {
            if request.size <= TOTAL_VOLUME_HEADERS_SIZE {
                return Err(FormatError::VolumeSizeWrong { size: request.size });
            }
            let data_area = volume_data_area_size(false, request.size);
            (VOLUME_DATA_OFFSET, 0, data_area + VOLUME_HEADER_GROUP_SIZE)
        };

        let data_area_size = volume_data_area_size(request.hidden, request.size);
        if data_area_size == 0 {
            return Err(FormatError::VolumeSizeWrong { size: request.size });
        }

        let geometry = VolumeGeometry {
            data_area_size,
            data_offset,
            start_sector: data_offset / ss,
            num_sectors: data_area_size / ss,
            header_offset,
            backup_header_offset,
        };
        log::debug!("{:?}", geometry);
        Ok(geometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatStage {
    GeometryComputed,
    DeviceAttached,
    FileCreated,
    HeaderWritten,
    DataAreaFilled,
    BackupHeaderWritten,
    DecoyHeadersWritten,
    FilesystemFormatted,
    FilesystemFormatFailed,
    Done,
}

/// What a successful format did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatReport {
    pub stages: Vec<FormatStage>,
    pub file_system: FileSystem,
    pub quick_format: bool,
    /// Cluster size in bytes when a FAT filesystem was written.
    pub fat_cluster_size: Option<u32>,
    pub data_area_size: u64,
    pub data_offset: u64,
    /// Data area passes that wrote random data.
    pub fill_passes: u32,
    pub fat_fallback: bool,
}

impl FormatReport {
    fn enter(&mut self, stage: FormatStage) {
        log::debug!("format stage {:?}", stage);
        self.stages.push(stage);
    }
}

/// Collaborators of the format engine. `Default` gives a file-only, unattended setup.
pub struct FormatHooks {
    pub devices: Box<dyn DeviceProvider>,
    pub mounter: Box<dyn VolumeMounter>,
    pub fs_formatter: Box<dyn FilesystemFormatter>,
    pub fat: Box<dyn FatFormatter>,
    pub prompts: Box<dyn UserPrompts>,
    pub progress: Box<dyn ProgressObserver>,
}

impl Default for FormatHooks {
    fn default() -> Self {
        FormatHooks {
            devices: Box::new(NoDevices),
            mounter: Box::new(NoMounter),
            fs_formatter: Box::new(NoFilesystemFormatter),
            fat: Box::new(StandardFatFormatter),
            prompts: Box::new(Unattended),
            progress: Box::new(()),
        }
    }
}

/// Per-pass parameters. The FAT retry changes them and runs another pass.
#[derive(Debug, Clone, Copy)]
struct Pass {
    file_system: FileSystem,
    quick: bool,
    cluster_size: u32,
    retry: bool,
}

enum Completion {
    Done,
    RetryFat,
}

/// An open host. Dropping it syncs, truncates a failed container and puts
/// captured timestamps back.
struct AttachedHost {
    device: Box<dyn VolumeDevice>,
    truncate_on_failure: bool,
    timestamps: Option<HostTimestamps>,
    succeeded: bool,
}

impl Drop for AttachedHost {
    fn drop(&mut self) {
        // Hidden hosts and devices are never truncated.
        if !self.succeeded && self.truncate_on_failure {
            log::info!("format failed, truncating container");
            let truncated = seek_exact(self.device.as_mut(), 0)
                .and_then(|_| self.device.set_len(0).map_err(|e| FormatError::io("truncate", e)));
            if let Err(e) = truncated {
                log::warn!("could not truncate container: {}", e);
            }
        }
        if let Err(e) = self.device.sync() {
            log::warn!("could not flush host: {}", e);
        }
        if let Some(times) = self.timestamps {
            if let Err(e) = self.device.restore_timestamps(times) {
                log::warn!("could not restore host timestamps: {}", e);
            }
        }
    }
}

pub struct VolumeFormatter {
    session: FormatSession,
    hooks: FormatHooks,
}

impl VolumeFormatter {
    pub fn new(session: FormatSession, hooks: FormatHooks) -> Self {
        VolumeFormatter { session, hooks }
    }

    pub fn hooks_mut(&mut self) -> &mut FormatHooks {
        &mut self.hooks
    }

    /// Creates the volume described by `request`.
    pub fn format(&mut self, request: &FormatRequest) -> Result<FormatReport> {
        log::info!(
            "formatting {} ({} bytes, {}, {})",
            request.path.display(),
            request.size,
            request.algorithm.name(),
            request.prf.name()
        );
        request.validate()?;
        let geometry = VolumeGeometry::compute(request)?;
        let mut report = FormatReport {
            stages: Vec::new(),
            file_system: request.file_system,
            quick_format: request.quick_format || request.hidden,
            fat_cluster_size: None,
            data_area_size: geometry.data_area_size,
            data_offset: geometry.data_offset,
            fill_passes: 0,
            fat_fallback: false,
        };
        report.enter(FormatStage::GeometryComputed);

        let params = HeaderParams {
            algorithm: request.algorithm,
            prf: request.prf,
            password: Some(&request.password),
            pim: request.pim,
            boot: false,
            volume_size: geometry.data_area_size,
            hidden_volume_size: if request.hidden { geometry.data_area_size } else { 0 },
            encrypted_area_start: geometry.data_offset,
            encrypted_area_length: geometry.data_area_size,
            required_program_version: VOLUME_MIN_REQUIRED_PROGRAM_VERSION,
            header_flags: request.header_flags,
            sector_size: request.sector_size,
        };
        // One header and one master key for every pass, the FAT retry included.
        let (header, mut ctx) = encode_header(&params, None, self.session.rng())?;
        if request.hidden {
            ctx.hidden_volume_offset = geometry.data_offset;
        }

        let mut pass = Pass {
            file_system: request.file_system,
            // The host's data area was filled when the outer volume was created.
            quick: report.quick_format,
            cluster_size: request.cluster_size,
            retry: false,
        };
        loop {
            self.run_pass(request, &geometry, &params, &header, &mut ctx, pass, &mut report)?;
            match self.complete_filesystem(request, &geometry, pass, &mut report)? {
                Completion::Done => break,
                Completion::RetryFat => {
                    log::info!("retrying with FAT on the already formatted volume");
                    pass = Pass { file_system: FileSystem::Fat, quick: true, cluster_size: 0, retry: true };
                    report.fat_fallback = true;
                    report.file_system = FileSystem::Fat;
                    report.quick_format = true;
                    report.enter(FormatStage::GeometryComputed);
                }
            }
        }

        report.enter(FormatStage::Done);
        log::info!("volume {} created", request.path.display());
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        &mut self,
        request: &FormatRequest,
        geometry: &VolumeGeometry,
        params: &HeaderParams<'_>,
        header: &HeaderBlock,
        ctx: &mut CryptoContext,
        pass: Pass,
        report: &mut FormatReport,
    ) -> Result<()> {
        // The host guard drops at the end of this closure, before the device is released.
        let result = self.attach(request, geometry, pass, report).and_then(|mut host| {
            let written = self.write_volume(request, geometry, params, header, ctx, pass, host.device.as_mut(), report);
            host.succeeded = written.is_ok();
            written
        });
        if request.is_device {
            self.hooks.devices.release(&request.path);
        }
        if let Err(e) = &result {
            log::error!("format of {} failed: {}", request.path.display(), e);
        }
        result
    }

    fn attach(
        &mut self,
        request: &FormatRequest,
        geometry: &VolumeGeometry,
        pass: Pass,
        report: &mut FormatReport,
    ) -> Result<AttachedHost> {
        // Hidden volumes and retries write into a host that must not be recreated.
        let existing = request.hidden || pass.retry;

        if request.is_device {
            let opened = self.hooks.devices.open_device(&request.path, existing)?;
            if opened.shared_access && !request.force && !self.hooks.prompts.confirm_shared_access() {
                log::warn!("{} is only available for shared access", request.path.display());
                return Err(FormatError::DontReport("shared device access declined"));
            }
            report.enter(FormatStage::DeviceAttached);
            return Ok(AttachedHost { device: opened.device, truncate_on_failure: false, timestamps: None, succeeded: false });
        }

        let file = open_container(&request.path, existing)?;
        let mut host =
            AttachedHost { device: Box::new(file), truncate_on_failure: !request.hidden, timestamps: None, succeeded: false };

        if !existing {
            let len = geometry.data_area_size + VOLUME_HEADER_GROUP_SIZE;
            let sparse = request.sparse_file && pass.quick;
            if request.sparse_file && !sparse {
                log::warn!("sparse containers need quick format; preallocating instead");
            }
            host.device.preallocate(len, sparse).map_err(|e| FormatError::io("preallocate volume file", e))?;
            seek_exact(host.device.as_mut(), 0)?;
            log::debug!("container preallocated to {} bytes (sparse: {})", len, sparse);
        }

        // Put back on drop so the host shows no sign of the write.
        if request.hidden && request.preserve_timestamps {
            host.timestamps = host.device.timestamps().unwrap_or_else(|e| {
                log::warn!("could not read host timestamps: {}", e);
                None
            });
        }
        report.enter(FormatStage::FileCreated);
        Ok(host)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_volume(
        &mut self,
        request: &FormatRequest,
        geometry: &VolumeGeometry,
        params: &HeaderParams<'_>,
        header: &HeaderBlock,
        ctx: &mut CryptoContext,
        pass: Pass,
        device: &mut dyn VolumeDevice,
        report: &mut FormatReport,
    ) -> Result<()> {
        let ss = request.sector_size;

        if pass.retry {
            // The header from the first pass is already in place.
            seek_exact(device, VOLUME_DATA_OFFSET)?;
        } else {
            seek_exact(device, geometry.header_offset)?;
            write_effective_header(device, header, ss, request.is_device)?;
            if !request.is_device && !request.hidden {
                // Reserve the rest of the group now; it is overwritten with random data later.
                let zeros = vec![0u8; (VOLUME_HEADER_GROUP_SIZE as usize) - VOLUME_HEADER_EFFECTIVE_SIZE];
                device.write_all(&zeros).map_err(|e| FormatError::io("write header padding", e))?;
            }
            report.enter(FormatStage::HeaderWritten);
        }

        let area = DataArea {
            start_sector: geometry.start_sector,
            num_sectors: geometry.num_sectors,
            on_device: request.is_device,
        };
        let progress = self.hooks.progress.as_mut();
        match pass.file_system {
            FileSystem::Fat => {
                if geometry.num_sectors >= MAX_FAT_SECTOR_COUNT {
                    return Err(FormatError::VolumeSizeWrong { size: geometry.data_area_size });
                }
                let (fat, _) = write_fat_filesystem(
                    &mut self.session,
                    device,
                    ctx,
                    area,
                    pass.quick,
                    self.hooks.fat.as_ref(),
                    pass.cluster_size,
                    progress,
                )?;
                report.fat_cluster_size = Some(fat.cluster_size_bytes());
            }
            FileSystem::None | FileSystem::Ntfs | FileSystem::ExFat | FileSystem::ReFs => {
                fill_data_area(&mut self.session, device, ctx, area, pass.quick, progress)?;
            }
        }
        if !pass.quick {
            report.fill_passes += 1;
        }
        report.enter(FormatStage::DataAreaFilled);

        // Same master key, fresh salt.
        seek_exact(device, geometry.backup_header_offset)?;
        let (backup, _) = encode_header(params, Some(ctx.master_keydata()), self.session.rng())?;
        write_effective_header(device, &backup, ss, request.is_device)?;
        report.enter(FormatStage::BackupHeaderWritten);

        // A hidden volume lives inside a host that already has these areas.
        if !request.hidden {
            fill_reserved_header_areas(&mut self.session, device, ctx, geometry.data_area_size)?;

            let decoy = HeaderParams {
                password: None,
                pim: 0,
                volume_size: geometry.data_area_size,
                hidden_volume_size: geometry.data_area_size,
                ..*params
            };
            // Random headers in the hidden slots of both header groups.
            let backup_group = geometry.data_area_size + VOLUME_HEADER_GROUP_SIZE;
            for offset in [HIDDEN_VOLUME_HEADER_OFFSET, backup_group + HIDDEN_VOLUME_HEADER_OFFSET] {
                let (block, _) = encode_header(&decoy, None, self.session.rng())?;
                seek_exact(device, offset)?;
                write_effective_header(device, &block, ss, request.is_device)?;
            }
            report.enter(FormatStage::DecoyHeadersWritten);
        }
        Ok(())
    }

    /// Runs the OS formatter for filesystems that need a mounted volume.
    fn complete_filesystem(
        &mut self,
        request: &FormatRequest,
        geometry: &VolumeGeometry,
        pass: Pass,
        report: &mut FormatReport,
    ) -> Result<Completion> {
        if !pass.file_system.needs_os_formatter() {
            return Ok(Completion::Done);
        }

        let drive = request
            .drive_letter
            .filter(char::is_ascii_alphabetic)
            .map(|c| c.to_ascii_uppercase())
            .or_else(|| self.hooks.mounter.last_available_drive())
            .ok_or(FormatError::NoFreeDrives)?;
        let options = MountOptions {
            read_only: false,
            removable: false,
            protect_hidden_volume: false,
            preserve_timestamps: request.preserve_timestamps,
            use_backup_header: false,
        };
        self.hooks
            .mounter
            .mount(drive, &request.path, &request.password, request.prf, request.pim, &options)
            .map_err(|e| {
                log::error!("could not mount {} as {}: {}", request.path.display(), drive, e);
                FormatError::MountFailed
            })?;

        // The volume is unmounted whatever the formatter returned.
        let formatted = self.hooks.fs_formatter.format_filesystem(drive, pass.cluster_size, pass.file_system);
        if !self.hooks.mounter.unmount(drive) {
            self.hooks.prompts.notify(Notice::CannotDismount(drive));
        }
        if formatted {
            report.enter(FormatStage::FilesystemFormatted);
            return Ok(Completion::Done);
        }

        report.enter(FormatStage::FilesystemFormatFailed);
        log::warn!("{:?} format of drive {} failed", pass.file_system, drive);
        let fits_fat = geometry.data_area_size <= MAX_FAT_SECTOR_COUNT * request.sector_size as u64;
        if fits_fat && !request.hidden && request.interactive {
            if self.hooks.prompts.ask_fat_fallback() {
                return Ok(Completion::RetryFat);
            }
            // The prompt already told the user the format failed.
            return Err(FormatError::DontReport("FAT fallback declined"));
        }
        // No retry was offered, so this is the only message the user gets.
        self.hooks.prompts.notify(Notice::FilesystemFormatFailed);
        Err(FormatError::DontReport("filesystem format failed"))
    }
}

/// Writes one header at the current position. Raw devices only take whole
/// sectors, so the rest of the sector is read back and rewritten unchanged.
fn write_effective_header(
    device: &mut dyn VolumeDevice,
    header: &HeaderBlock,
    sector_size: u32,
    is_device: bool,
) -> Result<()> {
    if !is_device || sector_size as usize == VOLUME_HEADER_EFFECTIVE_SIZE {
        return device.write_all(header).map_err(|e| FormatError::io("write volume header", e));
    }
    let offset = device.stream_position().map_err(|e| FormatError::io("seek", e))?;
    let mut sector = Zeroizing::new(vec![0u8; sector_size as usize]);
    read_or_zero(device, &mut sector)?;
    sector[..VOLUME_HEADER_EFFECTIVE_SIZE].copy_from_slice(header);
    seek_exact(device, offset)?;
    device.write_all(&sector).map_err(|e| FormatError::io("write volume header", e))
}

/// Formats a volume with the default session and returns the numeric status.
pub fn format_volume(request: &FormatRequest, hooks: FormatHooks) -> Status {
    let result = FormatSession::new(SessionConfig::default())
        .and_then(|session| VolumeFormatter::new(session, hooks).format(request))
        .map(|_| ());
    Status::from(result)
}
