use byteorder::{ByteOrder, LittleEndian};

use crate::consts::MAX_FAT_SECTOR_COUNT;
use crate::error::{FormatError, Result};

/// Receives plaintext sectors in order. The format engine encrypts them on the way to disk.
pub trait SectorSink {
    fn write_sector(&mut self, sector: &[u8]) -> Result<()>;
}

/// FAT variant. The data cluster count alone decides which one a volume is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Fewest clusters a FAT16 volume may have; below this it is FAT12.
pub const FAT16_MIN_CLUSTERS: u64 = 4085;
/// Fewest clusters a FAT32 volume may have; below this it is FAT16.
pub const FAT32_MIN_CLUSTERS: u64 = 65525;
/// Cluster numbers from 0x0FFFFFF5 up are reserved on FAT32.
const FAT32_MAX_CLUSTERS: u64 = 0x0FFF_FFF4;

impl FatType {
    pub fn for_clusters(clusters: u64) -> FatType {
        if clusters < FAT16_MIN_CLUSTERS {
            FatType::Fat12
        } else if clusters < FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    fn entry_bits(self) -> u64 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    fn max_clusters(self) -> u64 {
        match self {
            FatType::Fat12 => FAT16_MIN_CLUSTERS - 1,
            FatType::Fat16 => FAT32_MIN_CLUSTERS - 1,
            FatType::Fat32 => FAT32_MAX_CLUSTERS,
        }
    }

    /// Filesystem type string stored in the boot sector.
    pub fn label(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

/// Layout of a FAT filesystem inside the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatParams {
    pub fat_type: FatType,
    pub sector_size: u32,
    /// Sectors covered by the filesystem. Can be a little short of the data
    /// area when the cluster count has to stay inside the range of `fat_type`.
    pub total_sectors: u64,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    pub fat_sectors: u32,
    /// Fixed root directory region; 0 on FAT32.
    pub root_dir_sectors: u32,
    pub volume_id: u32,
}

impl FatParams {
    pub fn cluster_size_bytes(&self) -> u32 {
        self.sectors_per_cluster * self.sector_size
    }

    pub fn first_data_sector(&self) -> u64 {
        self.reserved_sectors as u64 + self.fat_count as u64 * self.fat_sectors as u64 + self.root_dir_sectors as u64
    }

    /// Sectors that have to be written for an empty filesystem.
    pub fn metadata_sectors(&self) -> u64 {
        match self.fat_type {
            // The FAT32 root directory is cluster 2, the first data cluster.
            FatType::Fat32 => self.first_data_sector() + self.sectors_per_cluster as u64,
            FatType::Fat12 | FatType::Fat16 => self.first_data_sector(),
        }
    }

    pub fn data_clusters(&self) -> u64 {
        self.total_sectors.saturating_sub(self.first_data_sector()) / self.sectors_per_cluster as u64
    }
}

/// Builds FAT geometry and produces its metadata sectors.
pub trait FatFormatter {
    /// `cluster_size` is in sectors; 0 picks a default for the volume size.
    fn build_geometry(&self, total_sectors: u64, sector_size: u32, cluster_size: u32, volume_id: u32)
        -> Result<FatParams>;

    /// Streams sectors `0..params.metadata_sectors()` of the filesystem into `sink`.
    fn write_filesystem(&self, params: &FatParams, sink: &mut dyn SectorSink) -> Result<()>;
}

/// FAT12, FAT16 or FAT32, whichever the cluster count calls for, with an empty root directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFatFormatter;

const FAT32_RESERVED_SECTORS: u32 = 32;
const FAT16_RESERVED_SECTORS: u32 = 1;
const ROOT_DIR_ENTRIES: u32 = 512;
const DIR_ENTRY_SIZE: u32 = 32;
const FAT_COUNT: u32 = 2;
const FS_INFO_SECTOR: u64 = 1;
const BACKUP_BOOT_SECTOR: u64 = 6;
const MEDIA_FIXED_DISK: u8 = 0xF8;

fn default_cluster_bytes(data_bytes: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    match data_bytes {
        b if b <= 260 * MIB => 512,
        b if b <= 8 * 1024 * MIB => 4096,
        b if b <= 16 * 1024 * MIB => 8192,
        b if b <= 32 * 1024 * MIB => 16384,
        _ => 32768,
    }
}

/// Sizes of every region for one FAT variant.
struct Layout {
    fat_type: FatType,
    total_sectors: u64,
    reserved_sectors: u32,
    root_dir_sectors: u32,
    fat_sectors: u64,
}

impl Layout {
    fn compute(fat_type: FatType, total_sectors: u64, sector_size: u32, sectors_per_cluster: u32) -> Self {
        let (reserved_sectors, root_dir_sectors) = match fat_type {
            FatType::Fat32 => (FAT32_RESERVED_SECTORS, 0),
            FatType::Fat12 | FatType::Fat16 => {
                (FAT16_RESERVED_SECTORS, (ROOT_DIR_ENTRIES * DIR_ENTRY_SIZE).div_ceil(sector_size))
            }
        };
        // Two reserved entries plus one per cluster. Sizing the FAT from the
        // sectors before it overestimates slightly, which is harmless.
        let approx_clusters =
            total_sectors.saturating_sub(reserved_sectors as u64 + root_dir_sectors as u64) / sectors_per_cluster as u64;
        let fat_bytes = ((approx_clusters + 2) * fat_type.entry_bits()).div_ceil(8);
        Layout {
            fat_type,
            total_sectors,
            reserved_sectors,
            root_dir_sectors,
            fat_sectors: fat_bytes.div_ceil(sector_size as u64),
        }
    }

    /// Like [`Layout::compute`], shrinking the filesystem until the cluster
    /// count is no longer too large for `fat_type`.
    fn fitted(fat_type: FatType, mut total_sectors: u64, sector_size: u32, sectors_per_cluster: u32) -> Self {
        loop {
            let layout = Self::compute(fat_type, total_sectors, sector_size, sectors_per_cluster);
            let clusters = layout.clusters(sectors_per_cluster);
            if clusters <= fat_type.max_clusters() {
                return layout;
            }
            total_sectors -= (clusters - fat_type.max_clusters()) * sectors_per_cluster as u64;
        }
    }

    fn clusters(&self, sectors_per_cluster: u32) -> u64 {
        let first_data = self.reserved_sectors as u64 + FAT_COUNT as u64 * self.fat_sectors + self.root_dir_sectors as u64;
        self.total_sectors.saturating_sub(first_data) / sectors_per_cluster as u64
    }
}

impl FatFormatter for StandardFatFormatter {
    fn build_geometry(
        &self,
        total_sectors: u64,
        sector_size: u32,
        cluster_size: u32,
        volume_id: u32,
    ) -> Result<FatParams> {
        let too_big = || FormatError::VolumeSizeWrong { size: total_sectors * sector_size as u64 };
        if total_sectors >= MAX_FAT_SECTOR_COUNT {
            return Err(too_big());
        }
        let sectors_per_cluster = match cluster_size {
            0 => (default_cluster_bytes(total_sectors * sector_size as u64) / sector_size as u64).max(1) as u32,
            n => n,
        };
        if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128 {
            return Err(FormatError::ParameterIncorrect("cluster size must be a power of two up to 128 sectors"));
        }

        // FAT32 carries the most overhead, so if it still reaches its minimum
        // cluster count the volume is FAT32.
        let fat32 = Layout::compute(FatType::Fat32, total_sectors, sector_size, sectors_per_cluster);
        let layout = if fat32.clusters(sectors_per_cluster) >= FAT32_MIN_CLUSTERS {
            if fat32.clusters(sectors_per_cluster) > FAT32_MAX_CLUSTERS {
                return Err(FormatError::ParameterIncorrect("cluster size too small for a FAT32 volume this large"));
            }
            fat32
        } else {
            let fat16 = Layout::fitted(FatType::Fat16, total_sectors, sector_size, sectors_per_cluster);
            if fat16.clusters(sectors_per_cluster) >= FAT16_MIN_CLUSTERS {
                fat16
            } else {
                Layout::fitted(FatType::Fat12, total_sectors, sector_size, sectors_per_cluster)
            }
        };

        let params = FatParams {
            fat_type: layout.fat_type,
            sector_size,
            total_sectors: layout.total_sectors,
            sectors_per_cluster,
            reserved_sectors: layout.reserved_sectors,
            fat_count: FAT_COUNT,
            fat_sectors: u32::try_from(layout.fat_sectors).map_err(|_| too_big())?,
            root_dir_sectors: layout.root_dir_sectors,
            volume_id,
        };
        if params.metadata_sectors() + sectors_per_cluster as u64 > params.total_sectors {
            return Err(too_big());
        }
        debug_assert_eq!(FatType::for_clusters(params.data_clusters()), params.fat_type);
        log::debug!(
            "{:?} geometry: {} of {} sectors, {} per cluster, {} per FAT, {} clusters",
            params.fat_type,
            params.total_sectors,
            total_sectors,
            sectors_per_cluster,
            params.fat_sectors,
            params.data_clusters()
        );
        Ok(params)
    }

    fn write_filesystem(&self, params: &FatParams, sink: &mut dyn SectorSink) -> Result<()> {
        let ss = params.sector_size as usize;
        let boot = boot_sector(params);
        let fs_info = fs_info_sector(params);
        let fat32 = params.fat_type == FatType::Fat32;
        let fat1 = params.reserved_sectors as u64;
        let fat2 = fat1 + params.fat_sectors as u64;

        let mut sector = vec![0u8; ss];
        for index in 0..params.metadata_sectors() {
            sector.fill(0);
            match index {
                0 => sector[..512].copy_from_slice(&boot),
                BACKUP_BOOT_SECTOR if fat32 => sector[..512].copy_from_slice(&boot),
                FS_INFO_SECTOR if fat32 => sector[..512].copy_from_slice(&fs_info),
                i if i == fat1 || i == fat2 => write_fat_head(params.fat_type, &mut sector),
                // Remaining FAT sectors, the root directory and the FAT32 root cluster stay empty.
                _ => {}
            }
            sink.write_sector(&sector)?;
        }
        Ok(())
    }
}

/// First entries of each FAT: media descriptor and end-of-chain markers.
fn write_fat_head(fat_type: FatType, sector: &mut [u8]) {
    match fat_type {
        FatType::Fat12 => sector[0..3].copy_from_slice(&[MEDIA_FIXED_DISK, 0xFF, 0xFF]),
        FatType::Fat16 => sector[0..4].copy_from_slice(&[MEDIA_FIXED_DISK, 0xFF, 0xFF, 0xFF]),
        FatType::Fat32 => {
            LittleEndian::write_u32(&mut sector[0..4], 0x0FFF_FF00 | MEDIA_FIXED_DISK as u32);
            LittleEndian::write_u32(&mut sector[4..8], 0x0FFF_FFFF);
            // Cluster 2 holds the root directory and ends its own chain.
            LittleEndian::write_u32(&mut sector[8..12], 0x0FFF_FFFF);
        }
    }
}

fn boot_sector(p: &FatParams) -> [u8; 512] {
    let mut b = [0u8; 512];
    let fat32 = p.fat_type == FatType::Fat32;

    // Jump over the BPB, then the OEM name.
    b[0..3].copy_from_slice(&[0xEB, if fat32 { 0x58 } else { 0x3C }, 0x90]);
    b[3..11].copy_from_slice(b"MSDOS5.0");

    LittleEndian::write_u16(&mut b[11..13], p.sector_size as u16);
    b[13] = p.sectors_per_cluster as u8;
    LittleEndian::write_u16(&mut b[14..16], p.reserved_sectors as u16);
    b[16] = p.fat_count as u8;
    if !fat32 {
        LittleEndian::write_u16(&mut b[17..19], ROOT_DIR_ENTRIES as u16);
    }
    // The 16-bit sector count is only used when it fits and never on FAT32.
    if !fat32 && p.total_sectors < 0x1_0000 {
        LittleEndian::write_u16(&mut b[19..21], p.total_sectors as u16);
    } else {
        LittleEndian::write_u32(&mut b[32..36], p.total_sectors as u32);
    }
    b[21] = MEDIA_FIXED_DISK;
    if !fat32 {
        LittleEndian::write_u16(&mut b[22..24], p.fat_sectors as u16);
    }
    // Nominal geometry.
    LittleEndian::write_u16(&mut b[24..26], 32);
    LittleEndian::write_u16(&mut b[26..28], 64);

    let ext = if fat32 {
        LittleEndian::write_u32(&mut b[36..40], p.fat_sectors);
        // Root directory cluster, FSInfo sector, backup boot sector.
        LittleEndian::write_u32(&mut b[44..48], 2);
        LittleEndian::write_u16(&mut b[48..50], FS_INFO_SECTOR as u16);
        LittleEndian::write_u16(&mut b[50..52], BACKUP_BOOT_SECTOR as u16);
        64
    } else {
        36
    };

    // Extended BPB: drive number, signature, serial, label, type.
    b[ext] = 0x80;
    b[ext + 2] = 0x29;
    LittleEndian::write_u32(&mut b[ext + 3..ext + 7], p.volume_id);
    b[ext + 7..ext + 18].copy_from_slice(b"NO NAME    ");
    b[ext + 18..ext + 26].copy_from_slice(p.fat_type.label());

    b[510] = 0x55;
    b[511] = 0xAA;
    b
}

fn fs_info_sector(p: &FatParams) -> [u8; 512] {
    let mut s = [0u8; 512];
    LittleEndian::write_u32(&mut s[0..4], 0x4161_5252);
    LittleEndian::write_u32(&mut s[484..488], 0x6141_7272);
    // Every data cluster except the root directory is free.
    let free = p.data_clusters().saturating_sub(1).min(u32::MAX as u64) as u32;
    LittleEndian::write_u32(&mut s[488..492], free);
    LittleEndian::write_u32(&mut s[492..496], 3);
    LittleEndian::write_u32(&mut s[508..512], 0xAA55_0000);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<Vec<u8>>);

    impl SectorSink for Collect {
        fn write_sector(&mut self, sector: &[u8]) -> Result<()> {
            self.0.push(sector.to_vec());
            Ok(())
        }
    }

    fn collect(p: &FatParams) -> Vec<Vec<u8>> {
        let mut sink = Collect(Vec::new());
        StandardFatFormatter.write_filesystem(p, &mut sink).unwrap();
        assert_eq!(sink.0.len() as u64, p.metadata_sectors());
        sink.0
    }

    #[test]
    fn ten_mib_volume_is_fat16() {
        // 10 MiB volume minus 256 KiB of headers.
        let sectors = (10 * 1024 * 1024 - 256 * 1024) / 512;
        let p = StandardFatFormatter.build_geometry(sectors, 512, 0, 0xdead_beef).unwrap();
        assert_eq!(p.fat_type, FatType::Fat16);
        assert_eq!(p.cluster_size_bytes(), 512);
        assert_eq!(p.reserved_sectors, 1);
        assert_eq!(p.root_dir_sectors, 32);
        assert_eq!(p.total_sectors, sectors);
        assert!((FAT16_MIN_CLUSTERS..FAT32_MIN_CLUSTERS).contains(&p.data_clusters()));
        assert!((p.data_clusters() + 2) * 2 <= p.fat_sectors as u64 * 512);

        let sectors = collect(&p);
        let boot = &sectors[0];
        assert_eq!(&boot[54..62], b"FAT16   ");
        assert_eq!(LittleEndian::read_u16(&boot[17..19]), 512);
        assert_eq!(LittleEndian::read_u16(&boot[19..21]) as u64, p.total_sectors);
        assert_eq!(LittleEndian::read_u16(&boot[22..24]) as u32, p.fat_sectors);
        assert_eq!(LittleEndian::read_u32(&boot[39..43]), 0xdead_beef);
        assert_eq!(&sectors[1][..4], &[0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn cluster_count_decides_the_type() {
        for (sectors, spc, expected) in [
            (8_000u64, 8u32, FatType::Fat12),
            (40_000, 1, FatType::Fat16),
            (200_000, 1, FatType::Fat32),
            (2_000_000, 0, FatType::Fat32),
        ] {
            let p = StandardFatFormatter.build_geometry(sectors, 512, spc, 1).unwrap();
            assert_eq!(p.fat_type, expected, "{sectors} sectors");
            assert_eq!(FatType::for_clusters(p.data_clusters()), expected);
            assert!(p.total_sectors <= sectors);
        }
    }

    #[test]
    fn never_fat32_below_its_cluster_minimum() {
        // Sweep across the band where FAT16 would overflow but FAT32 falls short.
        for sectors in (65_500u64..67_500).step_by(7) {
            let p = StandardFatFormatter.build_geometry(sectors, 512, 1, 0).unwrap();
            let clusters = p.data_clusters();
            match p.fat_type {
                FatType::Fat32 => assert!(clusters >= FAT32_MIN_CLUSTERS, "{sectors}"),
                FatType::Fat16 => assert!(clusters < FAT32_MIN_CLUSTERS, "{sectors}"),
                FatType::Fat12 => panic!("FAT12 for {sectors} sectors"),
            }
        }
    }

    #[test]
    fn fat32_metadata_sectors_have_expected_structures() {
        let p = StandardFatFormatter.build_geometry(600_000, 1024, 8, 7).unwrap();
        assert_eq!(p.fat_type, FatType::Fat32);
        let sectors = collect(&p);

        assert!(sectors.iter().all(|s| s.len() == 1024));
        let boot = &sectors[0];
        assert_eq!(LittleEndian::read_u16(&boot[11..13]), 1024);
        assert_eq!(boot[13], 8);
        assert_eq!(&boot[82..90], b"FAT32   ");
        assert_eq!(&boot[510..512], &[0x55, 0xAA]);
        assert_eq!(LittleEndian::read_u32(&boot[67..71]), 7);
        assert_eq!(sectors[6], sectors[0]);
        assert_eq!(LittleEndian::read_u32(&sectors[1][0..4]), 0x4161_5252);

        let fat1 = &sectors[p.reserved_sectors as usize];
        let fat2 = &sectors[(p.reserved_sectors + p.fat_sectors) as usize];
        assert_eq!(fat1, fat2);
        assert_eq!(LittleEndian::read_u32(&fat1[0..4]), 0x0FFF_FFF8);
        assert!(sectors.last().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn fat12_has_no_fs_info() {
        let p = StandardFatFormatter.build_geometry(8_000, 512, 8, 0).unwrap();
        let sectors = collect(&p);
        assert_eq!(&sectors[0][54..62], b"FAT12   ");
        assert_eq!(&sectors[1][..3], &[0xF8, 0xFF, 0xFF]);
        assert_eq!(sectors[1][3], 0);
        assert_eq!(p.metadata_sectors(), p.first_data_sector());
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(matches!(
            StandardFatFormatter.build_geometry(MAX_FAT_SECTOR_COUNT, 512, 0, 0),
            Err(FormatError::VolumeSizeWrong { .. })
        ));
        assert!(StandardFatFormatter.build_geometry(10_000, 512, 3, 0).is_err());
        assert!(StandardFatFormatter.build_geometry(40, 512, 8, 0).is_err());
    }
}
