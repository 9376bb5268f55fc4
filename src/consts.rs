//! On-disk layout constants shared by every VeraCrypt-compatible implementation.
//!
//! Offsets prefixed `HEADER_OFFSET_` are absolute within the 512-byte effective
//! header (the salt occupies the first 64 bytes).

/// Granularity of the XTS tweak. Every sector is a whole number of data units.
pub const ENCRYPTION_DATA_UNIT_SIZE: usize = 512;

pub const MIN_SECTOR_SIZE: u32 = 512;
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Bytes of a header that carry data; the rest of the header slot is padding.
pub const VOLUME_HEADER_EFFECTIVE_SIZE: usize = 512;
/// One header slot (normal or hidden).
pub const VOLUME_HEADER_SIZE: u64 = 64 * 1024;
/// Normal header slot plus hidden header slot.
pub const VOLUME_HEADER_GROUP_SIZE: u64 = 2 * VOLUME_HEADER_SIZE;
/// Primary group at the start plus backup group at the end.
pub const TOTAL_VOLUME_HEADERS_SIZE: u64 = 4 * VOLUME_HEADER_SIZE;
pub const VOLUME_DATA_OFFSET: u64 = VOLUME_HEADER_GROUP_SIZE;
pub const HIDDEN_VOLUME_HEADER_OFFSET: u64 = VOLUME_HEADER_SIZE;

/// Space left free at the end of a host filesystem for its own backup structures.
pub const HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE: u64 = 4096;
pub const HIDDEN_VOLUME_HOST_FS_RESERVED_END_AREA_SIZE_HIGH: u64 = 65536;
/// Hidden volumes at or above this size reserve the larger tail.
pub const VOLUME_SMALL_SIZE_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

pub const MIN_FAT_FS_SIZE: u64 = 9 * MAX_SECTOR_SIZE as u64;
pub const MIN_VOLUME_SIZE: u64 = TOTAL_VOLUME_HEADERS_SIZE + MIN_FAT_FS_SIZE;
pub const MAX_NTFS_FS_SIZE: u64 = 128 * 1024 * 1024 * 1024 * 1024;
pub const MIN_HIDDEN_VOLUME_HOST_SIZE: u64 = MIN_VOLUME_SIZE * 2;
pub const MAX_HIDDEN_VOLUME_HOST_SIZE: u64 = MAX_NTFS_FS_SIZE - TOTAL_VOLUME_HEADERS_SIZE;
pub const MAX_FAT_SECTOR_COUNT: u64 = 0x1_0000_0000;

pub const FORMAT_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

pub const PKCS5_SALT_SIZE: usize = 64;
pub const MASTER_KEYDATA_SIZE: usize = 256;
pub const MAX_PASSWORD: usize = 128;
/// Largest PIM accepted for a normal volume header.
pub const MAX_PIM_VALUE: i32 = 2_147_468;
/// Largest PIM accepted for a pre-boot (system) header.
pub const MAX_BOOT_PIM_VALUE: i32 = 65_535;

pub const VOLUME_HEADER_VERSION: u16 = 5;
pub const VOLUME_MIN_REQUIRED_PROGRAM_VERSION: u16 = 0x010b;
/// Newest required-program version this engine accepts when decoding (1.26).
pub const MAX_SUPPORTED_PROGRAM_VERSION: u16 = 0x011a;
pub const HEADER_MAGIC: u32 = 0x5645_5241;

pub const HEADER_ENCRYPTED_DATA_OFFSET: usize = PKCS5_SALT_SIZE;
pub const HEADER_ENCRYPTED_DATA_SIZE: usize = VOLUME_HEADER_EFFECTIVE_SIZE - HEADER_ENCRYPTED_DATA_OFFSET;
pub const HEADER_OFFSET_MAGIC: usize = 64;
pub const HEADER_OFFSET_VERSION: usize = 68;
pub const HEADER_OFFSET_REQUIRED_VERSION: usize = 70;
pub const HEADER_OFFSET_KEY_AREA_CRC: usize = 72;
pub const HEADER_OFFSET_HIDDEN_VOLUME_SIZE: usize = 92;
pub const HEADER_OFFSET_VOLUME_SIZE: usize = 100;
pub const HEADER_OFFSET_ENCRYPTED_AREA_START: usize = 108;
pub const HEADER_OFFSET_ENCRYPTED_AREA_LENGTH: usize = 116;
pub const HEADER_OFFSET_FLAGS: usize = 124;
pub const HEADER_OFFSET_SECTOR_SIZE: usize = 128;
pub const HEADER_OFFSET_HEADER_CRC: usize = 252;
pub const HEADER_MASTER_KEYDATA_OFFSET: usize = 256;

/// True when `sector_size` satisfies the sector size modulus invariant.
pub fn is_valid_sector_size(sector_size: u32) -> bool {
    (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size)
        && sector_size as usize % ENCRYPTION_DATA_UNIT_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_size_bounds() {
        for s in [512, 1024, 1536, 2048, 3072, 4096] {
            assert!(is_valid_sector_size(s), "{s}");
        }
        for s in [0, 256, 511, 513, 1000, 4097, 4608, 8192] {
            assert!(!is_valid_sector_size(s), "{s}");
        }
    }

    #[test]
    fn layout_is_consistent() {
        assert_eq!(HEADER_ENCRYPTED_DATA_SIZE, 448);
        assert_eq!(HEADER_MASTER_KEYDATA_OFFSET + MASTER_KEYDATA_SIZE, VOLUME_HEADER_EFFECTIVE_SIZE);
        assert_eq!(TOTAL_VOLUME_HEADERS_SIZE, 2 * VOLUME_HEADER_GROUP_SIZE);
        assert_eq!(FORMAT_WRITE_BUFFER_SIZE % MAX_SECTOR_SIZE as usize, 0);
    }
}
