use noxcipher_format::consts::{
    is_valid_sector_size, MIN_HIDDEN_VOLUME_HOST_SIZE, TOTAL_VOLUME_HEADERS_SIZE, VOLUME_DATA_OFFSET,
    VOLUME_HEADER_GROUP_SIZE,
};
use noxcipher_format::{FormatError, FormatRequest, Password, VolumeGeometry};
use proptest::prelude::*;

fn request(size: u64, sector_size: u32) -> FormatRequest {
    let mut req = FormatRequest::file("/tmp/geometry.hc", size, Password::new(b"pw").unwrap());
    req.sector_size = sector_size;
    req
}

proptest! {
    #[test]
    fn normal_volume_layout(size in (TOTAL_VOLUME_HEADERS_SIZE + 1)..(1u64 << 42), shift in 0u32..4) {
        let ss = 512u32 << shift;
        let g = VolumeGeometry::compute(&request(size, ss)).unwrap();
        prop_assert_eq!(g.data_area_size + TOTAL_VOLUME_HEADERS_SIZE, size);
        prop_assert_eq!(g.start_sector * ss as u64, VOLUME_DATA_OFFSET);
        prop_assert!(g.num_sectors * ss as u64 <= g.data_area_size);
        prop_assert_eq!(g.backup_header_offset + VOLUME_HEADER_GROUP_SIZE, size);
    }

    #[test]
    fn hidden_volume_is_aligned_or_rejected(
        host in MIN_HIDDEN_VOLUME_HOST_SIZE..(1u64 << 36),
        size in 1u64..(1u64 << 35),
        shift in 0u32..4,
    ) {
        let ss = 512u32 << shift;
        match VolumeGeometry::compute(&request(size, ss).hidden_in(host)) {
            Ok(g) => {
                prop_assert_eq!(g.data_offset % ss as u64, 0);
                prop_assert_eq!(g.data_offset + size + VOLUME_HEADER_GROUP_SIZE, host);
                prop_assert!(g.data_area_size > 0 && g.data_area_size < size);
            }
            Err(e) => {
                let size_rejected = matches!(e, FormatError::VolumeSizeWrong { .. });
                prop_assert!(size_rejected, "unexpected error: {}", e);
            }
        }
    }

    #[test]
    fn sector_size_gate(ss in 0u32..10_000) {
        let result = VolumeGeometry::compute(&request(16 << 20, ss));
        prop_assert_eq!(result.is_ok(), is_valid_sector_size(ss));
        if let Err(e) = result {
            let sector_rejected = matches!(e, FormatError::SectorSizeUnsupported(_));
            prop_assert!(sector_rejected, "unexpected error: {}", e);
        }
    }
}
