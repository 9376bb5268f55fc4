//! Writes the encrypted data area and the reserved parts of the header groups.

use std::thread;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::consts::{ENCRYPTION_DATA_UNIT_SIZE, VOLUME_HEADER_EFFECTIVE_SIZE, VOLUME_HEADER_GROUP_SIZE};
use crate::crypto::CryptoContext;
use crate::device::{read_or_zero, seek_exact, VolumeDevice};
use crate::error::{FormatError, Result};
use crate::fat::{FatFormatter, FatParams};
use crate::host::ProgressObserver;
use crate::pipeline::{SectorWriter, WritePipeline, WriteTarget};
use crate::rng::RandomSource;
use crate::secret::SecretBuffer;
use crate::session::FormatSession;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(25);

/// A run of sectors in the host, counted from the start of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataArea {
    pub start_sector: u64,
    pub num_sectors: u64,
    /// The host is a raw device rather than a container file.
    pub on_device: bool,
}

/// Fills `area` with encrypted zeros and returns the sector cursor after it.
///
/// The zeros are encrypted under a throwaway key so that the data area is
/// indistinguishable from random data and nothing in it can be related to the
/// master key. `ctx` is re-keyed with its master key before returning, whether
/// the fill succeeded or not. With `quick` set nothing is written.
pub fn fill_data_area(
    session: &mut FormatSession,
    device: &mut dyn VolumeDevice,
    ctx: &mut CryptoContext,
    area: DataArea,
    quick: bool,
    progress: &mut dyn ProgressObserver,
) -> Result<u64> {
    let sector_size = ctx.sector_size as u64;
    seek_exact(device, area.start_sector * sector_size)?;

    if quick {
        log::info!("quick format: {} sectors left as they are", area.num_sectors);
        progress.report(area.num_sectors * sector_size);
        return Ok(area.start_sector + area.num_sectors);
    }

    log::info!(
        "filling {} sectors from sector {} with encrypted zeros",
        area.num_sectors,
        area.start_sector
    );
    let buffer_size = session.write_buffer_size();
    let use_thread = session.use_write_thread(area.on_device);
    with_temporary_key(session.rng(), ctx, |ctx| {
        with_sector_writer(device, ctx, area.start_sector, buffer_size, use_thread, |writer| {
            write_zero_sectors(writer, area.num_sectors, progress)
        })
    })
}

fn write_zero_sectors(
    writer: &mut SectorWriter<'_, '_>,
    num_sectors: u64,
    progress: &mut dyn ProgressObserver,
) -> Result<()> {
    let sector_size = writer.sector_size();
    let zeros = vec![0u8; sector_size];
    let mut last_report = Instant::now();

    for done in 1..=num_sectors {
        writer.write_sector(&zeros)?;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            if progress.report(done * sector_size as u64) {
                log::info!("data area fill cancelled after {} sectors", done);
                return Err(FormatError::UserAbort);
            }
        }
    }
    progress.report(num_sectors * sector_size as u64);
    Ok(())
}

/// Writes FAT metadata at the start of `area` under the master key, then fills
/// the rest of the area like [`fill_data_area`].
pub fn write_fat_filesystem(
    session: &mut FormatSession,
    device: &mut dyn VolumeDevice,
    ctx: &mut CryptoContext,
    area: DataArea,
    quick: bool,
    fat: &dyn FatFormatter,
    cluster_size: u32,
    progress: &mut dyn ProgressObserver,
) -> Result<(FatParams, u64)> {
    let mut id = [0u8; 4];
    session.rng().fill(&mut id)?;
    let params = fat.build_geometry(area.num_sectors, ctx.sector_size, cluster_size, u32::from_le_bytes(id))?;
    let meta = params.metadata_sectors();
    let remaining = area.num_sectors.checked_sub(meta).ok_or_else(|| {
        log::error!("FAT metadata needs {} sectors, data area has {}", meta, area.num_sectors);
        FormatError::VolumeSizeWrong { size: area.num_sectors * ctx.sector_size as u64 }
    })?;

    seek_exact(device, area.start_sector * ctx.sector_size as u64)?;
    let buffer_size = session.write_buffer_size();
    let use_thread = session.use_write_thread(area.on_device);
    let cursor = with_sector_writer(device, ctx, area.start_sector, buffer_size, use_thread, |writer| {
        fat.write_filesystem(&params, writer)
    })?;
    log::debug!("FAT metadata written, cursor at sector {}", cursor);

    let rest = DataArea { start_sector: area.start_sector + meta, num_sectors: remaining, ..area };
    let cursor = fill_data_area(session, device, ctx, rest, quick, progress)?;
    Ok((params, cursor))
}

/// Fills the unused part of both header groups with random-looking data.
///
/// Each group holds a header in its first 512 bytes. The whole group is read
/// back, everything after the header is encrypted under a throwaway key and
/// the group is written in place, so device writes stay sector aligned.
/// Reads past the end of the host count as zeros.
pub fn fill_reserved_header_areas(
    session: &mut FormatSession,
    device: &mut dyn VolumeDevice,
    ctx: &mut CryptoContext,
    data_area_size: u64,
) -> Result<()> {
    let mut buf = Zeroizing::new(vec![0u8; VOLUME_HEADER_GROUP_SIZE as usize]);

    for group in [0, VOLUME_HEADER_GROUP_SIZE + data_area_size] {
        seek_exact(device, group)?;
        read_or_zero(device, &mut buf)?;
        let first_unit = (group + VOLUME_HEADER_EFFECTIVE_SIZE as u64) / ENCRYPTION_DATA_UNIT_SIZE as u64;
        with_temporary_key(session.rng(), ctx, |ctx| {
            ctx.encrypt_data_units(&mut buf[VOLUME_HEADER_EFFECTIVE_SIZE..], first_unit)
        })?;
        seek_exact(device, group)?;
        device.write_all(&buf).map_err(|e| FormatError::io("write reserved header area", e))?;
    }
    log::debug!("reserved header areas filled");
    Ok(())
}

/// Runs `f` with `ctx` keyed by a fresh random key pair, then re-keys `ctx`
/// with its master key. An error from `f` wins over a re-keying error.
fn with_temporary_key<T>(
    rng: &mut dyn RandomSource,
    ctx: &mut CryptoContext,
    f: impl FnOnce(&CryptoContext) -> Result<T>,
) -> Result<T> {
    let ks = ctx.algorithm().key_size();
    let outcome = (|| {
        let mut temp_key = SecretBuffer::new(ks);
        let mut temp_k2 = SecretBuffer::new(ks);
        rng.fill(&mut temp_key)?;
        rng.fill(&mut temp_k2)?;
        ctx.set_secondary_key(&temp_k2);
        ctx.init_cipher(&temp_key)?;
        f(ctx)
    })();

    let restored = ctx.init_master();
    match (outcome, restored) {
        (Err(e), Err(restore)) => {
            log::error!("could not restore master key after failure: {}", restore);
            Err(e)
        }
        (outcome, restored) => restored.and(outcome),
    }
}

/// Wraps `device` in a [`SectorWriter`] starting at `first_sector`, optionally
/// behind the write pipeline, runs `body` and drains everything to the device.
fn with_sector_writer<F>(
    device: &mut dyn VolumeDevice,
    ctx: &CryptoContext,
    first_sector: u64,
    buffer_size: usize,
    use_thread: bool,
    body: F,
) -> Result<u64>
where
    F: FnOnce(&mut SectorWriter<'_, '_>) -> Result<()>,
{
    if use_thread {
        thread::scope(|scope| {
            let pipeline = WritePipeline::start(scope, &mut *device, buffer_size)?;
            let mut writer =
                SectorWriter::new(ctx, WriteTarget::Pipeline(pipeline), buffer_size, ctx.sector_size, first_sector);
            body(&mut writer)?;
            writer.finish()
        })
    } else {
        let mut writer = SectorWriter::new(ctx, WriteTarget::Direct(device), buffer_size, ctx.sector_size, first_sector);
        body(&mut writer)?;
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::VOLUME_DATA_OFFSET;
    use crate::crypto::EncryptionAlgorithm;
    use crate::fat::{FatType, StandardFatFormatter};
    use crate::header::{encode_header, HeaderParams};
    use crate::prf::Prf;
    use crate::rng::OsRandom;
    use crate::session::{SessionConfig, WriteThreadMode};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// OS randomness that remembers everything it handed out.
    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<Vec<u8>>>>);

    impl RandomSource for Recording {
        fn fill(&mut self, dest: &mut [u8]) -> Result<()> {
            OsRandom.fill(dest)?;
            self.0.lock().unwrap().push(dest.to_vec());
            Ok(())
        }
    }

    fn context(sector_size: u32) -> CryptoContext {
        let params = HeaderParams {
            algorithm: EncryptionAlgorithm::Aes,
            prf: Prf::Sha512,
            password: None,
            pim: 0,
            boot: false,
            volume_size: 1 << 20,
            hidden_volume_size: 0,
            encrypted_area_start: VOLUME_DATA_OFFSET,
            encrypted_area_length: 1 << 20,
            required_program_version: 0x010b,
            header_flags: 0,
            sector_size,
        };
        encode_header(&params, None, &mut OsRandom).unwrap().1
    }

    fn session(mode: WriteThreadMode, rng: Recording) -> FormatSession {
        let config = SessionConfig { write_buffer_size: 8192, write_thread: mode };
        FormatSession::with_rng(config, Box::new(rng)).unwrap()
    }

    fn fill_and_decrypt(mode: WriteThreadMode) {
        let rng = Recording::default();
        let mut session = session(mode, rng.clone());
        let mut ctx = context(512);
        let master = ctx.master_key().to_vec();
        let area = DataArea { start_sector: 256, num_sectors: 37, on_device: false };
        let mut dev = Cursor::new(vec![0u8; (256 + 37) * 512]);

        let cursor = fill_data_area(&mut session, &mut dev, &mut ctx, area, false, &mut ()).unwrap();
        assert_eq!(cursor, 256 + 37);
        assert_eq!(ctx.secondary_key(), &master[32..64]);

        let draws = rng.0.lock().unwrap().clone();
        assert_eq!(draws.len(), 2);
        let mut tmp = CryptoContext::new(EncryptionAlgorithm::Aes, Prf::Sha512, 0, 1, &[draws[0].clone(), draws[1].clone()].concat());
        tmp.init_master().unwrap();

        let mut data = dev.get_ref()[256 * 512..].to_vec();
        assert!(data.iter().any(|&b| b != 0));
        tmp.decrypt_data_units(&mut data, 256).unwrap();
        assert!(data.iter().all(|&b| b == 0));
        assert!(dev.get_ref()[..256 * 512].iter().all(|&b| b == 0));
    }

    #[test]
    fn full_fill_decrypts_to_zeros_under_temporary_key() {
        fill_and_decrypt(WriteThreadMode::Never);
    }

    #[test]
    fn pipelined_fill_matches_direct_fill() {
        fill_and_decrypt(WriteThreadMode::Always);
    }

    #[test]
    fn quick_fill_writes_nothing() {
        let mut session = session(WriteThreadMode::Never, Recording::default());
        let mut ctx = context(4096);
        let mut dev = Cursor::new(vec![0xa5u8; 4096 * 8]);
        let area = DataArea { start_sector: 2, num_sectors: 6, on_device: false };
        let cursor = fill_data_area(&mut session, &mut dev, &mut ctx, area, true, &mut ()).unwrap();
        assert_eq!(cursor, 8);
        assert!(dev.get_ref().iter().all(|&b| b == 0xa5));
        assert_eq!(dev.position(), 2 * 4096);
    }

    #[test]
    fn cancelling_restores_master_key() {
        let mut session = session(WriteThreadMode::Never, Recording::default());
        let mut ctx = context(512);
        let master = ctx.master_key().to_vec();
        let mut dev = Cursor::new(Vec::new());
        let area = DataArea { start_sector: 0, num_sectors: 200_000, on_device: false };
        let mut cancel = |_done: u64| true;

        let err = fill_data_area(&mut session, &mut dev, &mut ctx, area, false, &mut cancel).unwrap_err();
        assert!(matches!(err, FormatError::UserAbort));
        assert_eq!(ctx.secondary_key(), &master[32..64]);
    }

    #[test]
    fn fat_metadata_is_encrypted_with_master_key() {
        let mut session = session(WriteThreadMode::Never, Recording::default());
        let mut ctx = context(512);
        let sectors = 20_000u64;
        let mut dev = Cursor::new(Vec::new());
        let area = DataArea { start_sector: 256, num_sectors: sectors, on_device: false };

        let (params, cursor) =
            write_fat_filesystem(&mut session, &mut dev, &mut ctx, area, true, &StandardFatFormatter, 0, &mut ()).unwrap();
        assert_eq!(cursor, 256 + sectors);

        let mut boot = dev.get_ref()[256 * 512..257 * 512].to_vec();
        ctx.decrypt_data_units(&mut boot, 256).unwrap();
        assert_eq!(&boot[510..512], &[0x55, 0xAA]);
        assert_eq!(boot[13] as u32, params.sectors_per_cluster);
        // Quick: nothing beyond the metadata was written.
        assert_eq!(dev.get_ref().len() as u64, (256 + params.metadata_sectors()) * 512);
    }

    /// Claims more metadata than any data area holds.
    struct OversizedFat;

    impl FatFormatter for OversizedFat {
        fn build_geometry(&self, total_sectors: u64, sector_size: u32, _: u32, _: u32) -> Result<FatParams> {
            Ok(FatParams {
                fat_type: FatType::Fat32,
                sector_size,
                total_sectors,
                sectors_per_cluster: 1,
                reserved_sectors: 32,
                fat_count: 2,
                fat_sectors: total_sectors as u32,
                root_dir_sectors: 0,
                volume_id: 0,
            })
        }

        fn write_filesystem(&self, _: &FatParams, _: &mut dyn crate::fat::SectorSink) -> Result<()> {
            unreachable!("geometry is rejected before anything is written")
        }
    }

    #[test]
    fn fat_metadata_larger_than_area_is_rejected() {
        let mut session = session(WriteThreadMode::Never, Recording::default());
        let mut ctx = context(512);
        let mut dev = Cursor::new(Vec::new());
        let area = DataArea { start_sector: 256, num_sectors: 1000, on_device: false };

        let err = write_fat_filesystem(&mut session, &mut dev, &mut ctx, area, true, &OversizedFat, 0, &mut ())
            .unwrap_err();
        assert!(matches!(err, FormatError::VolumeSizeWrong { size: 512_000 }));
        assert!(dev.get_ref().is_empty());
    }

    #[test]
    fn reserved_areas_are_filled_and_headers_kept() {
        let mut session = session(WriteThreadMode::Never, Recording::default());
        let mut ctx = context(512);
        let data_area = 64 * 1024;
        let total = (2 * VOLUME_HEADER_GROUP_SIZE + data_area) as usize;
        let mut image = vec![0u8; total];
        image[..512].fill(0x11);
        let backup = (VOLUME_HEADER_GROUP_SIZE + data_area) as usize;
        image[backup..backup + 512].fill(0x22);
        let mut dev = Cursor::new(image);

        fill_reserved_header_areas(&mut session, &mut dev, &mut ctx, data_area).unwrap();
        let image = dev.into_inner();
        assert_eq!(image.len(), total);
        assert!(image[..512].iter().all(|&b| b == 0x11));
        assert!(image[backup..backup + 512].iter().all(|&b| b == 0x22));
        let group = VOLUME_HEADER_GROUP_SIZE as usize;
        assert!(image[512..group].iter().any(|&b| b != 0));
        assert!(image[backup + 512..backup + group].iter().any(|&b| b != 0));
        // Data area untouched.
        assert!(image[group..backup].iter().all(|&b| b == 0));
    }
}
