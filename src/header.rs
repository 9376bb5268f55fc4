// Volume header codec.
//
// The header is 512 bytes: a 64-byte clear salt followed by 448 bytes that are
// XTS-encrypted as one data unit under a key derived from the password.
// All numeric fields are big-endian.

use std::ops::{Deref, DerefMut};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::consts::*;
use crate::crypto::{CryptoContext, EncryptionAlgorithm, SupportedCipher};
use crate::error::{FormatError, Result};
use crate::prf::Prf;
use crate::rng::RandomSource;
use crate::secret::{Password, SecretBuffer};

// Offsets below are relative to the start of the decrypted block (absolute offset - 64).
const DEC_MAGIC: usize = HEADER_OFFSET_MAGIC - HEADER_ENCRYPTED_DATA_OFFSET;
const DEC_HEADER_CRC: usize = HEADER_OFFSET_HEADER_CRC - HEADER_ENCRYPTED_DATA_OFFSET;
const DEC_KEY_AREA: usize = HEADER_MASTER_KEYDATA_OFFSET - HEADER_ENCRYPTED_DATA_OFFSET;

/// Reasons a decrypted header is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("invalid magic 'VERA'")]
    InvalidMagic,
    #[error("header CRC mismatch")]
    InvalidCrc,
    #[error("master key area CRC mismatch")]
    InvalidKeyAreaCrc,
    #[error("unsupported header version")]
    UnsupportedVersion,
    #[error("unsupported minimum program version")]
    UnsupportedProgramVersion,
    #[error("invalid sector size")]
    InvalidSectorSize,
}

/// Decrypted volume header fields.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    // Version of the header layout.
    pub version: u16,
    // Minimum program version required to mount the volume.
    pub min_program_version: u16,
    // Header CRC as stored; not secret.
    #[zeroize(skip)]
    pub crc32: u32,
    // Zero unless this is a hidden volume header.
    pub hidden_volume_size: u64,
    // Size of the data area.
    pub volume_data_size: u64,
    // Byte offset where encrypted data starts on the host.
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
    // CRC of the key area as stored; not secret.
    #[zeroize(skip)]
    pub key_area_crc32: u32,
    // Concatenated primary and secondary master keys, zero-padded to 256 bytes.
    pub master_key_data: [u8; MASTER_KEYDATA_SIZE],
}

impl VolumeHeader {
    /// Parses and validates the 448-byte decrypted block.
    pub fn deserialize(decrypted: &[u8]) -> Result<Self, HeaderError> {
        // Anything shorter cannot hold the key area.
        if decrypted.len() < HEADER_ENCRYPTED_DATA_SIZE {
            return Err(HeaderError::InvalidMagic);
        }

        // The magic is the cheapest test for a wrong password, so do it first.
        if BigEndian::read_u32(&decrypted[DEC_MAGIC..DEC_MAGIC + 4]) != HEADER_MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let version = BigEndian::read_u16(&decrypted[4..6]);
        if version < 1 {
            return Err(HeaderError::UnsupportedVersion);
        }

        // The header CRC is only present from version 4 on; nothing is trusted before it matches.
        let header_crc_stored = BigEndian::read_u32(&decrypted[DEC_HEADER_CRC..DEC_HEADER_CRC + 4]);
        if version >= 4 && header_crc_stored != crc32fast::hash(&decrypted[..DEC_HEADER_CRC]) {
            return Err(HeaderError::InvalidCrc);
        }

        let min_program_version = BigEndian::read_u16(&decrypted[6..8]);
        // 0x011a is 1.26, the newest layout understood here.
        if min_program_version > MAX_SUPPORTED_PROGRAM_VERSION {
            return Err(HeaderError::UnsupportedProgramVersion);
        }

        let key_area_crc32 = BigEndian::read_u32(&decrypted[8..12]);
        // 12..28 is reserved (formerly creation timestamps).
        let hidden_volume_size = BigEndian::read_u64(&decrypted[28..36]);
        let volume_data_size = BigEndian::read_u64(&decrypted[36..44]);
        let encrypted_area_start = BigEndian::read_u64(&decrypted[44..52]);
        let encrypted_area_length = BigEndian::read_u64(&decrypted[52..60]);
        let flags = BigEndian::read_u32(&decrypted[60..64]);
        let mut sector_size = BigEndian::read_u32(&decrypted[64..68]);

        // Before version 5 the sector size was always 512.
        if version < 5 {
            sector_size = MIN_SECTOR_SIZE;
        }
        if !is_valid_sector_size(sector_size) {
            return Err(HeaderError::InvalidSectorSize);
        }

        let key_area = &decrypted[DEC_KEY_AREA..DEC_KEY_AREA + MASTER_KEYDATA_SIZE];
        if key_area_crc32 != crc32fast::hash(key_area) {
            return Err(HeaderError::InvalidKeyAreaCrc);
        }

        let mut master_key_data = [0u8; MASTER_KEYDATA_SIZE];
        master_key_data.copy_from_slice(key_area);

        Ok(VolumeHeader {
            version,
            min_program_version,
            crc32: header_crc_stored,
            hidden_volume_size,
            volume_data_size,
            encrypted_area_start,
            encrypted_area_length,
            flags,
            sector_size,
            key_area_crc32,
            master_key_data,
        })
    }

    /// Writes the plaintext header (without salt) into `out` and fills in both CRCs.
    pub fn serialize(&mut self, out: &mut [u8]) {
        let out = &mut out[..HEADER_ENCRYPTED_DATA_SIZE];
        out.fill(0);

        BigEndian::write_u32(&mut out[DEC_MAGIC..DEC_MAGIC + 4], HEADER_MAGIC);
        BigEndian::write_u16(&mut out[4..6], self.version);
        BigEndian::write_u16(&mut out[6..8], self.min_program_version);

        out[DEC_KEY_AREA..].copy_from_slice(&self.master_key_data);
        self.key_area_crc32 = crc32fast::hash(&out[DEC_KEY_AREA..]);
        BigEndian::write_u32(&mut out[8..12], self.key_area_crc32);

        BigEndian::write_u64(&mut out[28..36], self.hidden_volume_size);
        BigEndian::write_u64(&mut out[36..44], self.volume_data_size);
        BigEndian::write_u64(&mut out[44..52], self.encrypted_area_start);
        BigEndian::write_u64(&mut out[52..60], self.encrypted_area_length);
        BigEndian::write_u32(&mut out[60..64], self.flags);
        BigEndian::write_u32(&mut out[64..68], self.sector_size);

        // Must come last: covers every field above.
        self.crc32 = crc32fast::hash(&out[..DEC_HEADER_CRC]);
        BigEndian::write_u32(&mut out[DEC_HEADER_CRC..DEC_HEADER_CRC + 4], self.crc32);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden_volume_size != 0
    }

    // XTS keys are considered vulnerable if the two halves (Key1 and Key2) are identical.
    pub fn is_key_vulnerable(&self, key_size: usize) -> bool {
        if key_size * 2 > self.master_key_data.len() {
            return true;
        }
        self.master_key_data[..key_size] == self.master_key_data[key_size..key_size * 2]
    }
}

/// One encoded 512-byte header, wiped when dropped.
#[derive(Debug)]
pub struct HeaderBlock(SecretBuffer);

impl HeaderBlock {
    pub fn new() -> Self {
        HeaderBlock(SecretBuffer::new(VOLUME_HEADER_EFFECTIVE_SIZE))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VOLUME_HEADER_EFFECTIVE_SIZE {
            return Err(FormatError::ParameterIncorrect("header buffer too short"));
        }
        Ok(HeaderBlock(SecretBuffer::from_slice(&bytes[..VOLUME_HEADER_EFFECTIVE_SIZE])))
    }

    pub fn salt(&self) -> &[u8] {
        &self.0[..PKCS5_SALT_SIZE]
    }
}

impl Default for HeaderBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for HeaderBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for HeaderBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// What to put in a header. A `None` password produces a decoy header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderParams<'a> {
    pub algorithm: EncryptionAlgorithm,
    pub prf: Prf,
    pub password: Option<&'a Password>,
    pub pim: i32,
    pub boot: bool,
    pub volume_size: u64,
    pub hidden_volume_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub required_program_version: u16,
    pub header_flags: u32,
    pub sector_size: u32,
}

/// Builds and encrypts a volume header.
///
/// Without `master_key` a fresh one is drawn from `rng`. The returned context is
/// keyed with the master key, ready to encrypt the data area.
///
/// # Panics
///
/// If `params.sector_size` breaks the sector size invariant. Requests are
/// validated long before this point, so reaching it is a bug.
pub fn encode_header(
    params: &HeaderParams<'_>,
    master_key: Option<&[u8]>,
    rng: &mut dyn RandomSource,
) -> Result<(HeaderBlock, CryptoContext)> {
    assert!(
        is_valid_sector_size(params.sector_size),
        "sector size {} violates the sector size invariant",
        params.sector_size
    );

    let ks = params.algorithm.key_size();
    let iterations = params.prf.iterations(params.pim, params.boot)?;

    let mut key_info = VolumeHeader {
        version: VOLUME_HEADER_VERSION,
        min_program_version: params.required_program_version,
        crc32: 0,
        hidden_volume_size: params.hidden_volume_size,
        volume_data_size: params.volume_size,
        encrypted_area_start: params.encrypted_area_start,
        encrypted_area_length: params.encrypted_area_length,
        flags: params.header_flags,
        sector_size: params.sector_size,
        key_area_crc32: 0,
        master_key_data: [0u8; MASTER_KEYDATA_SIZE],
    };

    match master_key {
        Some(mk) => {
            if mk.len() < 2 * ks {
                return Err(FormatError::ParameterIncorrect("master key shorter than the cipher needs"));
            }
            key_info.master_key_data[..2 * ks].copy_from_slice(&mk[..2 * ks]);
        }
        None => rng.fill(&mut key_info.master_key_data[..2 * ks])?,
    }

    let mut block = HeaderBlock::new();
    rng.fill(&mut block[..PKCS5_SALT_SIZE])?;

    let mut header_key = SecretBuffer::new(2 * ks);
    match params.password {
        Some(pw) => {
            log::debug!(
                "deriving header key with {} ({} iterations)",
                params.prf.name(),
                iterations
            );
            let (salt, _) = block.split_at(PKCS5_SALT_SIZE);
            params.prf.derive_key(pw.as_bytes(), salt, iterations, &mut header_key)?;
        }
        None => rng.fill(&mut header_key)?,
    }

    key_info.serialize(&mut block[HEADER_ENCRYPTED_DATA_OFFSET..]);
    log::trace!(
        "header crc {} key area crc {}",
        hex::encode(key_info.crc32.to_be_bytes()),
        hex::encode(key_info.key_area_crc32.to_be_bytes())
    );

    let header_cipher = SupportedCipher::new(params.algorithm, &header_key[..ks], &header_key[ks..])?;
    header_cipher.encrypt_buffer(&mut block[HEADER_ENCRYPTED_DATA_OFFSET..]);

    let mut ctx = CryptoContext::new(params.algorithm, params.prf, params.pim, iterations, &key_info.master_key_data);
    ctx.header_version = VOLUME_HEADER_VERSION;
    ctx.required_program_version = params.required_program_version;
    ctx.header_flags = params.header_flags;
    ctx.volume_size = params.volume_size;
    ctx.hidden_volume_size = params.hidden_volume_size;
    ctx.encrypted_area_start = params.encrypted_area_start;
    ctx.encrypted_area_length = params.encrypted_area_length;
    ctx.sector_size = params.sector_size;
    ctx.init_master()?;

    Ok((block, ctx))
}

/// Narrows the search performed by [`decode_header`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeHints {
    pub prf: Option<Prf>,
    pub algorithm: Option<EncryptionAlgorithm>,
    pub boot: bool,
}

/// Decrypts a header by trying every PRF and algorithm allowed by `hints`.
pub fn decode_header(
    bytes: &[u8],
    password: &Password,
    pim: i32,
    hints: DecodeHints,
) -> Result<(VolumeHeader, CryptoContext)> {
    if bytes.len() < VOLUME_HEADER_EFFECTIVE_SIZE {
        return Err(FormatError::ParameterIncorrect("header buffer too short"));
    }
    let salt = &bytes[..PKCS5_SALT_SIZE];
    let encrypted = &bytes[HEADER_ENCRYPTED_DATA_OFFSET..VOLUME_HEADER_EFFECTIVE_SIZE];

    let prfs: Vec<Prf> = hints.prf.map_or_else(|| Prf::ALL.to_vec(), |p| vec![p]);
    let algorithms: Vec<EncryptionAlgorithm> =
        hints.algorithm.map_or_else(|| EncryptionAlgorithm::ALL.to_vec(), |a| vec![a]);
    let max_key = algorithms.iter().map(|a| a.key_size()).max().unwrap_or(0);

    let mut decrypted = SecretBuffer::new(HEADER_ENCRYPTED_DATA_SIZE);
    for prf in prfs {
        let iterations = prf.iterations(pim, hints.boot)?;
        // PBKDF2 output is a prefix-stable stream, so derive once for the largest key.
        let mut derived = SecretBuffer::new(2 * max_key);
        prf.derive_key(password.as_bytes(), salt, iterations, &mut derived)?;

        let Some((algorithm, header)) = open_with_key(encrypted, &derived, &algorithms, &mut decrypted)? else {
            continue;
        };
        log::info!("header decrypted with {} / {}", prf.name(), algorithm.name());
        let mut ctx = CryptoContext::new(algorithm, prf, pim, iterations, &header.master_key_data);
        ctx.header_version = header.version;
        ctx.required_program_version = header.min_program_version;
        ctx.header_flags = header.flags;
        ctx.volume_size = header.volume_data_size;
        ctx.hidden_volume_size = header.hidden_volume_size;
        ctx.encrypted_area_start = header.encrypted_area_start;
        ctx.encrypted_area_length = header.encrypted_area_length;
        ctx.sector_size = header.sector_size;
        ctx.init_master()?;
        return Ok((header, ctx));
    }

    Err(FormatError::PasswordWrong)
}

/// Tries `header_key` (primary half then secondary half, sized for the
/// largest algorithm) against the encrypted part of a header.
///
/// `Ok(None)` means no algorithm produced a valid magic and header CRC.
fn open_with_key(
    encrypted: &[u8],
    header_key: &[u8],
    algorithms: &[EncryptionAlgorithm],
    decrypted: &mut [u8],
) -> Result<Option<(EncryptionAlgorithm, VolumeHeader)>> {
    for &algorithm in algorithms {
        let ks = algorithm.key_size();
        let cipher = match SupportedCipher::new(algorithm, &header_key[..ks], &header_key[ks..2 * ks]) {
            Ok(c) => c,
            Err(_) => continue,
        };
        decrypted.copy_from_slice(encrypted);
        cipher.decrypt_buffer(decrypted);

        match VolumeHeader::deserialize(decrypted) {
            Ok(header) => return Ok(Some((algorithm, header))),
            Err(HeaderError::InvalidMagic) | Err(HeaderError::InvalidCrc) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}
