use std::fmt;

use aes::Aes256;
use camellia::Camellia256;
use cipher::consts::{U1, U16, U32};
use cipher::inout::InOut;
use cipher::{
    Block, BlockBackend, BlockCipher, BlockDecrypt, BlockEncrypt, BlockSizeUser, Key, KeyInit, KeySizeUser,
    ParBlocksSizeUser,
};
use kuznyechik::block_cipher::{BlockCipher as OldBlockCipher, NewBlockCipher};
use serpent::Serpent;
use twofish::Twofish;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::consts::{ENCRYPTION_DATA_UNIT_SIZE, MASTER_KEYDATA_SIZE};
use crate::error::{FormatError, Result};
use crate::prf::Prf;
use crate::secret::SecretBuffer;

// kuznyechik 0.4 still speaks the old block-cipher traits; bridge it to cipher 0.4.

#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KuznyechikWrapper(#[zeroize(skip)] kuznyechik::Kuznyechik);

impl KeySizeUser for KuznyechikWrapper {
    type KeySize = U32;
}

impl KeyInit for KuznyechikWrapper {
    fn new(key: &Key<Self>) -> Self {
        KuznyechikWrapper(kuznyechik::Kuznyechik::new(key))
    }
}

impl BlockSizeUser for KuznyechikWrapper {
    type BlockSize = U16;
}

impl BlockCipher for KuznyechikWrapper {}

struct KuznyechikEncryptBackend<'a>(&'a kuznyechik::Kuznyechik);

impl<'a> BlockSizeUser for KuznyechikEncryptBackend<'a> {
    type BlockSize = U16;
}
impl<'a> ParBlocksSizeUser for KuznyechikEncryptBackend<'a> {
    type ParBlocksSize = U1;
}
impl<'a> BlockBackend for KuznyechikEncryptBackend<'a> {
    fn proc_block(&mut self, mut block: InOut<'_, '_, Block<Self>>) {
        let mut tmp = block.clone_in();
        self.0.encrypt_block(&mut tmp);
        *block.get_out() = tmp;
    }
}

impl BlockEncrypt for KuznyechikWrapper {
    fn encrypt_with_backend(&self, f: impl cipher::BlockClosure<BlockSize = Self::BlockSize>) {
        let mut backend = KuznyechikEncryptBackend(&self.0);
        f.call(&mut backend);
    }
}

struct KuznyechikDecryptBackend<'a>(&'a kuznyechik::Kuznyechik);

impl<'a> BlockSizeUser for KuznyechikDecryptBackend<'a> {
    type BlockSize = U16;
}
impl<'a> ParBlocksSizeUser for KuznyechikDecryptBackend<'a> {
    type ParBlocksSize = U1;
}
impl<'a> BlockBackend for KuznyechikDecryptBackend<'a> {
    fn proc_block(&mut self, mut block: InOut<'_, '_, Block<Self>>) {
        let mut tmp = block.clone_in();
        self.0.decrypt_block(&mut tmp);
        *block.get_out() = tmp;
    }
}

impl BlockDecrypt for KuznyechikWrapper {
    fn decrypt_with_backend(&self, f: impl cipher::BlockClosure<BlockSize = Self::BlockSize>) {
        let mut backend = KuznyechikDecryptBackend(&self.0);
        f.call(&mut backend);
    }
}

/// A single block cipher usable as one XTS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes,
    Serpent,
    Twofish,
    Camellia,
    Kuznyechik,
}

impl CipherKind {
    pub const KEY_SIZE: usize = 32;
}

/// Encryption algorithm of a volume: one cipher or a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    Aes,
    Serpent,
    Twofish,
    Camellia,
    Kuznyechik,
    AesTwofish,
    AesTwofishSerpent,
    SerpentAes,
    SerpentTwofishAes,
    TwofishSerpent,
    CamelliaKuznyechik,
    KuznyechikTwofish,
    CamelliaSerpent,
    KuznyechikAes,
    KuznyechikSerpentCamellia,
}

impl EncryptionAlgorithm {
    pub const ALL: [EncryptionAlgorithm; 15] = [
        EncryptionAlgorithm::Aes,
        EncryptionAlgorithm::Serpent,
        EncryptionAlgorithm::Twofish,
        EncryptionAlgorithm::Camellia,
        EncryptionAlgorithm::Kuznyechik,
        EncryptionAlgorithm::AesTwofish,
        EncryptionAlgorithm::AesTwofishSerpent,
        EncryptionAlgorithm::SerpentAes,
        EncryptionAlgorithm::SerpentTwofishAes,
        EncryptionAlgorithm::TwofishSerpent,
        EncryptionAlgorithm::CamelliaKuznyechik,
        EncryptionAlgorithm::KuznyechikTwofish,
        EncryptionAlgorithm::CamelliaSerpent,
        EncryptionAlgorithm::KuznyechikAes,
        EncryptionAlgorithm::KuznyechikSerpentCamellia,
    ];

    /// Layers in encryption order. Names list the outermost cipher first,
    /// so the order here is the reverse of the name. Key bytes follow this order.
    pub fn ciphers(self) -> &'static [CipherKind] {
        use CipherKind::*;
        match self {
            EncryptionAlgorithm::Aes => &[Aes],
            EncryptionAlgorithm::Serpent => &[Serpent],
            EncryptionAlgorithm::Twofish => &[Twofish],
            EncryptionAlgorithm::Camellia => &[Camellia],
            EncryptionAlgorithm::Kuznyechik => &[Kuznyechik],
            EncryptionAlgorithm::AesTwofish => &[Twofish, Aes],
            EncryptionAlgorithm::AesTwofishSerpent => &[Serpent, Twofish, Aes],
            EncryptionAlgorithm::SerpentAes => &[Aes, Serpent],
            EncryptionAlgorithm::SerpentTwofishAes => &[Aes, Twofish, Serpent],
            EncryptionAlgorithm::TwofishSerpent => &[Serpent, Twofish],
            EncryptionAlgorithm::CamelliaKuznyechik => &[Kuznyechik, Camellia],
            EncryptionAlgorithm::KuznyechikTwofish => &[Twofish, Kuznyechik],
            EncryptionAlgorithm::CamelliaSerpent => &[Serpent, Camellia],
            EncryptionAlgorithm::KuznyechikAes => &[Aes, Kuznyechik],
            EncryptionAlgorithm::KuznyechikSerpentCamellia => &[Camellia, Serpent, Kuznyechik],
        }
    }

    /// Bytes of primary key; the secondary (tweak) key has the same length.
    pub fn key_size(self) -> usize {
        self.ciphers().len() * CipherKind::KEY_SIZE
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes => "AES",
            EncryptionAlgorithm::Serpent => "Serpent",
            EncryptionAlgorithm::Twofish => "Twofish",
            EncryptionAlgorithm::Camellia => "Camellia",
            EncryptionAlgorithm::Kuznyechik => "Kuznyechik",
            EncryptionAlgorithm::AesTwofish => "AES-Twofish",
            EncryptionAlgorithm::AesTwofishSerpent => "AES-Twofish-Serpent",
            EncryptionAlgorithm::SerpentAes => "Serpent-AES",
            EncryptionAlgorithm::SerpentTwofishAes => "Serpent-Twofish-AES",
            EncryptionAlgorithm::TwofishSerpent => "Twofish-Serpent",
            EncryptionAlgorithm::CamelliaKuznyechik => "Camellia-Kuznyechik",
            EncryptionAlgorithm::KuznyechikTwofish => "Kuznyechik-Twofish",
            EncryptionAlgorithm::CamelliaSerpent => "Camellia-Serpent",
            EncryptionAlgorithm::KuznyechikAes => "Kuznyechik-AES",
            EncryptionAlgorithm::KuznyechikSerpentCamellia => "Kuznyechik-Serpent-Camellia",
        }
    }
}

enum XtsLayer {
    Aes(Xts128<Aes256>),
    Serpent(Xts128<Serpent>),
    Twofish(Xts128<Twofish>),
    Camellia(Xts128<Camellia256>),
    Kuznyechik(Xts128<KuznyechikWrapper>),
}

fn xts_pair<C: KeyInit + BlockEncrypt + BlockDecrypt + BlockCipher + BlockSizeUser<BlockSize = U16>>(
    k1: &[u8],
    k2: &[u8],
) -> Result<Xts128<C>> {
    let c1 = C::new_from_slice(k1).map_err(|_| FormatError::CipherInit)?;
    let c2 = C::new_from_slice(k2).map_err(|_| FormatError::CipherInit)?;
    Ok(Xts128::new(c1, c2))
}

impl XtsLayer {
    fn new(kind: CipherKind, k1: &[u8], k2: &[u8]) -> Result<Self> {
        Ok(match kind {
            CipherKind::Aes => XtsLayer::Aes(xts_pair(k1, k2)?),
            CipherKind::Serpent => XtsLayer::Serpent(xts_pair(k1, k2)?),
            CipherKind::Twofish => XtsLayer::Twofish(xts_pair(k1, k2)?),
            CipherKind::Camellia => XtsLayer::Camellia(xts_pair(k1, k2)?),
            CipherKind::Kuznyechik => XtsLayer::Kuznyechik(xts_pair(k1, k2)?),
        })
    }

    fn encrypt_area(&self, data: &mut [u8], unit_size: usize, first_unit: u128) {
        match self {
            XtsLayer::Aes(x) => x.encrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Serpent(x) => x.encrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Twofish(x) => x.encrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Camellia(x) => x.encrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Kuznyechik(x) => x.encrypt_area(data, unit_size, first_unit, get_tweak_default),
        }
    }

    fn decrypt_area(&self, data: &mut [u8], unit_size: usize, first_unit: u128) {
        match self {
            XtsLayer::Aes(x) => x.decrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Serpent(x) => x.decrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Twofish(x) => x.decrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Camellia(x) => x.decrypt_area(data, unit_size, first_unit, get_tweak_default),
            XtsLayer::Kuznyechik(x) => x.decrypt_area(data, unit_size, first_unit, get_tweak_default),
        }
    }
}

/// Initialized XTS key schedule for one encryption algorithm.
pub struct SupportedCipher {
    algorithm: EncryptionAlgorithm,
    layers: Vec<XtsLayer>,
}

impl SupportedCipher {
    /// `primary` and `secondary` must each be `algorithm.key_size()` bytes.
    pub fn new(algorithm: EncryptionAlgorithm, primary: &[u8], secondary: &[u8]) -> Result<Self> {
        let ks = algorithm.key_size();
        if primary.len() < ks || secondary.len() < ks {
            return Err(FormatError::CipherInit);
        }
        // XTS is insecure when both halves are equal.
        if primary[..ks] == secondary[..ks] {
            return Err(FormatError::ModeInit);
        }
        let layers = algorithm
            .ciphers()
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let range = i * CipherKind::KEY_SIZE..(i + 1) * CipherKind::KEY_SIZE;
                XtsLayer::new(kind, &primary[range.clone()], &secondary[range])
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SupportedCipher { algorithm, layers })
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypts whole 512-byte data units; the first one is unit `start_unit`.
    pub fn encrypt_data_units(&self, data: &mut [u8], start_unit: u64) {
        debug_assert_eq!(data.len() % ENCRYPTION_DATA_UNIT_SIZE, 0);
        for layer in &self.layers {
            layer.encrypt_area(data, ENCRYPTION_DATA_UNIT_SIZE, start_unit as u128);
        }
    }

    pub fn decrypt_data_units(&self, data: &mut [u8], start_unit: u64) {
        debug_assert_eq!(data.len() % ENCRYPTION_DATA_UNIT_SIZE, 0);
        for layer in self.layers.iter().rev() {
            layer.decrypt_area(data, ENCRYPTION_DATA_UNIT_SIZE, start_unit as u128);
        }
    }

    /// Encrypts `data` as a single data unit 0 (volume headers).
    pub fn encrypt_buffer(&self, data: &mut [u8]) {
        for layer in &self.layers {
            layer.encrypt_area(data, data.len(), 0);
        }
    }

    pub fn decrypt_buffer(&self, data: &mut [u8]) {
        for layer in self.layers.iter().rev() {
            layer.decrypt_area(data, data.len(), 0);
        }
    }
}

/// Key state and volume geometry for one format or mount operation.
pub struct CryptoContext {
    algorithm: EncryptionAlgorithm,
    prf: Prf,
    pim: i32,
    iterations: u32,
    master_keydata: SecretBuffer,
    k2: SecretBuffer,
    cipher: Option<SupportedCipher>,
    pub header_version: u16,
    pub required_program_version: u16,
    pub header_flags: u32,
    pub volume_size: u64,
    pub hidden_volume_size: u64,
    pub hidden_volume_offset: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub sector_size: u32,
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs and panic messages.
        f.debug_struct("CryptoContext")
            .field("algorithm", &self.algorithm)
            .field("prf", &self.prf)
            .field("pim", &self.pim)
            .field("iterations", &self.iterations)
            .field("keyed", &self.cipher.is_some())
            .field("volume_size", &self.volume_size)
            .field("hidden_volume_offset", &self.hidden_volume_offset)
            .field("encrypted_area_start", &self.encrypted_area_start)
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

impl CryptoContext {
    pub(crate) fn new(algorithm: EncryptionAlgorithm, prf: Prf, pim: i32, iterations: u32, master_key: &[u8]) -> Self {
        let mut master_keydata = SecretBuffer::new(MASTER_KEYDATA_SIZE);
        let n = master_key.len().min(MASTER_KEYDATA_SIZE);
        master_keydata[..n].copy_from_slice(&master_key[..n]);
        CryptoContext {
            algorithm,
            prf,
            pim,
            iterations,
            master_keydata,
            k2: SecretBuffer::new(algorithm.key_size()),
            cipher: None,
            header_version: 0,
            required_program_version: 0,
            header_flags: 0,
            volume_size: 0,
            hidden_volume_size: 0,
            hidden_volume_offset: 0,
            encrypted_area_start: 0,
            encrypted_area_length: 0,
            sector_size: 0,
        }
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    pub fn prf(&self) -> Prf {
        self.prf
    }

    pub fn pim(&self) -> i32 {
        self.pim
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The full 256-byte key area as stored in the header.
    pub fn master_keydata(&self) -> &[u8] {
        &self.master_keydata
    }

    /// Primary followed by secondary master key.
    pub fn master_key(&self) -> &[u8] {
        &self.master_keydata[..2 * self.algorithm.key_size()]
    }

    pub fn secondary_key(&self) -> &[u8] {
        &self.k2
    }

    pub fn set_secondary_key(&mut self, k2: &[u8]) {
        let ks = self.k2.len();
        self.k2.copy_from_slice(&k2[..ks]);
    }

    /// Keys the cipher with `primary` and the current secondary key.
    pub fn init_cipher(&mut self, primary: &[u8]) -> Result<()> {
        self.cipher = None;
        self.cipher = Some(SupportedCipher::new(self.algorithm, primary, &self.k2)?);
        Ok(())
    }

    /// Restores the secondary key from the master key area and re-keys with the master key.
    pub fn init_master(&mut self) -> Result<()> {
        let ks = self.algorithm.key_size();
        self.k2.copy_from_slice(&self.master_keydata[ks..2 * ks]);
        self.cipher = None;
        self.cipher = Some(SupportedCipher::new(
            self.algorithm,
            &self.master_keydata[..ks],
            &self.master_keydata[ks..2 * ks],
        )?);
        Ok(())
    }

    fn cipher(&self) -> Result<&SupportedCipher> {
        self.cipher.as_ref().ok_or(FormatError::ModeInit)
    }

    pub fn encrypt_data_units(&self, data: &mut [u8], start_unit: u64) -> Result<()> {
        self.cipher()?.encrypt_data_units(data, start_unit);
        Ok(())
    }

    pub fn decrypt_data_units(&self, data: &mut [u8], start_unit: u64) -> Result<()> {
        self.cipher()?.decrypt_data_units(data, start_unit);
        Ok(())
    }
}
