use blake2::Blake2s256;
use hmac::{Hmac, SimpleHmac};
use pbkdf2::pbkdf2;
use ripemd::Ripemd160;
use sha2::{Sha256, Sha512};
use streebog::Streebog512;
use whirlpool::Whirlpool;

use crate::consts::{MAX_BOOT_PIM_VALUE, MAX_PIM_VALUE};
use crate::error::{FormatError, Result};

/// Header key derivation function (PBKDF2 with the given HMAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prf {
    Sha512,
    Whirlpool,
    Sha256,
    Ripemd160,
    Streebog,
    Blake2s,
}

impl Prf {
    /// Order in which a mount tries the PRFs.
    pub const ALL: [Prf; 6] = [
        Prf::Sha512,
        Prf::Sha256,
        Prf::Blake2s,
        Prf::Whirlpool,
        Prf::Streebog,
        Prf::Ripemd160,
    ];

    pub fn id(self) -> u8 {
        match self {
            Prf::Sha512 => 1,
            Prf::Whirlpool => 2,
            Prf::Sha256 => 3,
            Prf::Ripemd160 => 4,
            Prf::Streebog => 5,
            Prf::Blake2s => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Prf::Sha512 => "HMAC-SHA-512",
            Prf::Whirlpool => "HMAC-Whirlpool",
            Prf::Sha256 => "HMAC-SHA-256",
            Prf::Ripemd160 => "HMAC-RIPEMD-160",
            Prf::Streebog => "HMAC-Streebog",
            Prf::Blake2s => "HMAC-BLAKE2s-256",
        }
    }

    /// PBKDF2 iteration count for a PIM value. Negative PIMs count as 0.
    ///
    /// Boot headers use the lighter pre-boot schedule for the PRFs that have one.
    /// A PIM above [`MAX_PIM_VALUE`] (or [`MAX_BOOT_PIM_VALUE`] for boot headers)
    /// is rejected.
    pub fn iterations(self, pim: i32, boot: bool) -> Result<u32> {
        let limit = if boot { MAX_BOOT_PIM_VALUE } else { MAX_PIM_VALUE };
        if pim > limit {
            log::error!("PIM {} exceeds {}", pim, limit);
            return Err(FormatError::ParameterIncorrect("PIM out of range"));
        }
        let pim = pim.max(0) as u32;
        let scaled = |base: u32, factor: u32| {
            pim.checked_mul(factor)
                .and_then(|n| n.checked_add(base))
                .ok_or(FormatError::ParameterIncorrect("PIM out of range"))
        };

        match self {
            Prf::Sha512 | Prf::Whirlpool => match pim {
                0 => Ok(500_000),
                _ => scaled(15_000, 1000),
            },
            Prf::Sha256 | Prf::Blake2s | Prf::Streebog => match (boot, pim) {
                (true, 0) => Ok(200_000),
                (true, _) => scaled(0, 2048),
                (false, 0) => Ok(500_000),
                (false, _) => scaled(15_000, 1000),
            },
            Prf::Ripemd160 => match (boot, pim) {
                (true, 0) => Ok(327_661),
                (true, _) => scaled(0, 2048),
                (false, 0) => Ok(655_331),
                (false, _) => scaled(15_000, 1000),
            },
        }
    }

    /// Fills `out` with PBKDF2 output for this PRF.
    pub fn derive_key(self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
        let res = match self {
            Prf::Sha512 => pbkdf2::<Hmac<Sha512>>(password, salt, iterations, out),
            Prf::Sha256 => pbkdf2::<Hmac<Sha256>>(password, salt, iterations, out),
            Prf::Whirlpool => pbkdf2::<Hmac<Whirlpool>>(password, salt, iterations, out),
            Prf::Ripemd160 => pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, out),
            Prf::Streebog => pbkdf2::<Hmac<Streebog512>>(password, salt, iterations, out),
            // BLAKE2s buffers lazily, which the eager Hmac wrapper does not accept.
            Prf::Blake2s => pbkdf2::<SimpleHmac<Blake2s256>>(password, salt, iterations, out),
        };
        res.map_err(|_| FormatError::ParameterIncorrect("invalid key derivation output length"))
    }
}

impl TryFrom<u8> for Prf {
    type Error = FormatError;

    fn try_from(id: u8) -> Result<Self> {
        Prf::ALL
            .into_iter()
            .find(|p| p.id() == id)
            .ok_or(FormatError::ParameterIncorrect("unknown PRF id"))
    }
}
