//! Creates VeraCrypt-compatible encrypted volumes in container files and on raw devices.
//!
//! [`VolumeFormatter::format`] writes the primary header, fills the data area,
//! writes the backup header and the decoy hidden-volume headers, and hands
//! NTFS/exFAT/ReFS creation to an OS formatter through [`FormatHooks`].

pub mod consts;
pub mod crypto;
pub mod device;
pub mod error;
pub mod fat;
pub mod formatter;
pub mod header;
pub mod host;
pub mod pipeline;
pub mod prf;
pub mod rng;
pub mod secret;
pub mod session;
pub mod volume;

pub use crypto::{CryptoContext, EncryptionAlgorithm};
pub use device::VolumeDevice;
pub use error::{FormatError, Result, Status};
pub use header::{decode_header, encode_header, DecodeHints, HeaderBlock, HeaderParams, VolumeHeader};
pub use prf::Prf;
pub use rng::{OsRandom, RandomSource};
pub use secret::Password;
pub use session::{FormatSession, SessionConfig, WriteThreadMode};
pub use volume::{
    format_volume, volume_data_area_size, FileSystem, FormatHooks, FormatReport, FormatRequest, FormatStage,
    VolumeFormatter, VolumeGeometry,
};

/// Routes `log` output to logcat. Trace in debug builds, Info in release.
#[cfg(target_os = "android")]
pub fn init_logger() {
    use android_logger::Config;
    use log::LevelFilter;

    #[cfg(debug_assertions)]
    let level = LevelFilter::Trace;
    #[cfg(not(debug_assertions))]
    let level = LevelFilter::Info;

    android_logger::init_once(Config::default().with_max_level(level));
    log::info!("logger initialized");
}
