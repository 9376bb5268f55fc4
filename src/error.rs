use std::io;

use thiserror::Error;

use crate::header::HeaderError;

/// Everything that can stop a format operation.
///
/// Each variant maps onto one integer [`Status`] code so callers that only
/// speak the numeric protocol can still tell failure classes apart.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Seek, read, write or preallocation failure on the host device or file.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The random source failed; nothing keyed from it can be trusted.
    #[error("random number generator failure")]
    WeakKeyOrRngFailure,

    #[error("cipher initialization failed")]
    CipherInit,

    #[error("cipher mode initialization failed")]
    ModeInit,

    #[error("could not allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("volume size {size} is out of range")]
    VolumeSizeWrong { size: u64 },

    #[error("sector size {0} is not supported")]
    SectorSizeUnsupported(u32),

    #[error("incorrect parameter: {0}")]
    ParameterIncorrect(&'static str),

    #[error("wrong password, PIM, PRF or encryption algorithm")]
    PasswordWrong,

    #[error("invalid volume header: {0}")]
    InvalidHeader(#[from] HeaderError),

    #[error("no free drive letter available")]
    NoFreeDrives,

    #[error("mounting the new volume failed")]
    MountFailed,

    #[error("operation cancelled")]
    UserAbort,

    /// Already communicated to the user; the caller must not show another message.
    #[error("failed ({0}); already reported")]
    DontReport(&'static str),
}

impl FormatError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        FormatError::Io { context, source }
    }

    /// Underlying OS error number, when the failure came from the OS.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            FormatError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn status(&self) -> Status {
        Status::from(self)
    }
}

/// Integer result codes of the format engine, numbered as in VeraCrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    OsError = 1,
    OutOfMemory = 2,
    PasswordWrong = 3,
    VolFormatBad = 4,
    VolSizeWrong = 7,
    CipherInitFailure = 17,
    CipherInitWeakKey = 18,
    SectorSizeIncompatible = 20,
    NoFreeDrives = 22,
    VolMountFailed = 24,
    ModeInitFailed = 27,
    DontReport = 28,
    ParameterIncorrect = 30,
    UserAbort = 33,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<&FormatError> for Status {
    fn from(err: &FormatError) -> Self {
        match err {
            FormatError::Io { .. } => Status::OsError,
            FormatError::WeakKeyOrRngFailure => Status::CipherInitWeakKey,
            FormatError::CipherInit => Status::CipherInitFailure,
            FormatError::ModeInit => Status::ModeInitFailed,
            FormatError::OutOfMemory(_) => Status::OutOfMemory,
            FormatError::VolumeSizeWrong { .. } => Status::VolSizeWrong,
            FormatError::SectorSizeUnsupported(_) => Status::SectorSizeIncompatible,
            FormatError::ParameterIncorrect(_) => Status::ParameterIncorrect,
            FormatError::PasswordWrong => Status::PasswordWrong,
            FormatError::InvalidHeader(_) => Status::VolFormatBad,
            FormatError::NoFreeDrives => Status::NoFreeDrives,
            FormatError::MountFailed => Status::VolMountFailed,
            FormatError::UserAbort => Status::UserAbort,
            FormatError::DontReport(_) => Status::DontReport,
        }
    }
}

impl From<Result<(), FormatError>> for Status {
    fn from(result: Result<(), FormatError>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(e) => Status::from(&e),
        }
    }
}

pub type Result<T, E = FormatError> = std::result::Result<T, E>;
