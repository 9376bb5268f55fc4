//! Heap buffers for key material: pinned in RAM while alive, zeroed on drop.

use std::fmt;
use std::ops::{Deref, DerefMut};

use zeroize::Zeroize;

use crate::consts::MAX_PASSWORD;
use crate::error::{FormatError, Result};

pub struct SecretBuffer {
    bytes: Box<[u8]>,
    locked: bool,
}

impl SecretBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        let bytes = vec![0u8; len].into_boxed_slice();
        let locked = lock_pages(&bytes);
        if !locked && len > 0 {
            log::debug!("could not lock {} secret bytes in memory", len);
        }
        SecretBuffer { bytes, locked }
    }

    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new(src.len());
        buf.bytes.copy_from_slice(src);
        buf
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Deref for SecretBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for SecretBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if self.locked {
            unlock_pages(&self.bytes);
        }
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED; {}])", self.bytes.len())
    }
}

#[cfg(unix)]
fn lock_pages(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // SAFETY: the range is a live allocation owned by the caller.
    unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) == 0 }
}

#[cfg(unix)]
fn unlock_pages(bytes: &[u8]) {
    // SAFETY: same range that was passed to mlock.
    unsafe {
        libc::munlock(bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

#[cfg(not(unix))]
fn lock_pages(_bytes: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_pages(_bytes: &[u8]) {}

/// A volume password. At most 128 bytes, held in a [`SecretBuffer`].
pub struct Password(SecretBuffer);

impl Password {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PASSWORD {
            return Err(FormatError::ParameterIncorrect("password longer than 128 bytes"));
        }
        Ok(Password(SecretBuffer::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        Password(SecretBuffer::from_slice(&self.0))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}
