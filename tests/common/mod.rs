#![allow(dead_code)]

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use noxcipher_format::device::VolumeDevice;
use noxcipher_format::host::{
    DeviceProvider, FilesystemFormatter, MountOptions, Notice, OpenedDevice, UserPrompts, VolumeMounter,
};
use noxcipher_format::{
    decode_header, DecodeHints, EncryptionAlgorithm, FileSystem, Password, Prf, Result, VolumeHeader,
};
use noxcipher_format::{CryptoContext, FormatError};

pub const MIB: u64 = 1024 * 1024;

pub fn password(s: &str) -> Password {
    Password::new(s.as_bytes()).unwrap()
}

/// Decodes the header at `offset` of `image` with SHA-512/AES and PIM 1.
pub fn decode_at(image: &[u8], offset: u64, pw: &Password) -> Result<(VolumeHeader, CryptoContext)> {
    let start = offset as usize;
    let hints = DecodeHints { prf: Some(Prf::Sha512), algorithm: Some(EncryptionAlgorithm::Aes), boot: false };
    decode_header(&image[start..start + 512], pw, 1, hints)
}

/// Raw device backed by shared memory so tests can inspect it after the format.
#[derive(Clone, Default)]
pub struct MemDevice {
    pub data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    pub written: Arc<AtomicU64>,
    pub write_delay: Option<Duration>,
    /// Fail every write once this many bytes have been written.
    pub fail_after: Option<u64>,
    /// Added to every non-zero absolute seek.
    pub seek_skew: u64,
}

impl MemDevice {
    pub fn with_size(len: u64) -> Self {
        MemDevice { data: Arc::new(Mutex::new(vec![0u8; len as usize])), ..Default::default() }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Read for MemDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.fail_after {
            if self.written.load(Ordering::SeqCst) >= limit {
                return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
            }
        }
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        let mut data = self.data.lock().unwrap();
        let start = self.pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(0) => 0,
            SeekFrom::Start(n) => n + self.seek_skew,
            SeekFrom::Current(d) => (self.pos as i64 + d) as u64,
            SeekFrom::End(d) => (self.data.lock().unwrap().len() as i64 + d) as u64,
        };
        Ok(self.pos)
    }
}

impl VolumeDevice for MemDevice {}

/// Hands out clones of one [`MemDevice`].
pub struct MemProvider {
    pub device: MemDevice,
    pub shared_access: bool,
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl MemProvider {
    pub fn new(device: MemDevice) -> Self {
        MemProvider { device, shared_access: false, opened: Default::default(), released: Default::default() }
    }
}

impl DeviceProvider for MemProvider {
    fn open_device(&mut self, _path: &Path, _existing_layout: bool) -> Result<OpenedDevice> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedDevice { device: Box::new(self.device.clone()), shared_access: self.shared_access })
    }

    fn release(&mut self, _path: &Path) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct StubMounter {
    pub mounts: Arc<AtomicUsize>,
    pub unmounts: Arc<AtomicUsize>,
}

impl VolumeMounter for StubMounter {
    fn last_available_drive(&self) -> Option<char> {
        Some('Z')
    }

    fn mount(&mut self, drive: char, _: &Path, _: &Password, _: Prf, _: i32, options: &MountOptions) -> io::Result<()> {
        assert_eq!(drive, 'Z');
        assert!(!options.read_only && !options.use_backup_header);
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&mut self, _drive: char) -> bool {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        true
    }
}

pub struct StubOsFormatter {
    pub succeed: bool,
    pub calls: Arc<Mutex<Vec<FileSystem>>>,
}

impl FilesystemFormatter for StubOsFormatter {
    fn format_filesystem(&mut self, _drive: char, _cluster_size: u32, fs: FileSystem) -> bool {
        self.calls.lock().unwrap().push(fs);
        self.succeed
    }
}

#[derive(Default)]
pub struct ScriptedPrompts {
    pub allow_shared: bool,
    pub accept_fat: bool,
    pub notices: Arc<Mutex<Vec<Notice>>>,
}

impl UserPrompts for ScriptedPrompts {
    fn confirm_shared_access(&mut self) -> bool {
        self.allow_shared
    }

    fn ask_fat_fallback(&mut self) -> bool {
        self.accept_fat
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

pub fn is_os_error(err: &FormatError) -> bool {
    matches!(err, FormatError::Io { .. })
}
