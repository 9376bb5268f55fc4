//! Host storage for a volume: a container file or a raw device handle.

use std::fs::{File, FileTimes, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use crate::error::{FormatError, Result};

/// Access and modification times captured before touching a host file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTimestamps {
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

pub trait VolumeDevice: Read + Write + Seek + Send {
    /// Sets the length of the backing store. Devices that cannot resize keep the default.
    fn set_len(&mut self, _len: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "device cannot be resized"))
    }

    /// Reserves `len` bytes. `sparse` asks for the space not to be allocated up front.
    fn preallocate(&mut self, len: u64, _sparse: bool) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }

    fn timestamps(&self) -> io::Result<Option<HostTimestamps>> {
        Ok(None)
    }

    fn restore_timestamps(&mut self, _times: HostTimestamps) -> io::Result<()> {
        Ok(())
    }
}

impl VolumeDevice for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn preallocate(&mut self, len: u64, sparse: bool) -> io::Result<()> {
        if sparse {
            // Extending without writing leaves a hole on every filesystem that supports them.
            return File::set_len(self, len);
        }
        allocate_file(self, len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn timestamps(&self) -> io::Result<Option<HostTimestamps>> {
        let meta = self.metadata()?;
        Ok(Some(HostTimestamps { accessed: meta.accessed()?, modified: meta.modified()? }))
    }

    fn restore_timestamps(&mut self, times: HostTimestamps) -> io::Result<()> {
        self.set_times(FileTimes::new().set_accessed(times.accessed).set_modified(times.modified))
    }
}

#[cfg(target_os = "linux")]
fn allocate_file(file: &File, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: valid open descriptor; posix_fallocate does not retain it.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    match rc {
        0 => Ok(()),
        // Filesystems without fallocate support: fall back to a plain extend.
        libc::EOPNOTSUPP | libc::EINVAL => file.set_len(len),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate_file(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)
}

/// In-memory volume, used for tests and for staging images.
impl VolumeDevice for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Opens or creates a container file.
///
/// `existing` opens without truncating (hidden volumes and the FAT retry pass);
/// otherwise the file is created or truncated.
pub fn open_container(path: &Path, existing: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if existing {
        log::debug!("opening existing container {}", path.display());
    } else {
        opts.create(true).truncate(true);
        log::debug!("creating container {}", path.display());
    }
    opts.open(path).map_err(|e| FormatError::io("open volume file", e))
}

/// Seeks to `offset` and verifies that the device really landed there.
pub fn seek_exact(device: &mut dyn VolumeDevice, offset: u64) -> Result<()> {
    let pos = device.seek(SeekFrom::Start(offset)).map_err(|e| FormatError::io("seek", e))?;
    if pos != offset {
        log::error!("seek to {} landed at {}", offset, pos);
        return Err(FormatError::io(
            "seek",
            io::Error::new(io::ErrorKind::UnexpectedEof, format!("seek to {} landed at {}", offset, pos)),
        ));
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes, zero-filling whatever lies past the end of the device.
pub fn read_or_zero(device: &mut dyn VolumeDevice, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match device.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FormatError::io("read", e)),
        }
    }
    buf[filled..].fill(0);
    Ok(())
}
