//! Double-buffered device writer.
//!
//! The producer fills and encrypts a local scratch buffer, then hands a copy
//! to a dedicated writer thread. A single transfer buffer travels between
//! the two sides over two rendezvous channels: "full" towards the writer and
//! "empty" back to the producer together with the result of the write. Whoever
//! holds the buffer owns it.

use std::io::{self, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, Scope, ScopedJoinHandle};

use zeroize::{Zeroize, Zeroizing};

use crate::consts::ENCRYPTION_DATA_UNIT_SIZE;
use crate::crypto::CryptoContext;
use crate::device::VolumeDevice;
use crate::error::{FormatError, Result};
use crate::fat::SectorSink;

/// A buffer on its way back from the writer, with the outcome of writing it.
struct Completion {
    buffer: Vec<u8>,
    result: io::Result<()>,
}

/// Producer side of the writer thread.
pub struct WritePipeline<'scope> {
    // Taken on shutdown; dropping it tells the writer to exit.
    full_tx: Option<SyncSender<Vec<u8>>>,
    empty_rx: Receiver<Completion>,
    // Present while the producer holds the "empty" signal.
    buffer: Option<Vec<u8>>,
    worker: Option<ScopedJoinHandle<'scope, ()>>,
    // Buffers handed to the writer so far.
    submitted: u64,
}

impl<'scope> WritePipeline<'scope> {
    /// Spawns the writer thread inside `scope`. It borrows `device` until the scope ends.
    pub fn start<'env, W>(scope: &'scope Scope<'scope, 'env>, device: &'scope mut W, buffer_size: usize) -> Result<Self>
    where
        W: Write + Send + ?Sized,
    {
        // Zero capacity: a send returns only once the writer has taken the buffer.
        let (full_tx, full_rx) = sync_channel::<Vec<u8>>(0);
        // One slot, so the writer can report back without waiting for the producer.
        let (empty_tx, empty_rx) = sync_channel::<Completion>(1);

        let worker = thread::Builder::new()
            .name("volume-format-writer".into())
            .spawn_scoped(scope, move || {
                raise_priority();
                // Runs until the producer drops its sender.
                while let Ok(buffer) = full_rx.recv() {
                    let result = device.write_all(&buffer);
                    log::trace!("writer thread wrote {} bytes", buffer.len());
                    if empty_tx.send(Completion { buffer, result }).is_err() {
                        // Producer is gone.
                        break;
                    }
                }
            })
            .map_err(|e| FormatError::io("start write thread", e))?;

        log::debug!("write pipeline started with a {} byte buffer", buffer_size);
        Ok(WritePipeline {
            full_tx: Some(full_tx),
            empty_rx,
            buffer: Some(Vec::with_capacity(buffer_size)),
            worker: Some(worker),
            submitted: 0,
        })
    }

    /// Waits for the previous write, then queues `data` for writing.
    ///
    /// An error from the previous write is returned here; the pipeline must
    /// not be used for further submissions after that.
    pub fn submit(&mut self, data: &[u8]) -> Result<()> {
        let mut buffer = self.wait_empty()?;
        buffer.clear();
        buffer.extend_from_slice(data);

        let tx = self
            .full_tx
            .as_ref()
            .ok_or(FormatError::ParameterIncorrect("write pipeline already stopped"))?;
        if let Err(returned) = tx.send(buffer) {
            // The writer exited early; wipe the copy it never took.
            let mut buffer = returned.0;
            buffer.zeroize();
            return Err(writer_gone());
        }
        self.submitted += 1;
        Ok(())
    }

    /// Returns the transfer buffer once the writer is done with it.
    fn wait_empty(&mut self) -> Result<Vec<u8>> {
        // Nothing in flight.
        if let Some(buffer) = self.buffer.take() {
            return Ok(buffer);
        }
        let Completion { buffer, result } = self.empty_rx.recv().map_err(|_| writer_gone())?;
        match result {
            Ok(()) => Ok(buffer),
            Err(e) => {
                log::error!("device write failed in writer thread: {}", e);
                // Hand the buffer back so stop() can still wipe it.
                self.buffer = Some(buffer);
                Err(FormatError::io("write volume data", e))
            }
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Drains the in-flight write, stops the writer and joins it.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        // Collect the in-flight buffer and the result of its write.
        let drained = if self.worker.is_some() { self.wait_empty() } else { Ok(Vec::new()) };
        let last = drained.map(|mut buffer| buffer.zeroize());

        // Dropping the sender is the exit request.
        self.full_tx = None;
        // A panic in the writer shows up as a failed join.
        let joined = match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| writer_gone()),
            None => Ok(()),
        };
        if let Some(mut buffer) = self.buffer.take() {
            buffer.zeroize();
        }
        log::debug!("write pipeline stopped after {} buffers", self.submitted);
        last.and(joined)
    }
}

impl Drop for WritePipeline<'_> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.shutdown() {
                log::warn!("write pipeline dropped with error: {}", e);
            }
        }
    }
}

fn writer_gone() -> FormatError {
    FormatError::io("write thread", io::Error::new(io::ErrorKind::BrokenPipe, "writer thread terminated"))
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    // Per-thread nice value on Linux. Needs privileges; failure only costs throughput.
    // SAFETY: plain syscall on the calling thread.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if rc != 0 {
        log::debug!("could not raise writer thread priority: {}", io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority() {}

/// Where encrypted buffers go.
pub enum WriteTarget<'a, 'scope> {
    Direct(&'a mut dyn VolumeDevice),
    Pipeline(WritePipeline<'scope>),
}

/// Accumulates plaintext sectors and flushes them encrypted, in order.
pub struct SectorWriter<'a, 'scope> {
    ctx: &'a CryptoContext,
    target: WriteTarget<'a, 'scope>,
    // Plaintext sectors waiting to be encrypted, wiped on drop.
    scratch: Zeroizing<Vec<u8>>,
    // Flush threshold in bytes.
    buffer_size: usize,
    sector_size: usize,
    // Absolute number of the next sector to be written.
    cursor: u64,
}

impl<'a, 'scope> SectorWriter<'a, 'scope> {
    pub fn new(
        ctx: &'a CryptoContext,
        target: WriteTarget<'a, 'scope>,
        buffer_size: usize,
        sector_size: u32,
        first_sector: u64,
    ) -> Self {
        SectorWriter {
            ctx,
            target,
            scratch: Zeroizing::new(Vec::with_capacity(buffer_size)),
            buffer_size,
            sector_size: sector_size as usize,
            cursor: first_sector,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn write_sector(&mut self, sector: &[u8]) -> Result<()> {
        debug_assert_eq!(sector.len(), self.sector_size);
        self.scratch.extend_from_slice(sector);
        // Counts buffered sectors too; flush() works back from it.
        self.cursor += 1;
        if self.scratch.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Encrypts what has been buffered and passes it on.
    ///
    /// The first data unit is derived from the absolute position of the
    /// buffer, not from how many buffers went before it.
    pub fn flush(&mut self) -> Result<()> {
        if self.scratch.is_empty() {
            return Ok(());
        }
        // Byte offset just past the buffered data, then the unit of its first byte.
        let end = self.cursor * self.sector_size as u64;
        let start_unit = (end - self.scratch.len() as u64) / ENCRYPTION_DATA_UNIT_SIZE as u64;
        self.ctx.encrypt_data_units(&mut self.scratch, start_unit)?;

        // Only ciphertext leaves this writer.

        match &mut self.target {
            WriteTarget::Direct(device) => device
                .write_all(&self.scratch)
                .map_err(|e| FormatError::io("write volume data", e))?,
            WriteTarget::Pipeline(pipeline) => pipeline.submit(&self.scratch)?,
        }
        self.scratch.clear();
        Ok(())
    }

    /// Flushes the tail, stops the pipeline if any, and returns the cursor.
    pub fn finish(mut self) -> Result<u64> {
        let flushed = self.flush();
        let cursor = self.cursor;
        // Stop the writer even after a failed flush so the thread is always joined.
        let stopped = match self.target {
            WriteTarget::Pipeline(pipeline) => pipeline.stop(),
            WriteTarget::Direct(device) => device.flush().map_err(|e| FormatError::io("flush volume data", e)),
        };
        flushed.and(stopped).map(|_| cursor)
    }
}

impl SectorSink for SectorWriter<'_, '_> {
    fn write_sector(&mut self, sector: &[u8]) -> Result<()> {
        SectorWriter::write_sector(self, sector)
    }
}
