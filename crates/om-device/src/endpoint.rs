//! Drive endpoint: page-aligned positional I/O on a file or block device.
//!
//! Sync calls run on the caller's thread with `pread`/`pwrite` semantics.
//! Async calls return futures that resolve on completion; dropping the
//! future abandons delivery of the completion, not the underlying I/O.

use crate::cx_err;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use om_error::{OmError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

const DEFAULT_BUF_ALIGNMENT: usize = 4096;

#[inline]
fn normalized_alignment(requested: usize) -> usize {
    if requested <= 1 {
        1
    } else if requested.is_power_of_two() {
        requested
    } else {
        requested.next_power_of_two()
    }
}

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Remains fully safe by keeping the original backing allocation and
/// exposing an aligned subslice.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        Self::with_alignment(size, DEFAULT_BUF_ALIGNMENT)
    }

    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let alignment = normalized_alignment(alignment);
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let padding = alignment.saturating_sub(1);
        let storage = vec![0_u8; size.saturating_add(padding)];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Positional I/O interface consumed by the device and data layers.
///
/// One endpoint per opened physical device. Implementations must be safe
/// for concurrent `read_at`/`write_at` on a shared handle.
#[async_trait]
pub trait DriveEndpoint: Send + Sync {
    /// Total device length in bytes.
    fn len_bytes(&self) -> u64;

    /// Path the device was opened with, for diagnostics.
    fn devname(&self) -> &str;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn sync_read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn sync_write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Scatter read: fill each buffer in turn from consecutive offsets.
    fn sync_readv_at(&self, offset: u64, bufs: &mut [&mut [u8]]) -> Result<()> {
        let mut pos = offset;
        for buf in bufs {
            self.sync_read_at(pos, buf)?;
            pos += buf.len() as u64;
        }
        Ok(())
    }

    /// Gather write: write each buffer in turn at consecutive offsets.
    fn sync_writev_at(&self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        let mut pos = offset;
        for buf in bufs {
            self.sync_write_at(pos, buf)?;
            pos += buf.len() as u64;
        }
        Ok(())
    }

    /// Flush pending writes to stable storage.
    fn sync_flush(&self) -> Result<()>;

    /// Read `len` bytes from `offset`, resolving when the read completes.
    async fn async_read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `offset`, resolving when the write completes.
    async fn async_write(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Gather-write all `iovs` starting at `offset`.
    async fn async_writev(&self, offset: u64, iovs: Vec<Bytes>) -> Result<()> {
        let mut pos = offset;
        for iov in iovs {
            let len = iov.len() as u64;
            self.async_write(pos, iov).await?;
            pos += len;
        }
        Ok(())
    }

    /// Scatter-read buffers of the given lengths starting at `offset`.
    async fn async_readv(&self, offset: u64, lens: Vec<usize>) -> Result<Vec<Bytes>> {
        let mut out = Vec::with_capacity(lens.len());
        let mut pos = offset;
        for len in lens {
            out.push(self.async_read(pos, len).await?);
            pos += len as u64;
        }
        Ok(out)
    }
}

/// File-backed endpoint using `pread`/`pwrite` style positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not share a seek
/// position, so a single handle serves all reactors. Async calls offload
/// to the blocking pool.
#[derive(Debug, Clone)]
pub struct FileDrive {
    file: Arc<File>,
    devname: String,
    len: u64,
}

impl FileDrive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let devname = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| OmError::device_io(&devname, e))?;
        let len = file
            .metadata()
            .map_err(|e| OmError::device_io(&devname, e))?
            .len();
        trace!(target: "om::device", event = "open", dev = %devname, len_bytes = len);
        Ok(Self {
            file: Arc::new(file),
            devname,
            len,
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| cx_err(&self.devname, "I/O range overflows u64"))?;
        if end > self.len {
            return Err(cx_err(
                &self.devname,
                &format!("I/O out of bounds: offset={offset} len={len} dev_len={}", self.len),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DriveEndpoint for FileDrive {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn devname(&self) -> &str {
        &self.devname
    }

    fn sync_read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| OmError::device_io(&self.devname, e))
    }

    fn sync_write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| OmError::device_io(&self.devname, e))
    }

    fn sync_flush(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| OmError::device_io(&self.devname, e))
    }

    async fn async_read(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.check_bounds(offset, len)?;
        let file = Arc::clone(&self.file);
        let devname = self.devname.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = BytesMut::zeroed(len);
            file.read_exact_at(&mut buf, offset)
                .map_err(|e| OmError::device_io(&devname, e))?;
            Ok(buf.freeze())
        })
        .await
        .map_err(|_| OmError::Cancelled)?
    }

    async fn async_write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        let file = Arc::clone(&self.file);
        let devname = self.devname.clone();
        tokio::task::spawn_blocking(move || {
            file.write_all_at(&data, offset)
                .map_err(|e| OmError::device_io(&devname, e))
        })
        .await
        .map_err(|_| OmError::Cancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_drive(size: usize) -> (tempfile::NamedTempFile, FileDrive) {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(&vec![0_u8; size]).expect("fill");
        f.flush().expect("flush");
        let drive = FileDrive::open(f.path()).expect("open");
        (f, drive)
    }

    #[test]
    fn aligned_buf_is_aligned() {
        let buf = AlignedBuf::with_alignment(8192, 4096);
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn sync_round_trip() {
        let (_f, drive) = temp_drive(64 * 1024);
        let payload = vec![0xAB_u8; 4096];
        drive.sync_write_at(8192, &payload).expect("write");
        let mut back = vec![0_u8; 4096];
        drive.sync_read_at(8192, &mut back).expect("read");
        assert_eq!(back, payload);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let (_f, drive) = temp_drive(4096);
        let mut buf = vec![0_u8; 4096];
        assert!(drive.sync_read_at(1, &mut buf).is_err());
        assert!(drive.sync_write_at(4096, &buf).is_err());
    }

    #[tokio::test]
    async fn async_round_trip() {
        let (_f, drive) = temp_drive(64 * 1024);
        let payload = Bytes::from(vec![0x5A_u8; 8192]);
        drive.async_write(4096, payload.clone()).await.expect("write");
        let back = drive.async_read(4096, 8192).await.expect("read");
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn vectored_round_trip() {
        let (_f, drive) = temp_drive(64 * 1024);
        let iovs = vec![
            Bytes::from(vec![1_u8; 4096]),
            Bytes::from(vec![2_u8; 4096]),
        ];
        drive.async_writev(0, iovs).await.expect("writev");
        let parts = drive.async_readv(0, vec![4096, 4096]).await.expect("readv");
        assert_eq!(parts[0], Bytes::from(vec![1_u8; 4096]));
        assert_eq!(parts[1], Bytes::from(vec![2_u8; 4096]));
    }
}
