//! Interface to the storage driver that backs a mounted volume.
//!
//! Requests are submitted to the device and then waited on. Waiting blocks the
//! calling thread until the transfer completes; there is no way to cancel a
//! request once it has been submitted.

use core::sync::atomic::{AtomicU8, Ordering};

/// A contiguous run of logical blocks: `[begin, begin + length)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LbaRange {
    begin: u64,
    length: u64,
}

impl LbaRange {
    pub const fn new(begin: u64, length: u64) -> Self {
        Self { begin, length }
    }

    pub const fn begin(&self) -> u64 { self.begin }
    pub const fn length(&self) -> u64 { self.length }
    pub const fn end(&self) -> u64 { self.begin + self.length }

    /// Moves the start forward, shrinking the range so that its end stays put.
    pub fn advance_begin_by(&mut self, count: u64) {
        let count = count.min(self.length);
        self.begin += count;
        self.length -= count;
    }

    pub fn set_length(&mut self, length: u64) {
        self.length = length;
    }

    pub const fn contains(&self, lba: u64) -> bool {
        lba >= self.begin && lba < self.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    pub logical_block_size: usize,
    pub block_count: u64,
    pub optimal_read_size: usize,
}

pub enum RequestBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestStatus {
    Pending = 0,
    Done = 1,
    Failed = 2,
}

/// One read or write of `lba_range`, sized `lba_range.length() * logical_block_size` bytes.
pub struct AsyncRequest<'a> {
    buffer: RequestBuffer<'a>,
    lba_range: LbaRange,
    status: AtomicU8,
}

impl<'a> AsyncRequest<'a> {
    pub fn make_read(into: &'a mut [u8], lba_range: LbaRange) -> Self {
        Self { buffer: RequestBuffer::Read(into), lba_range, status: AtomicU8::new(RequestStatus::Pending as u8) }
    }

    pub fn make_write(from: &'a [u8], lba_range: LbaRange) -> Self {
        Self { buffer: RequestBuffer::Write(from), lba_range, status: AtomicU8::new(RequestStatus::Pending as u8) }
    }

    pub fn lba_range(&self) -> LbaRange { self.lba_range }

    pub fn is_write(&self) -> bool {
        matches!(self.buffer, RequestBuffer::Write(_))
    }

    pub fn buffer(&mut self) -> &mut RequestBuffer<'a> {
        &mut self.buffer
    }

    /// Called by the device once the transfer has finished.
    pub fn complete(&self, success: bool) {
        let status = if success { RequestStatus::Done } else { RequestStatus::Failed };
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.status.load(Ordering::Acquire) != RequestStatus::Pending as u8
    }

    /// Blocks until the device has completed the request.
    ///
    /// A failed transfer leaves the on-disk state unknown, so it halts the kernel.
    pub fn wait(&self) {
        loop {
            match self.status.load(Ordering::Acquire) {
                s if s == RequestStatus::Done as u8 => return,
                s if s == RequestStatus::Failed as u8 => panic!(
                    "FAT32: storage request for LBA {}..{} failed",
                    self.lba_range.begin(),
                    self.lba_range.end()
                ),
                _ => core::hint::spin_loop(),
            }
        }
    }
}

pub trait StorageDevice: Send + Sync {
    fn query_info(&self) -> StorageInfo;

    /// Starts the transfer described by `request`. The device calls
    /// [`AsyncRequest::complete`] when done, possibly before returning.
    fn submit_request(&self, request: &mut AsyncRequest<'_>);
}

/// Submits a read of `range` into `buffer` and waits for it.
pub fn read_blocking(device: &dyn StorageDevice, buffer: &mut [u8], range: LbaRange) {
    let mut request = AsyncRequest::make_read(buffer, range);
    device.submit_request(&mut request);
    request.wait();
}

/// Submits a write of `buffer` to `range` and waits for it.
pub fn write_blocking(device: &dyn StorageDevice, buffer: &[u8], range: LbaRange) {
    let mut request = AsyncRequest::make_write(buffer, range);
    device.submit_request(&mut request);
    request.wait();
}
