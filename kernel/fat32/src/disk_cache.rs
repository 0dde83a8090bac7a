//! Write-back block cache over a device and an LBA range.
//!
//! Blocks are addressed by their index within the range, in units of the
//! filesystem block size (a FAT entry for the FAT cache, a cluster for the data
//! cache). Disk I/O is never smaller than a page: filesystem blocks below
//! [`PAGE_SIZE`] are grouped, so one cached page holds several of them. Larger
//! filesystem blocks are cached one per entry.
//!
//! Eviction is least-recently-used. Dirty blocks reach the disk when evicted or
//! on [`DiskCache::flush`]. Memory grows on demand up to the capacity and is
//! never returned.
//!
//! The cache does no locking of its own, the owner wraps it in a mutex.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::num::NonZeroUsize;

use lru::LruCache;

use crate::consts::PAGE_SIZE;
use crate::storage::{self, LbaRange, StorageDevice};

struct CachedBlock {
    buffer: Box<[u8]>,
    dirty: bool,
}

/// Extra copies every written-back block is duplicated to, `stride` LBAs apart.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mirrors {
    pub count: u32,
    pub stride: u64,
}

/// Where cache blocks live on the device.
struct Backing {
    device: Arc<dyn StorageDevice>,
    fs_lba_range: LbaRange,
    mirrors: Mirrors,
    logical_block_size: usize,
    fs_block_size: usize,
    io_size: usize,
}

impl Backing {
    fn block_to_first_lba(&self, block_index: u64) -> u64 {
        self.fs_lba_range.begin() + block_index * self.fs_block_size as u64 / self.logical_block_size as u64
    }

    /// The LBAs backing the cache block that starts at `first_block`, clipped to the range.
    fn block_to_lba_range(&self, first_block: u64) -> LbaRange {
        let begin = self.block_to_first_lba(first_block);
        let lbas_per_io = (self.io_size / self.logical_block_size) as u64;
        let length = lbas_per_io.min(self.fs_lba_range.end().saturating_sub(begin));
        assert!(length != 0, "DiskCache: block {} is outside of the cached range", first_block);
        LbaRange::new(begin, length)
    }

    fn read(&self, first_block: u64, buffer: &mut [u8]) {
        let range = self.block_to_lba_range(first_block);
        let bytes = range.length() as usize * self.logical_block_size;
        storage::read_blocking(&*self.device, &mut buffer[..bytes], range);
        buffer[bytes..].fill(0);
    }

    fn write_back(&self, first_block: u64, buffer: &[u8]) {
        let range = self.block_to_lba_range(first_block);
        let bytes = range.length() as usize * self.logical_block_size;

        storage::write_blocking(&*self.device, &buffer[..bytes], range);
        for copy in 1..=self.mirrors.count as u64 {
            let mirror = LbaRange::new(range.begin() + copy * self.mirrors.stride, range.length());
            storage::write_blocking(&*self.device, &buffer[..bytes], mirror);
        }
    }
}

pub struct DiskCache {
    backing: Backing,
    fs_blocks_per_io: u64,
    /// Keyed by the first filesystem block of each cache block.
    blocks: LruCache<u64, CachedBlock>,
}

impl DiskCache {
    /// `block_capacity` is expressed in filesystem blocks.
    pub fn new(device: Arc<dyn StorageDevice>, fs_lba_range: LbaRange, fs_block_size: usize, block_capacity: usize) -> Self {
        Self::with_mirrors(device, fs_lba_range, fs_block_size, block_capacity, Mirrors::default())
    }

    pub fn with_mirrors(
        device: Arc<dyn StorageDevice>,
        fs_lba_range: LbaRange,
        fs_block_size: usize,
        block_capacity: usize,
        mirrors: Mirrors,
    ) -> Self {
        let info = device.query_info();
        assert!(
            info.logical_block_size == 512 || info.logical_block_size == 4096,
            "DiskCache: unsupported logical block size {}",
            info.logical_block_size
        );
        assert!(fs_block_size.is_power_of_two(), "DiskCache: block size {} is not a power of two", fs_block_size);

        let io_size = if fs_block_size >= PAGE_SIZE {
            assert!(fs_block_size % info.logical_block_size == 0);
            fs_block_size
        } else {
            PAGE_SIZE
        };
        let fs_blocks_per_io = (io_size / fs_block_size) as u64;
        let capacity = NonZeroUsize::new(block_capacity / fs_blocks_per_io as usize).unwrap_or(NonZeroUsize::MIN);

        let lbas_per_io = (io_size / info.logical_block_size) as u64;
        if info.logical_block_size == 512 && fs_lba_range.begin() % lbas_per_io != 0 {
            log::warn!(
                "DiskCache: range starts at an unaligned logical block {}, expect poor performance",
                fs_lba_range.begin()
            );
        }

        Self {
            backing: Backing {
                device,
                fs_lba_range,
                mirrors,
                logical_block_size: info.logical_block_size,
                fs_block_size,
                io_size,
            },
            fs_blocks_per_io,
            blocks: LruCache::new(capacity),
        }
    }

    pub fn fs_block_size(&self) -> usize { self.backing.fs_block_size }

    /// Capacity in cache blocks (pages, or filesystem blocks when those are larger).
    pub fn capacity(&self) -> usize { self.blocks.cap().get() }

    pub fn cached_count(&self) -> usize { self.blocks.len() }

    /// Absolute LBA holding the start of `block_index`.
    pub fn block_to_first_lba(&self, block_index: u64) -> u64 {
        self.backing.block_to_first_lba(block_index)
    }

    /// Returns the cache block holding `block_index`, loading it on a miss, and
    /// the byte offset of that filesystem block within it.
    fn cached_block(&mut self, block_index: u64) -> (&mut CachedBlock, usize) {
        let first_block = block_index - block_index % self.fs_blocks_per_io;
        let offset = (block_index - first_block) as usize * self.backing.fs_block_size;

        if !self.blocks.contains(&first_block) {
            let mut buffer = if self.blocks.len() < self.blocks.cap().get() {
                vec![0u8; self.backing.io_size].into_boxed_slice()
            } else {
                match self.blocks.pop_lru() {
                    Some((evicted, block)) => {
                        if block.dirty {
                            self.backing.write_back(evicted, &block.buffer);
                        }
                        block.buffer
                    }
                    None => vec![0u8; self.backing.io_size].into_boxed_slice(),
                }
            };

            self.backing.read(first_block, &mut buffer);
            self.blocks.put(first_block, CachedBlock { buffer, dirty: false });
        }

        match self.blocks.get_mut(&first_block) {
            Some(block) => (block, offset),
            None => unreachable!("DiskCache: block {} vanished after being loaded", first_block),
        }
    }

    pub fn read_one(&mut self, block_index: u64, offset: usize, buffer: &mut [u8]) {
        debug_assert!(offset + buffer.len() <= self.backing.fs_block_size);
        let (block, base) = self.cached_block(block_index);
        let begin = base + offset;
        buffer.copy_from_slice(&block.buffer[begin..begin + buffer.len()]);
    }

    pub fn write_one(&mut self, block_index: u64, offset: usize, buffer: &[u8]) {
        debug_assert!(offset + buffer.len() <= self.backing.fs_block_size);
        let (block, base) = self.cached_block(block_index);
        let begin = base + offset;
        block.buffer[begin..begin + buffer.len()].copy_from_slice(buffer);
        block.dirty = true;
    }

    /// Zeroes `count` whole filesystem blocks starting at `block_index`.
    pub fn zero_fill(&mut self, block_index: u64, count: u64) {
        let fs_block_size = self.backing.fs_block_size;
        for index in block_index..block_index + count {
            let (block, base) = self.cached_block(index);
            block.buffer[base..base + fs_block_size].fill(0);
            block.dirty = true;
        }
    }

    /// Writes every dirty block back to the disk. Returns how many were written.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        for (&first_block, block) in self.blocks.iter_mut() {
            if block.dirty {
                self.backing.write_back(first_block, &block.buffer);
                block.dirty = false;
                flushed += 1;
            }
        }
        flushed
    }
}
