//! State shared by everything that touches a mounted volume: the geometry, the
//! FAT table and the data cache, each behind its own lock.
//!
//! The helpers here take one of the two locks for the duration of a single call,
//! so they never hold both at once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kernel_api_types::ErrorCode;

use crate::consts::RESERVED_CLUSTER_COUNT;
use crate::disk_cache::DiskCache;
use crate::fat_table::{FatTable, FreeMode};
use crate::storage::{LbaRange, StorageDevice};
use crate::structures::Ebpb;
use crate::time::Clock;

pub(crate) struct Volume {
    pub device: Arc<dyn StorageDevice>,
    pub lba_range: LbaRange,
    pub ebpb: Ebpb,
    pub bytes_per_cluster: usize,
    pub root_cluster: u32,
    pub fat: spin::Mutex<FatTable>,
    pub data: spin::Mutex<DiskCache>,
    pub clock: Arc<dyn Clock>,
}

impl Volume {
    fn data_block(cluster: u32) -> u64 {
        assert!(cluster >= RESERVED_CLUSTER_COUNT, "FAT32: attempted to access data of cluster {}", cluster);
        (cluster - RESERVED_CLUSTER_COUNT) as u64
    }

    pub fn read_data(&self, cluster: u32, offset: usize, buffer: &mut [u8]) {
        self.data.lock().read_one(Self::data_block(cluster), offset, buffer);
    }

    pub fn write_data(&self, cluster: u32, offset: usize, buffer: &[u8]) {
        self.data.lock().write_one(Self::data_block(cluster), offset, buffer);
    }

    pub fn zero_cluster(&self, cluster: u32) {
        self.data.lock().zero_fill(Self::data_block(cluster), 1);
    }

    pub fn next_in_chain(&self, cluster: u32) -> Option<u32> {
        self.fat.lock().next_in_chain(cluster)
    }

    pub fn nth_cluster_in_chain(&self, start: u32, n: u32) -> u32 {
        self.fat.lock().nth_cluster_in_chain(start, n)
    }

    /// `(length, last cluster)` of the chain starting at `start`.
    pub fn chain_tail(&self, start: u32) -> (u32, u32) {
        let mut fat = self.fat.lock();
        let length = fat.chain_length(start);
        (length, fat.nth_cluster_in_chain(start, length - 1))
    }

    pub fn allocate_cluster_chain(&self, count: u32, link_to: Option<u32>) -> Result<Vec<u32>, ErrorCode> {
        self.fat.lock().allocate_cluster_chain(count, link_to)
    }

    pub fn free_cluster_chain_starting_at(&self, first: u32, mode: FreeMode) {
        self.fat.lock().free_cluster_chain_starting_at(first, mode)
    }
}
