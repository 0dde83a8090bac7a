//! The file allocation table: entry classification, chain walking, and the
//! cluster allocator with its free counter and scan hint.
//!
//! A `FatTable` is only ever used behind the volume's FAT lock.

use alloc::vec::Vec;

use kernel_api_types::ErrorCode;

use crate::consts::{
    BAD_CLUSTER, END_OF_CHAIN_INDICATOR_ENTRY, END_OF_CHAIN_MIN_CLUSTER, FAT_ENTRY_MASK, FREE_CLUSTER,
    RESERVED_CLUSTER, RESERVED_CLUSTER_COUNT,
};
use crate::disk_cache::DiskCache;

const ENTRY_SIZE: usize = core::mem::size_of::<u32>();

/// Used when FAT[1] doesn't hold a usable end-of-chain value.
const DEFAULT_END_OF_CHAIN: u32 = 0x0FFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatEntryType {
    Free,
    Reserved,
    Bad,
    EndOfChain,
    Link,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeMode {
    /// The first cluster stays allocated and becomes the end of the chain.
    KeepFirst,
    IncludingFirst,
}

pub struct FatTable {
    cache: DiskCache,
    cluster_count: u32,
    free_clusters: u32,
    next_free: u32,
    end_of_chain: u32,
}

impl FatTable {
    /// Wraps the FAT cache of a volume with `cluster_count` data clusters.
    /// The free counter starts at zero until [`Self::set_free_state`] or
    /// [`Self::recompute_free_state`] is called.
    pub fn new(cache: DiskCache, cluster_count: u32) -> Self {
        let mut table = Self {
            cache,
            cluster_count,
            free_clusters: 0,
            next_free: RESERVED_CLUSTER_COUNT,
            end_of_chain: DEFAULT_END_OF_CHAIN,
        };

        let end_of_chain = table.entry_at(END_OF_CHAIN_INDICATOR_ENTRY);
        if end_of_chain >= END_OF_CHAIN_MIN_CLUSTER {
            table.end_of_chain = end_of_chain;
        } else {
            log::warn!("FAT32: FAT[1] holds {:#x}, which is not an end of chain value", end_of_chain);
        }

        table
    }

    /// One past the highest valid cluster number.
    fn end_cluster(&self) -> u32 {
        self.cluster_count + RESERVED_CLUSTER_COUNT
    }

    pub fn cluster_count(&self) -> u32 { self.cluster_count }
    pub fn free_clusters(&self) -> u32 { self.free_clusters }
    pub fn next_free_hint(&self) -> u32 { self.next_free }
    pub fn end_of_chain(&self) -> u32 { self.end_of_chain }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        (RESERVED_CLUSTER_COUNT..self.end_cluster()).contains(&cluster)
    }

    pub fn set_free_state(&mut self, free_clusters: u32, next_free: u32) {
        self.free_clusters = free_clusters;
        self.next_free = if self.is_valid_cluster(next_free) { next_free } else { RESERVED_CLUSTER_COUNT };
    }

    /// Counts free entries with a full scan of the table. The hint ends up at
    /// the lowest free cluster.
    pub fn recompute_free_state(&mut self) {
        let mut free_clusters = 0;
        let mut lowest_free = None;

        for cluster in (RESERVED_CLUSTER_COUNT..self.end_cluster()).rev() {
            if self.entry_at(cluster) == FREE_CLUSTER {
                free_clusters += 1;
                lowest_free = Some(cluster);
            }
        }

        self.free_clusters = free_clusters;
        self.next_free = lowest_free.unwrap_or(RESERVED_CLUSTER_COUNT);
    }

    pub fn entry_at(&mut self, cluster: u32) -> u32 {
        self.raw_entry_at(cluster) & FAT_ENTRY_MASK
    }

    fn raw_entry_at(&mut self, cluster: u32) -> u32 {
        let mut value = [0u8; ENTRY_SIZE];
        self.cache.read_one(cluster as u64, 0, &mut value);
        u32::from_le_bytes(value)
    }

    /// Writes the low 28 bits of `value`, keeping the reserved top nibble.
    pub fn set_entry_at(&mut self, cluster: u32, value: u32) {
        let raw = (self.raw_entry_at(cluster) & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK);
        self.cache.write_one(cluster as u64, 0, &raw.to_le_bytes());
    }

    pub fn entry_type_of(&self, value: u32) -> FatEntryType {
        match value {
            FREE_CLUSTER => FatEntryType::Free,
            RESERVED_CLUSTER => FatEntryType::Reserved,
            BAD_CLUSTER => FatEntryType::Bad,
            v if v >= END_OF_CHAIN_MIN_CLUSTER => {
                if v != self.end_of_chain {
                    log::warn!("FAT32: EOC value doesn't match FAT[1], {:#x} vs {:#x}", v, self.end_of_chain);
                }
                FatEntryType::EndOfChain
            }
            _ => FatEntryType::Link,
        }
    }

    /// The cluster after `cluster`, or `None` at the end of the chain.
    /// Anything other than a link or an end of chain is corruption.
    pub fn next_in_chain(&mut self, cluster: u32) -> Option<u32> {
        let value = self.entry_at(cluster);
        match self.entry_type_of(value) {
            FatEntryType::Link if self.is_valid_cluster(value) => Some(value),
            FatEntryType::EndOfChain => None,
            _ => panic!("FAT32: cluster chain contains invalid cluster value of {:#x} (at cluster {})", value, cluster),
        }
    }

    /// Follows `n` links starting at `start`.
    pub fn nth_cluster_in_chain(&mut self, start: u32, n: u32) -> u32 {
        let mut cluster = start;
        for _ in 0..n {
            cluster = self
                .next_in_chain(cluster)
                .unwrap_or_else(|| panic!("FAT32: chain starting at {} is shorter than {} clusters", start, n + 1));
        }
        cluster
    }

    pub fn last_cluster_in_chain(&mut self, start: u32) -> u32 {
        let mut cluster = start;
        while let Some(next) = self.next_in_chain(cluster) {
            cluster = next;
        }
        cluster
    }

    pub fn chain_length(&mut self, start: u32) -> u32 {
        let mut length = 1;
        let mut cluster = start;
        while let Some(next) = self.next_in_chain(cluster) {
            cluster = next;
            length += 1;
        }
        length
    }

    /// Allocates `count` clusters and links them into a chain, appended to
    /// `link_to` when given.
    ///
    /// Scans forward from the hint and wraps around once. Fails with
    /// `NoSpaceLeft` if the free counter can't cover the request; a scan that
    /// comes up short despite the counter is fatal.
    pub fn allocate_cluster_chain(&mut self, count: u32, link_to: Option<u32>) -> Result<Vec<u32>, ErrorCode> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.free_clusters {
            log::debug!("FAT32: can't allocate {} clusters, only {} free", count, self.free_clusters);
            return Err(ErrorCode::NoSpaceLeft);
        }

        let hint = if self.is_valid_cluster(self.next_free) { self.next_free } else { RESERVED_CLUSTER_COUNT };
        let mut chain = Vec::with_capacity(count as usize);
        let mut previous = link_to;

        for cluster in (hint..self.end_cluster()).chain(RESERVED_CLUSTER_COUNT..hint) {
            if chain.len() == count as usize {
                break;
            }
            if self.entry_at(cluster) != FREE_CLUSTER {
                continue;
            }

            if let Some(previous) = previous {
                self.set_entry_at(previous, cluster);
            }
            chain.push(cluster);
            previous = Some(cluster);
        }

        if chain.len() != count as usize {
            panic!(
                "FAT32: free cluster counter promised {} clusters but only {} could be found",
                count,
                chain.len()
            );
        }

        let last = chain[chain.len() - 1];
        self.set_entry_at(last, self.end_of_chain);

        self.free_clusters -= count;
        self.next_free = if last + 1 < self.end_cluster() { last + 1 } else { RESERVED_CLUSTER_COUNT };

        log::debug!(
            "FAT32: allocated {} cluster(s) starting at {}, linked to {:?}, {} left",
            count,
            chain[0],
            link_to,
            self.free_clusters
        );

        Ok(chain)
    }

    pub fn free_cluster_chain_starting_at(&mut self, first: u32, mode: FreeMode) {
        let mut current = match mode {
            FreeMode::IncludingFirst => Some(first),
            FreeMode::KeepFirst => {
                let next = self.next_in_chain(first);
                self.set_entry_at(first, self.end_of_chain);
                next
            }
        };

        let mut freed = 0;
        while let Some(cluster) = current {
            current = self.next_in_chain(cluster);
            self.set_entry_at(cluster, FREE_CLUSTER);
            freed += 1;
        }

        self.free_clusters += freed;
        log::debug!("FAT32: freed {} cluster(s) of the chain at {} ({:?})", freed, first, mode);
    }

    /// Writes dirty FAT blocks (and their mirrors) back to the disk.
    pub fn flush(&mut self) -> usize {
        self.cache.flush()
    }
}
