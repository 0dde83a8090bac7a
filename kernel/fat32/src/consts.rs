//! On-disk constants and engine limits.

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// Allocation granularity for cache memory and the minimum disk I/O size.
pub const PAGE_SIZE: usize = 4096;

/// The EBPB starts right after the jump instruction and the OEM name.
pub const EBPB_OFFSET: usize = 0x0B;
pub const EBPB_SIGNATURE: u8 = 0x29;
pub const FAT32_FILESYSTEM_TYPE: &[u8; 8] = b"FAT32   ";
pub const MIN_CLUSTER_COUNT_FOR_FAT32: u64 = 65525;

pub const FSINFO_SIGNATURE_1: &[u8; 4] = b"RRaA";
pub const FSINFO_SIGNATURE_2: &[u8; 4] = b"rrAa";
pub const FSINFO_SIGNATURE_3: &[u8; 4] = &[0x00, 0x00, 0x55, 0xAA];
pub const FSINFO_SIZE: usize = 512;

pub const FREE_CLUSTER: u32 = 0x0000_0000;
pub const RESERVED_CLUSTER: u32 = 0x0000_0001;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
pub const END_OF_CHAIN_MIN_CLUSTER: u32 = 0x0FFF_FFF8;
/// FAT32 entries are 28 bits wide, the top nibble is reserved and preserved on writes.
pub const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
pub const RESERVED_CLUSTER_COUNT: u32 = 2;
/// FAT[1] holds the end-of-chain value this volume was formatted with.
pub const END_OF_CHAIN_INDICATOR_ENTRY: u32 = 1;

pub const DIRECTORY_ENTRY_SIZE: usize = 32;
pub const SHORT_NAME_LENGTH: usize = 8;
pub const SHORT_EXTENSION_LENGTH: usize = 3;
pub const SHORT_NAME_TOTAL_LENGTH: usize = SHORT_NAME_LENGTH + SHORT_EXTENSION_LENGTH;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_SEQUENCE_NUMBER: u8 = 20;
/// A long name plus its metadata entry can touch at most this many clusters.
pub const MAX_CLUSTERS_PER_ENTRY: usize = 3;

pub const DEFAULT_TOTAL_RAM: u64 = 512 * MB;
pub const MAX_FAT_CACHE_SIZE: u64 = 5 * MB;
pub const MAX_DATA_CACHE_SIZE: u64 = 256 * MB;
