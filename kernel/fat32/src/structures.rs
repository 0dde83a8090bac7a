//! On-disk FAT32 structures.
//!
//! Everything is decoded from and encoded to little-endian byte slices at
//! fixed offsets, nothing here relies on the in-memory layout of a Rust type.

use alloc::string::String;

use bitflags::bitflags;

use crate::consts::{
    DIRECTORY_ENTRY_SIZE, FSINFO_SIGNATURE_1, FSINFO_SIGNATURE_2, FSINFO_SIGNATURE_3, FSINFO_SIZE,
    SHORT_EXTENSION_LENGTH, SHORT_NAME_LENGTH, SHORT_NAME_TOTAL_LENGTH,
};

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// ─── EBPB ──────────────────────────────────────────────────────────────────────

/// BIOS parameter block followed by the FAT32 extension, 79 bytes starting at
/// byte 0x0B of the volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ebpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub max_root_dir_entries: u16,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub total_logical_sectors: u32,
    pub sectors_per_fat: u32,
    pub ext_flags: u16,
    pub version: u16,
    pub root_dir_cluster: u32,
    pub fs_information_sector: u16,
    pub backup_boot_sectors: u16,
    pub drive_number: u8,
    pub signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub filesystem_type: [u8; 8],
}

impl Ebpb {
    pub const SIZE: usize = 79;

    /// Bit 7 of the extended flags: only the FAT selected by bits 0..4 is active.
    const MIRRORING_DISABLED: u16 = 1 << 7;
    const ACTIVE_FAT_MASK: u16 = 0x0F;

    pub fn parse(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);

        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&bytes[60..71]);
        let mut filesystem_type = [0u8; 8];
        filesystem_type.copy_from_slice(&bytes[71..79]);

        Self {
            bytes_per_sector: read_u16(bytes, 0),
            sectors_per_cluster: bytes[2],
            reserved_sectors: read_u16(bytes, 3),
            fat_count: bytes[5],
            max_root_dir_entries: read_u16(bytes, 6),
            media_descriptor: bytes[10],
            sectors_per_track: read_u16(bytes, 13),
            heads: read_u16(bytes, 15),
            hidden_sectors: read_u32(bytes, 17),
            total_logical_sectors: read_u32(bytes, 21),
            sectors_per_fat: read_u32(bytes, 25),
            ext_flags: read_u16(bytes, 29),
            version: read_u16(bytes, 31),
            root_dir_cluster: read_u32(bytes, 33),
            fs_information_sector: read_u16(bytes, 37),
            backup_boot_sectors: read_u16(bytes, 39),
            drive_number: bytes[53],
            signature: bytes[55],
            volume_id: read_u32(bytes, 56),
            volume_label,
            filesystem_type,
        }
    }

    pub fn is_mirroring_enabled(&self) -> bool {
        self.ext_flags & Self::MIRRORING_DISABLED == 0
    }

    pub fn active_fat(&self) -> u8 {
        (self.ext_flags & Self::ACTIVE_FAT_MASK) as u8
    }

    /// Whether the volume has an FSINFO sector at all.
    pub fn has_fsinfo(&self) -> bool {
        self.fs_information_sector != 0 && self.fs_information_sector != 0xFFFF
    }
}

// ─── FSINFO ────────────────────────────────────────────────────────────────────

const FSINFO_SIGNATURE_1_OFFSET: usize = 0;
const FSINFO_SIGNATURE_2_OFFSET: usize = 484;
const FSINFO_FREE_COUNT_OFFSET: usize = 488;
const FSINFO_LAST_ALLOCATED_OFFSET: usize = 492;
const FSINFO_SIGNATURE_3_OFFSET: usize = 508;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub signature_1: [u8; 4],
    pub signature_2: [u8; 4],
    pub signature_3: [u8; 4],
    pub free_cluster_count: u32,
    pub last_allocated_cluster: u32,
}

impl FsInfo {
    pub fn parse(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= FSINFO_SIZE);

        let signature = |offset: usize| {
            let mut out = [0u8; 4];
            out.copy_from_slice(&bytes[offset..offset + 4]);
            out
        };

        Self {
            signature_1: signature(FSINFO_SIGNATURE_1_OFFSET),
            signature_2: signature(FSINFO_SIGNATURE_2_OFFSET),
            signature_3: signature(FSINFO_SIGNATURE_3_OFFSET),
            free_cluster_count: read_u32(bytes, FSINFO_FREE_COUNT_OFFSET),
            last_allocated_cluster: read_u32(bytes, FSINFO_LAST_ALLOCATED_OFFSET),
        }
    }

    /// Index (1-based) of the first signature that doesn't match, if any.
    pub fn first_invalid_signature(&self) -> Option<usize> {
        if &self.signature_1 != FSINFO_SIGNATURE_1 {
            return Some(1);
        }
        if &self.signature_2 != FSINFO_SIGNATURE_2 {
            return Some(2);
        }
        if &self.signature_3 != FSINFO_SIGNATURE_3 {
            return Some(3);
        }
        None
    }

    /// Patches the two counters into a sector image, leaving everything else untouched.
    pub fn write_counters(bytes: &mut [u8], free_cluster_count: u32, last_allocated_cluster: u32) {
        write_u32(bytes, FSINFO_FREE_COUNT_OFFSET, free_cluster_count);
        write_u32(bytes, FSINFO_LAST_ALLOCATED_OFFSET, last_allocated_cluster);
    }
}

// ─── Directory entries ─────────────────────────────────────────────────────────

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY    = 1 << 0;
        const HIDDEN       = 1 << 1;
        const SYSTEM       = 1 << 2;
        const VOLUME_LABEL = 1 << 3;
        const SUBDIRECTORY = 1 << 4;
        const ARCHIVE      = 1 << 5;
        const DEVICE       = 1 << 6;

        const LONG_NAME = Self::READ_ONLY.bits() | Self::HIDDEN.bits() | Self::SYSTEM.bits() | Self::VOLUME_LABEL.bits();
    }
}

bitflags! {
    /// Case of an 8.3 name that was stored without a long name.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CaseInfo: u8 {
        const LOWERCASE_NAME      = 1 << 3;
        const LOWERCASE_EXTENSION = 1 << 4;
    }
}

pub const DELETED_MARK: u8 = 0xE5;
pub const END_OF_DIRECTORY_MARK: u8 = 0x00;

/// A short (8.3) directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: [u8; SHORT_NAME_LENGTH],
    pub extension: [u8; SHORT_EXTENSION_LENGTH],
    pub attributes: Attributes,
    pub case_info: CaseInfo,
    pub created_tenths: u8,
    pub created_time: u16,
    pub created_date: u16,
    pub last_accessed_date: u16,
    pub cluster_high: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub cluster_low: u16,
    pub size: u32,
}

impl RawDirEntry {
    pub fn new(short_name: &[u8; SHORT_NAME_TOTAL_LENGTH], attributes: Attributes) -> Self {
        let mut name = [0u8; SHORT_NAME_LENGTH];
        name.copy_from_slice(&short_name[..SHORT_NAME_LENGTH]);
        let mut extension = [0u8; SHORT_EXTENSION_LENGTH];
        extension.copy_from_slice(&short_name[SHORT_NAME_LENGTH..]);

        Self {
            name,
            extension,
            attributes,
            case_info: CaseInfo::empty(),
            created_tenths: 0,
            created_time: 0,
            created_date: 0,
            last_accessed_date: 0,
            cluster_high: 0,
            last_modified_time: 0,
            last_modified_date: 0,
            cluster_low: 0,
            size: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= DIRECTORY_ENTRY_SIZE);

        let mut name = [0u8; SHORT_NAME_LENGTH];
        name.copy_from_slice(&bytes[0..8]);
        let mut extension = [0u8; SHORT_EXTENSION_LENGTH];
        extension.copy_from_slice(&bytes[8..11]);

        Self {
            name,
            extension,
            attributes: Attributes::from_bits_retain(bytes[11]),
            case_info: CaseInfo::from_bits_retain(bytes[12]),
            created_tenths: bytes[13],
            created_time: read_u16(bytes, 14),
            created_date: read_u16(bytes, 16),
            last_accessed_date: read_u16(bytes, 18),
            cluster_high: read_u16(bytes, 20),
            last_modified_time: read_u16(bytes, 22),
            last_modified_date: read_u16(bytes, 24),
            cluster_low: read_u16(bytes, 26),
            size: read_u32(bytes, 28),
        }
    }

    pub fn to_bytes(&self) -> [u8; DIRECTORY_ENTRY_SIZE] {
        let mut bytes = [0u8; DIRECTORY_ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.name);
        bytes[8..11].copy_from_slice(&self.extension);
        bytes[11] = self.attributes.bits();
        bytes[12] = self.case_info.bits();
        bytes[13] = self.created_tenths;
        write_u16(&mut bytes, 14, self.created_time);
        write_u16(&mut bytes, 16, self.created_date);
        write_u16(&mut bytes, 18, self.last_accessed_date);
        write_u16(&mut bytes, 20, self.cluster_high);
        write_u16(&mut bytes, 22, self.last_modified_time);
        write_u16(&mut bytes, 24, self.last_modified_date);
        write_u16(&mut bytes, 26, self.cluster_low);
        write_u32(&mut bytes, 28, self.size);
        bytes
    }

    pub fn is_deleted(&self) -> bool { self.name[0] == DELETED_MARK }
    pub fn is_end_of_directory(&self) -> bool { self.name[0] == END_OF_DIRECTORY_MARK }
    pub fn is_long_name(&self) -> bool { self.attributes.contains(Attributes::LONG_NAME) }
    pub fn is_volume_label(&self) -> bool { self.attributes.contains(Attributes::VOLUME_LABEL) }
    pub fn is_directory(&self) -> bool { self.attributes.contains(Attributes::SUBDIRECTORY) }
    pub fn is_device(&self) -> bool { self.attributes.contains(Attributes::DEVICE) }

    /// `.` and `..`
    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.' && self.name[1..].iter().all(|&c| c == b'.' || c == b' ')
    }

    /// Entries that never show up in a listing.
    pub fn is_pseudo(&self) -> bool {
        self.is_volume_label() || self.is_device() || self.is_dot_entry()
    }

    pub fn short_name(&self) -> [u8; SHORT_NAME_TOTAL_LENGTH] {
        let mut out = [0u8; SHORT_NAME_TOTAL_LENGTH];
        out[..SHORT_NAME_LENGTH].copy_from_slice(&self.name);
        out[SHORT_NAME_LENGTH..].copy_from_slice(&self.extension);
        out
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_high as u32) << 16) | self.cluster_low as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_high = (cluster >> 16) as u16;
        self.cluster_low = cluster as u16;
    }

    /// The `NAME.EXT` form of the short name, lowercased where the case bits ask for it.
    pub fn display_name(&self) -> String {
        let trimmed_len = |field: &[u8]| field.iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);

        let mut out = String::new();
        let push = |out: &mut String, field: &[u8], lowercase: bool| {
            for &c in field {
                let c = if lowercase { c.to_ascii_lowercase() } else { c };
                out.push(if c.is_ascii() { c as char } else { '?' });
            }
        };

        let name = &self.name[..trimmed_len(&self.name)];
        push(&mut out, name, self.case_info.contains(CaseInfo::LOWERCASE_NAME));

        let extension = &self.extension[..trimmed_len(&self.extension)];
        if !extension.is_empty() {
            out.push('.');
            push(&mut out, extension, self.case_info.contains(CaseInfo::LOWERCASE_EXTENSION));
        }

        out
    }
}

// ─── VFAT long name entries ────────────────────────────────────────────────────

const NAME_1_CHARACTERS: usize = 5;
const NAME_2_CHARACTERS: usize = 6;
const NAME_3_CHARACTERS: usize = 2;
pub const CHARACTERS_PER_ENTRY: usize = NAME_1_CHARACTERS + NAME_2_CHARACTERS + NAME_3_CHARACTERS;

/// UCS-2 offsets of the three name fragments within an entry.
const NAME_FRAGMENTS: [(usize, usize); 3] = [(1, NAME_1_CHARACTERS), (14, NAME_2_CHARACTERS), (28, NAME_3_CHARACTERS)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongNameEntry {
    pub sequence_number: u8,
    pub characters: [u16; CHARACTERS_PER_ENTRY],
    pub checksum: u8,
}

impl LongNameEntry {
    const SEQUENCE_BITS_MASK: u8 = 0b1_1111;
    pub const LAST_LOGICAL_ENTRY_BIT: u8 = 1 << 6;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= DIRECTORY_ENTRY_SIZE);

        let mut characters = [0u16; CHARACTERS_PER_ENTRY];
        let mut index = 0;
        for (offset, count) in NAME_FRAGMENTS {
            for i in 0..count {
                characters[index] = read_u16(bytes, offset + i * 2);
                index += 1;
            }
        }

        Self { sequence_number: bytes[0], characters, checksum: bytes[13] }
    }

    /// Builds entry `sequence` (1-based) of a name, holding `fragment` (at most 13 ASCII bytes).
    /// A short final fragment is NUL terminated and padded with 0xFFFF.
    pub fn for_fragment(sequence: u8, is_last_logical: bool, fragment: &[u8], checksum: u8) -> Self {
        debug_assert!(fragment.len() <= CHARACTERS_PER_ENTRY);

        let mut characters = [0xFFFFu16; CHARACTERS_PER_ENTRY];
        for (i, &c) in fragment.iter().enumerate() {
            characters[i] = c as u16;
        }
        if fragment.len() < CHARACTERS_PER_ENTRY {
            characters[fragment.len()] = 0;
        }

        let sequence_number = if is_last_logical { sequence | Self::LAST_LOGICAL_ENTRY_BIT } else { sequence };
        Self { sequence_number, characters, checksum }
    }

    pub fn to_bytes(&self) -> [u8; DIRECTORY_ENTRY_SIZE] {
        let mut bytes = [0u8; DIRECTORY_ENTRY_SIZE];
        bytes[0] = self.sequence_number;
        bytes[11] = Attributes::LONG_NAME.bits();
        bytes[12] = 0;
        bytes[13] = self.checksum;
        write_u16(&mut bytes, 26, 0);

        let mut index = 0;
        for (offset, count) in NAME_FRAGMENTS {
            for i in 0..count {
                write_u16(&mut bytes, offset + i * 2, self.characters[index]);
                index += 1;
            }
        }
        bytes
    }

    pub fn extract_sequence_number(&self) -> u8 { self.sequence_number & Self::SEQUENCE_BITS_MASK }
    pub fn is_last_logical(&self) -> bool { self.sequence_number & Self::LAST_LOGICAL_ENTRY_BIT != 0 }

    /// Appends this entry's part of the name to `out`, stopping at the NUL terminator.
    /// Characters outside of ASCII become `?`.
    pub fn decode_into(&self, out: &mut alloc::vec::Vec<u8>) {
        for &c in &self.characters {
            match c {
                0 => return,
                1..=127 => out.push(c as u8),
                _ => out.push(b'?'),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn ebpb_fields_are_read_at_their_offsets() {
        let mut bytes = [0u8; Ebpb::SIZE];
        write_u16(&mut bytes, 0, 512);
        bytes[2] = 8;
        write_u16(&mut bytes, 3, 32);
        bytes[5] = 2;
        write_u32(&mut bytes, 25, 1009);
        write_u16(&mut bytes, 29, 0x81);
        write_u32(&mut bytes, 33, 2);
        write_u16(&mut bytes, 37, 1);
        bytes[55] = 0x29;
        bytes[71..79].copy_from_slice(b"FAT32   ");

        let ebpb = Ebpb::parse(&bytes);
        assert_eq!(ebpb.bytes_per_sector, 512);
        assert_eq!(ebpb.sectors_per_cluster, 8);
        assert_eq!(ebpb.reserved_sectors, 32);
        assert_eq!(ebpb.fat_count, 2);
        assert_eq!(ebpb.sectors_per_fat, 1009);
        assert_eq!(ebpb.root_dir_cluster, 2);
        assert_eq!(ebpb.signature, 0x29);
        assert_eq!(&ebpb.filesystem_type, b"FAT32   ");
        assert!(!ebpb.is_mirroring_enabled());
        assert_eq!(ebpb.active_fat(), 1);
        assert!(ebpb.has_fsinfo());
    }

    #[test]
    fn fsinfo_signatures_are_checked_in_order() {
        let mut sector = [0u8; FSINFO_SIZE];
        sector[0..4].copy_from_slice(FSINFO_SIGNATURE_1);
        assert_eq!(FsInfo::parse(&sector).first_invalid_signature(), Some(2));

        sector[484..488].copy_from_slice(FSINFO_SIGNATURE_2);
        sector[508..512].copy_from_slice(FSINFO_SIGNATURE_3);
        FsInfo::write_counters(&mut sector, 1234, 56);

        let fsinfo = FsInfo::parse(&sector);
        assert_eq!(fsinfo.first_invalid_signature(), None);
        assert_eq!(fsinfo.free_cluster_count, 1234);
        assert_eq!(fsinfo.last_allocated_cluster, 56);
    }

    #[test]
    fn short_entry_layout() {
        let mut entry = RawDirEntry::new(b"HELLO   TXT", Attributes::ARCHIVE);
        entry.set_first_cluster(0x0012_3456);
        entry.size = 77;
        entry.case_info = CaseInfo::LOWERCASE_EXTENSION;

        let bytes = entry.to_bytes();
        assert_eq!(&bytes[0..11], b"HELLO   TXT");
        assert_eq!(bytes[11], 0x20);
        assert_eq!(bytes[12], 1 << 4);
        assert_eq!(&bytes[20..22], &[0x12, 0x00]);
        assert_eq!(&bytes[26..28], &[0x56, 0x34]);
        assert_eq!(&bytes[28..32], &77u32.to_le_bytes());

        let decoded = RawDirEntry::from_bytes(&bytes);
        assert_eq!(decoded.first_cluster(), 0x0012_3456);
        assert_eq!(decoded.display_name(), "HELLO.txt");
    }

    #[test]
    fn dot_entries_and_markers() {
        let dot = RawDirEntry::new(b".          ", Attributes::SUBDIRECTORY);
        let dotdot = RawDirEntry::new(b"..         ", Attributes::SUBDIRECTORY);
        assert!(dot.is_dot_entry() && dotdot.is_dot_entry());
        assert!(!RawDirEntry::new(b"A          ", Attributes::empty()).is_dot_entry());

        let mut bytes = dot.to_bytes();
        bytes[0] = DELETED_MARK;
        assert!(RawDirEntry::from_bytes(&bytes).is_deleted());
    }

    #[test]
    fn long_entry_fragment_is_terminated_and_padded() {
        let entry = LongNameEntry::for_fragment(2, true, b"abc", 0x42);
        let bytes = entry.to_bytes();

        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[11], 0x0F);
        assert_eq!(bytes[13], 0x42);
        assert_eq!(&bytes[1..9], &[b'a', 0, b'b', 0, b'c', 0, 0, 0]);
        assert_eq!(&bytes[9..11], &[0xFF, 0xFF]);
        assert_eq!(&bytes[26..28], &[0, 0]);

        let decoded = LongNameEntry::from_bytes(&bytes);
        assert!(decoded.is_last_logical());
        assert_eq!(decoded.extract_sequence_number(), 2);

        let mut name = Vec::new();
        decoded.decode_into(&mut name);
        assert_eq!(name, b"abc");
        assert!(RawDirEntry::from_bytes(&bytes).is_long_name());
    }

    #[test]
    fn non_ascii_long_name_characters_decode_as_question_marks() {
        let mut entry = LongNameEntry::for_fragment(1, true, b"a", 0);
        entry.characters[1] = 0x00E9;
        entry.characters[2] = 0;

        let mut name = Vec::new();
        entry.decode_into(&mut name);
        assert_eq!(name, b"a?");
    }
}
