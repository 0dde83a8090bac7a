//! Directory streams.
//!
//! A [`Cursor`] walks the raw 32-byte entries of a directory, following its
//! cluster chain. On top of it `next_native` reassembles VFAT long names and
//! `allocate_entries` finds (or makes) room for a run of new entries.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kernel_api_types::{ErrorCode, FileAttributes};

use crate::consts::{DIRECTORY_ENTRY_SIZE, MAX_CLUSTERS_PER_ENTRY, MAX_NAME_LENGTH, MAX_SEQUENCE_NUMBER, RESERVED_CLUSTER_COUNT};
use crate::file::{File, FileState, Identifier};
use crate::short_name;
use crate::structures::{CaseInfo, DELETED_MARK, END_OF_DIRECTORY_MARK, LongNameEntry, RawDirEntry};
use crate::volume::Volume;

pub(crate) struct RawSlot {
    cluster: u32,
    offset: u32,
    bytes: [u8; DIRECTORY_ENTRY_SIZE],
}

pub(crate) struct Cursor {
    current_cluster: u32,
    offset: usize,
    exhausted: bool,
    pending: Option<RawSlot>,
}

impl Cursor {
    pub fn new(first_cluster: u32) -> Self {
        let mut cursor = Self { current_cluster: 0, offset: 0, exhausted: false, pending: None };
        cursor.rewind(first_cluster);
        cursor
    }

    pub fn rewind(&mut self, first_cluster: u32) {
        self.current_cluster = first_cluster;
        self.offset = 0;
        self.exhausted = first_cluster < RESERVED_CLUSTER_COUNT;
        self.pending = None;

        if self.exhausted {
            log::warn!("FAT32: directory without clusters ({}) treated as empty", first_cluster);
        }
    }

    fn fetch_next(&mut self, volume: &Volume) -> Option<RawSlot> {
        if let Some(slot) = self.pending.take() {
            return Some(slot);
        }
        if self.exhausted {
            return None;
        }

        if self.offset == volume.bytes_per_cluster {
            match volume.next_in_chain(self.current_cluster) {
                Some(next) => {
                    self.current_cluster = next;
                    self.offset = 0;
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            }
        }

        let mut bytes = [0u8; DIRECTORY_ENTRY_SIZE];
        volume.read_data(self.current_cluster, self.offset, &mut bytes);
        let slot = RawSlot { cluster: self.current_cluster, offset: self.offset as u32, bytes };
        self.offset += DIRECTORY_ENTRY_SIZE;

        Some(slot)
    }

    /// Whether nothing but free space follows the last entry returned.
    pub fn at_end(&mut self, volume: &Volume) -> bool {
        match self.fetch_next(volume) {
            None => true,
            Some(slot) => {
                let end = slot.bytes[0] == END_OF_DIRECTORY_MARK;
                self.pending = Some(slot);
                end
            }
        }
    }

    /// The next live entry, with its long name reassembled. Deleted entries,
    /// volume labels and the dot entries are skipped.
    pub fn next_native(&mut self, volume: &Volume) -> Option<NativeEntry> {
        loop {
            let slot = self.fetch_next(volume)?;
            let entry = RawDirEntry::from_bytes(&slot.bytes);

            if entry.is_end_of_directory() {
                self.exhausted = true;
                return None;
            }
            if entry.is_deleted() {
                continue;
            }

            if !entry.is_long_name() {
                if entry.is_pseudo() {
                    continue;
                }
                return Some(NativeEntry::short_only(entry, &slot));
            }

            // Some implementations give the dot entries long names too.
            match self.assemble_long_name(volume, slot) {
                Some(native) if native.entry.is_pseudo() => {}
                Some(native) => return Some(native),
                None => {}
            }
        }
    }

    /// Consumes the long name sequence starting at `first` along with its short
    /// entry. On a broken sequence the offending entry is pushed back and `None`
    /// is returned, so scanning resumes from it.
    fn assemble_long_name(&mut self, volume: &Volume, first: RawSlot) -> Option<NativeEntry> {
        let long = LongNameEntry::from_bytes(&first.bytes);
        let sequence_count = long.extract_sequence_number();

        if !long.is_last_logical() || sequence_count == 0 || sequence_count > MAX_SEQUENCE_NUMBER {
            log::warn!("FAT32: skipping orphaned long name entry at {}:{}", first.cluster, first.offset);
            return None;
        }

        // Fragments are stored last to first.
        let mut fragments = Vec::with_capacity(sequence_count as usize);
        let mut checksums = Vec::with_capacity(sequence_count as usize);
        let mut clusters = vec![first.cluster];

        let mut fragment = Vec::new();
        long.decode_into(&mut fragment);
        fragments.push(fragment);
        checksums.push(long.checksum);

        let mut record_cluster = |cluster: u32| {
            if clusters.last() != Some(&cluster) {
                clusters.push(cluster);
            }
        };

        for expected in (1..sequence_count).rev() {
            let Some(slot) = self.fetch_next(volume) else {
                log::warn!("FAT32: directory ends inside the long name at {}:{}", first.cluster, first.offset);
                return None;
            };

            let raw = RawDirEntry::from_bytes(&slot.bytes);
            let long = LongNameEntry::from_bytes(&slot.bytes);
            let in_sequence = raw.is_long_name()
                && !raw.is_deleted()
                && !long.is_last_logical()
                && long.extract_sequence_number() == expected;

            if !in_sequence {
                log::warn!("FAT32: long name at {}:{} is missing part {}", first.cluster, first.offset, expected);
                self.pending = Some(slot);
                return None;
            }

            record_cluster(slot.cluster);
            let mut fragment = Vec::new();
            long.decode_into(&mut fragment);
            fragments.push(fragment);
            checksums.push(long.checksum);
        }

        let Some(slot) = self.fetch_next(volume) else {
            log::warn!("FAT32: long name at {}:{} has no short entry", first.cluster, first.offset);
            return None;
        };

        let entry = RawDirEntry::from_bytes(&slot.bytes);
        if entry.is_long_name() || entry.is_deleted() || entry.is_end_of_directory() {
            log::warn!("FAT32: long name at {}:{} has no short entry", first.cluster, first.offset);
            self.pending = Some(slot);
            return None;
        }
        record_cluster(slot.cluster);
        debug_assert!(clusters.len() <= MAX_CLUSTERS_PER_ENTRY);

        let mut name: String = fragments.iter().rev().flatten().map(|&c| c as char).take(MAX_NAME_LENGTH).collect();
        if name.is_empty() {
            name = entry.display_name();
        }

        let checksum = short_name::checksum(&entry.short_name());
        if let Some(&bad) = checksums.iter().find(|&&c| c != checksum) {
            log::warn!("FAT32: checksum mismatch for {}, expected {:#x} got {:#x}", name, checksum, bad);
        }

        Some(NativeEntry {
            name,
            entry,
            sequence_count: sequence_count as u32,
            first_entry_offset: first.offset,
            clusters,
            metadata_cluster: slot.cluster,
            metadata_offset: slot.offset,
        })
    }
}

/// A decoded directory entry together with where its pieces live on disk.
pub(crate) struct NativeEntry {
    pub name: String,
    pub entry: RawDirEntry,
    /// Number of long name entries preceding the short one.
    pub sequence_count: u32,
    /// Offset of the first entry of the sequence within `clusters[0]`.
    pub first_entry_offset: u32,
    /// Every cluster the sequence touches, in chain order.
    pub clusters: Vec<u32>,
    pub metadata_cluster: u32,
    pub metadata_offset: u32,
}

impl NativeEntry {
    fn short_only(entry: RawDirEntry, slot: &RawSlot) -> Self {
        Self {
            name: entry.display_name(),
            entry,
            sequence_count: 0,
            first_entry_offset: slot.offset,
            clusters: vec![slot.cluster],
            metadata_cluster: slot.cluster,
            metadata_offset: slot.offset,
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier { cluster: self.metadata_cluster, offset: self.metadata_offset }
    }

    pub fn attributes(&self) -> FileAttributes {
        if self.entry.is_directory() { FileAttributes::IS_DIRECTORY } else { FileAttributes::empty() }
    }

    pub fn first_data_cluster(&self) -> u32 {
        self.entry.first_cluster()
    }

    /// Case-insensitive match against both the long and the short name.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.entry.display_name().eq_ignore_ascii_case(name)
    }

    /// Positions of every entry of the sequence, long ones first.
    pub fn entry_positions(&self, bytes_per_cluster: usize) -> Vec<(u32, u32)> {
        let mut positions = Vec::with_capacity(self.sequence_count as usize + 1);
        let mut cluster_index = 0;
        let mut offset = self.first_entry_offset as usize;

        for _ in 0..=self.sequence_count {
            if offset == bytes_per_cluster {
                cluster_index += 1;
                offset = 0;
            }
            positions.push((self.clusters[cluster_index], offset as u32));
            offset += DIRECTORY_ENTRY_SIZE;
        }

        positions
    }
}

/// Scans the directory starting at `first_cluster` for an entry called `name`.
pub(crate) fn find_entry(volume: &Volume, first_cluster: u32, name: &str) -> Option<(NativeEntry, Cursor)> {
    let mut cursor = Cursor::new(first_cluster);
    while let Some(entry) = cursor.next_native(volume) {
        if entry.matches(name) {
            return Some((entry, cursor));
        }
    }
    None
}

/// A run of free directory entries, written one after the other.
pub(crate) struct Slot {
    clusters: Vec<u32>,
    index: usize,
    offset: usize,
}

impl Slot {
    /// Writes the next entry of the run and returns where it went.
    pub fn write_next(&mut self, volume: &Volume, bytes: &[u8; DIRECTORY_ENTRY_SIZE]) -> Identifier {
        if self.offset == volume.bytes_per_cluster {
            self.index += 1;
            self.offset = 0;
        }

        let cluster = self.clusters[self.index];
        volume.write_data(cluster, self.offset, bytes);

        let position = Identifier { cluster, offset: self.offset as u32 };
        self.offset += DIRECTORY_ENTRY_SIZE;
        position
    }
}

/// Finds `count` contiguous free entries in the directory whose locked state is
/// `directory`, growing its chain when there isn't enough room.
pub(crate) fn allocate_entries(volume: &Volume, directory: &mut FileState, count: usize) -> Result<Slot, ErrorCode> {
    let mut cursor = Cursor::new(directory.first_cluster());
    let mut clusters = Vec::new();
    let mut start_offset = 0;
    let mut run_length = 0;

    while run_length < count {
        let Some(slot) = cursor.fetch_next(volume) else { break };

        let marker = slot.bytes[0];
        if marker != END_OF_DIRECTORY_MARK && marker != DELETED_MARK {
            clusters.clear();
            run_length = 0;
            continue;
        }

        if run_length == 0 {
            start_offset = slot.offset as usize;
        }
        if clusters.last() != Some(&slot.cluster) {
            clusters.push(slot.cluster);
        }
        run_length += 1;
    }

    if run_length < count {
        let entries_per_cluster = volume.bytes_per_cluster / DIRECTORY_ENTRY_SIZE;
        let missing = count - run_length;
        let new_cluster_count = missing.div_ceil(entries_per_cluster);

        let (chain_length, last_cluster) = directory.chain_tail(volume);
        let link_to = (chain_length != 0).then_some(last_cluster);
        let new_clusters = volume.allocate_cluster_chain(new_cluster_count as u32, link_to)?;
        directory.append_clusters(&new_clusters, chain_length);

        // Whatever the new entries leave of the last cluster must read as end of directory.
        let used_in_last = missing - (new_cluster_count - 1) * entries_per_cluster;
        if let Some(&last) = new_clusters.last() {
            if used_in_last < entries_per_cluster {
                volume.zero_cluster(last);
            }
        }

        if run_length == 0 {
            start_offset = 0;
        }
        clusters.extend_from_slice(&new_clusters);
    }

    Ok(Slot { clusters, index: 0, offset: start_offset })
}

// ─── Public directory handles ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    /// The 8.3 alias as stored on disk, e.g. `VERYLO~1.TXT`.
    pub short_name: String,
    pub attributes: FileAttributes,
    pub size: u32,
}

impl From<NativeEntry> for DirectoryEntry {
    fn from(native: NativeEntry) -> Self {
        let mut alias = native.entry;
        alias.case_info = CaseInfo::empty();

        Self {
            short_name: alias.display_name(),
            attributes: native.attributes(),
            size: native.entry.size,
            name: native.name,
        }
    }
}

/// An open directory, iterated entry by entry.
pub struct Directory {
    file: Arc<File>,
    cursor: Cursor,
}

impl Directory {
    pub(crate) fn new(file: Arc<File>) -> Self {
        let cursor = Cursor::new(file.first_cluster());
        Self { file, cursor }
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub(crate) fn into_file(self) -> Arc<File> {
        self.file
    }

    pub fn rewind(&mut self) {
        let first_cluster = self.file.first_cluster();
        self.cursor.rewind(first_cluster);
    }
}

impl Iterator for Directory {
    type Item = DirectoryEntry;

    fn next(&mut self) -> Option<DirectoryEntry> {
        let _guard = self.file.lock();
        self.cursor.next_native(self.file.volume()).map(DirectoryEntry::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{create_dir_via_fatfs, create_file_via_fatfs, make_image, mount_image, names_via_fatfs};
    use alloc::format;

    fn names(directory: Directory) -> Vec<String> {
        directory.map(|entry| entry.name).collect()
    }

    #[test]
    fn lists_names_written_by_another_implementation() {
        let mut image = make_image();
        create_file_via_fatfs(&mut image, "UPPER.TXT", b"1");
        create_file_via_fatfs(&mut image, "Very Long Gamer That Likes to Game.txt", b"22");
        create_dir_via_fatfs(&mut image, "sub");
        let (_disk, fs) = mount_image(image);

        let entries: Vec<DirectoryEntry> = fs.open_directory("/").unwrap().collect();
        let long = entries.iter().find(|e| e.name == "Very Long Gamer That Likes to Game.txt").unwrap();
        assert_eq!(long.short_name, "VERYLO~1.TXT");
        assert_eq!(long.size, 2);

        assert!(entries.iter().any(|e| e.name == "UPPER.TXT" && e.size == 1));
        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert_eq!(sub.attributes, FileAttributes::IS_DIRECTORY);

        let sub = fs.open_directory("/sub").unwrap();
        assert_eq!(names(sub), Vec::<String>::new());
    }

    #[test]
    fn long_name_crossing_a_cluster_boundary() {
        let (disk, fs) = mount_image(make_image());
        fs.create("/D", FileAttributes::IS_DIRECTORY).unwrap();
        // With the dot entries this fills slots 0..=14 of the first 16-entry cluster.
        for i in 0..13 {
            fs.create(&format!("/D/F{}", i), FileAttributes::empty()).unwrap();
        }
        let long_name = "a".repeat(100);
        fs.create(&format!("/D/{}", long_name), FileAttributes::empty()).unwrap();

        let dir = fs.open_directory("/D").unwrap();
        let volume = fs.volume();

        let mut cursor = Cursor::new(dir.file().first_cluster());
        let mut found = None;
        while let Some(entry) = cursor.next_native(volume) {
            if entry.name == long_name {
                found = Some(entry);
            }
        }

        let found = found.expect("long name not found");
        assert_eq!(found.sequence_count, 8);
        assert_eq!(found.clusters.len(), 2);
        assert_eq!(found.first_entry_offset, 15 * 32);
        assert_eq!(found.entry_positions(volume.bytes_per_cluster).len(), 9);
        assert_eq!(found.entry_positions(volume.bytes_per_cluster)[1], (found.clusters[1], 0));

        fs.close_directory(dir).unwrap();
        fs.sync();
        let mut image = disk.snapshot();
        let listed = names_via_fatfs(&mut image, "D");
        assert_eq!(listed.len(), 14);
        assert!(listed.contains(&long_name));
    }

    /// Writes raw entries right after the dot entries of a fresh directory.
    fn directory_with_raw_entries(entries: &[[u8; DIRECTORY_ENTRY_SIZE]]) -> (crate::Fat32, Directory) {
        let (_disk, fs) = mount_image(make_image());
        fs.create("/raw", FileAttributes::IS_DIRECTORY).unwrap();
        let dir = fs.open_directory("/raw").unwrap();

        let first = dir.file().first_cluster();
        for (i, entry) in entries.iter().enumerate() {
            fs.volume().write_data(first, (2 + i) * DIRECTORY_ENTRY_SIZE, entry);
        }
        (fs, dir)
    }

    #[test]
    fn checksum_mismatch_still_yields_the_long_name() {
        let short = *b"HELLOW~1   ";
        let long = LongNameEntry::for_fragment(1, true, b"hello world", short_name::checksum(&short) ^ 0xFF);
        let entry = RawDirEntry::new(&short, crate::structures::Attributes::ARCHIVE);

        let (_fs, dir) = directory_with_raw_entries(&[long.to_bytes(), entry.to_bytes()]);
        assert_eq!(names(dir), vec!["hello world"]);
    }

    #[test]
    fn orphaned_long_entries_are_skipped() {
        let short = *b"ORPHAN  TXT";
        let checksum = short_name::checksum(&short);
        // Claims two parts but only the last one is present.
        let long = LongNameEntry::for_fragment(2, true, b"tail", checksum);
        let entry = RawDirEntry::new(&short, crate::structures::Attributes::ARCHIVE);
        let deleted = {
            let mut bytes = RawDirEntry::new(b"GONE    TXT", crate::structures::Attributes::ARCHIVE).to_bytes();
            bytes[0] = DELETED_MARK;
            bytes
        };

        let (_fs, dir) = directory_with_raw_entries(&[deleted, long.to_bytes(), entry.to_bytes()]);
        assert_eq!(names(dir), vec!["ORPHAN.TXT"]);
    }

    #[test]
    fn dot_entries_with_long_names_are_skipped() {
        let mut raw = Vec::new();
        for (dots, name) in [(b".          ", &b"."[..]), (b"..         ", &b".."[..])] {
            raw.push(LongNameEntry::for_fragment(1, true, name, short_name::checksum(dots)).to_bytes());
            raw.push(RawDirEntry::new(dots, crate::structures::Attributes::SUBDIRECTORY).to_bytes());
        }
        raw.push(RawDirEntry::new(b"KEPT       ", crate::structures::Attributes::ARCHIVE).to_bytes());

        let (_fs, dir) = directory_with_raw_entries(&raw);
        assert_eq!(names(dir), vec!["KEPT"]);
    }

    #[test]
    fn rewind_restarts_the_listing() {
        let mut image = make_image();
        create_file_via_fatfs(&mut image, "A.BIN", b"");
        create_file_via_fatfs(&mut image, "B.BIN", b"");
        let (_disk, fs) = mount_image(image);

        let mut dir = fs.open_directory("/").unwrap();
        let first: Vec<String> = dir.by_ref().map(|e| e.name).collect();
        assert!(dir.next().is_none());

        dir.rewind();
        let second: Vec<String> = dir.by_ref().map(|e| e.name).collect();
        assert_eq!(first, second);
        assert!(first.contains(&String::from("A.BIN")));
        fs.close_directory(dir).unwrap();
    }
}
