//! A mounted FAT32 volume.
//!
//! Mounting parses the EBPB and FSINFO, sizes the two block caches and opens
//! the root directory. Paths are resolved one component at a time, holding a
//! single directory open at any moment.
//!
//! Lock order, outermost first: open file table, one directory or file, then
//! either the FAT or the data cache.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use kernel_api_types::{ErrorCode, FileAttributes};

use crate::consts::{
    DEFAULT_TOTAL_RAM, EBPB_OFFSET, EBPB_SIGNATURE, FAT32_FILESYSTEM_TYPE, KB, MAX_DATA_CACHE_SIZE,
    MAX_FAT_CACHE_SIZE, MIN_CLUSTER_COUNT_FOR_FAT32, PAGE_SIZE, RESERVED_CLUSTER_COUNT,
};
use crate::directory::{self, Cursor, Directory};
use crate::disk_cache::{DiskCache, Mirrors};
use crate::fat_table::{FatTable, FreeMode};
use crate::file::{File, Identifier};
use crate::open_files::OpenFileTable;
use crate::path;
use crate::short_name::{self, NameEncoding};
use crate::storage::{self, LbaRange, StorageDevice};
use crate::structures::{
    Attributes, CHARACTERS_PER_ENTRY, CaseInfo, DELETED_MARK, END_OF_DIRECTORY_MARK, Ebpb, FsInfo, LongNameEntry,
    RawDirEntry,
};
use crate::time::{Clock, EpochClock};
use crate::volume::Volume;

#[derive(Clone)]
pub struct MountOptions {
    /// Physical memory of the machine, the caches are sized relative to it.
    pub total_ram_bytes: u64,
    pub max_fat_cache_bytes: u64,
    pub max_data_cache_bytes: u64,
    /// Source of the timestamps written into directory entries.
    pub clock: Arc<dyn Clock>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            total_ram_bytes: DEFAULT_TOTAL_RAM,
            max_fat_cache_bytes: MAX_FAT_CACHE_SIZE,
            max_data_cache_bytes: MAX_DATA_CACHE_SIZE,
            clock: Arc::new(EpochClock),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnlyIf {
    File,
    Directory,
}

pub struct Fat32 {
    volume: Arc<Volume>,
    open_files: OpenFileTable,
    root: Arc<File>,
    /// Absolute LBA of an FSINFO sector with valid signatures.
    fsinfo_lba: Option<u64>,
    /// `(free clusters, last allocated)` as last written to FSINFO. Also serializes `sync`.
    synced_fsinfo: spin::Mutex<Option<(u32, u32)>>,
}

fn round_down_to_page(bytes: u64) -> u64 {
    bytes - bytes % PAGE_SIZE as u64
}

fn validate_ebpb(ebpb: &Ebpb, logical_block_size: usize) -> Result<(), ErrorCode> {
    if ebpb.bytes_per_sector as usize != logical_block_size {
        log::warn!(
            "FAT32: EBPB contains incorrect logical block size, expected {} got {}",
            logical_block_size,
            ebpb.bytes_per_sector
        );
        return Err(ErrorCode::InvalidArgument);
    }

    if ebpb.signature != EBPB_SIGNATURE {
        log::warn!("FAT32: bad EBPB signature, expected {:#x} got {:#x}", EBPB_SIGNATURE, ebpb.signature);
        return Err(ErrorCode::Unsupported);
    }

    if &ebpb.filesystem_type != FAT32_FILESYSTEM_TYPE {
        log::warn!("FAT32: unexpected filesystem type {:?}", ebpb.filesystem_type);
        return Err(ErrorCode::Unsupported);
    }

    if !ebpb.sectors_per_cluster.is_power_of_two() || ebpb.fat_count == 0 || ebpb.sectors_per_fat == 0 {
        log::warn!(
            "FAT32: bad geometry: {} sector(s) per cluster, {} FATs, {} sectors per FAT",
            ebpb.sectors_per_cluster,
            ebpb.fat_count,
            ebpb.sectors_per_fat
        );
        return Err(ErrorCode::Unsupported);
    }

    Ok(())
}

/// Counters straight from FSINFO, trusted only when they are in range.
fn fsinfo_counters(fsinfo: &FsInfo, cluster_count: u32) -> Option<(u32, u32)> {
    if fsinfo.free_cluster_count == u32::MAX || fsinfo.free_cluster_count > cluster_count {
        log::warn!("FAT32: FSINFO contains invalid free cluster count of {}", fsinfo.free_cluster_count);
        return None;
    }

    if fsinfo.last_allocated_cluster < RESERVED_CLUSTER_COUNT || fsinfo.last_allocated_cluster >= cluster_count {
        log::warn!("FAT32: FSINFO contains invalid last allocated cluster {}", fsinfo.last_allocated_cluster);
        return None;
    }

    Some((fsinfo.free_cluster_count, fsinfo.last_allocated_cluster))
}

impl Fat32 {
    /// Mounts the FAT32 volume occupying `lba_range` of `device`.
    ///
    /// A volume that isn't FAT32 fails with `Unsupported`, one whose sector size
    /// doesn't match the device with `InvalidArgument`.
    pub fn mount(device: Arc<dyn StorageDevice>, lba_range: LbaRange, options: MountOptions) -> Result<Self, ErrorCode> {
        let info = device.query_info();
        if info.logical_block_size != 512 && info.logical_block_size != 4096 {
            log::warn!("FAT32: unsupported logical block size {}", info.logical_block_size);
            return Err(ErrorCode::Unsupported);
        }

        let lba_count = ((PAGE_SIZE / info.logical_block_size) as u64).min(lba_range.length());
        if lba_count == 0 {
            return Err(ErrorCode::InvalidArgument);
        }

        let mut meta = vec![0u8; lba_count as usize * info.logical_block_size];
        storage::read_blocking(&*device, &mut meta, LbaRange::new(lba_range.begin(), lba_count));

        let ebpb = Ebpb::parse(&meta[EBPB_OFFSET..EBPB_OFFSET + Ebpb::SIZE]);
        validate_ebpb(&ebpb, info.logical_block_size)?;

        log::info!(
            "FAT32: successfully parsed EBPB: {} FATs, {} sector(s) per cluster, {} sectors per FAT",
            ebpb.fat_count,
            ebpb.sectors_per_cluster,
            ebpb.sectors_per_fat
        );

        let sectors_per_fat = ebpb.sectors_per_fat as u64;

        let mut fat_range = lba_range;
        fat_range.advance_begin_by(ebpb.reserved_sectors as u64);
        let mirrors = if ebpb.is_mirroring_enabled() {
            Mirrors { count: ebpb.fat_count as u32 - 1, stride: sectors_per_fat }
        } else {
            if ebpb.active_fat() >= ebpb.fat_count {
                log::warn!("FAT32: active FAT {} out of {}", ebpb.active_fat(), ebpb.fat_count);
                return Err(ErrorCode::Unsupported);
            }
            fat_range.advance_begin_by(ebpb.active_fat() as u64 * sectors_per_fat);
            Mirrors::default()
        };
        fat_range.set_length(sectors_per_fat);

        let mut data_range = lba_range;
        data_range.advance_begin_by(ebpb.reserved_sectors as u64);
        data_range.advance_begin_by(sectors_per_fat * ebpb.fat_count as u64);

        let fat_capacity = sectors_per_fat * ebpb.bytes_per_sector as u64 / 4 - RESERVED_CLUSTER_COUNT as u64;
        let cluster_count = (data_range.length() / ebpb.sectors_per_cluster as u64).min(fat_capacity);
        if cluster_count < MIN_CLUSTER_COUNT_FOR_FAT32 {
            log::warn!(
                "FAT32: cluster count is too low, expected at least {} got {}",
                MIN_CLUSTER_COUNT_FOR_FAT32,
                cluster_count
            );
            return Err(ErrorCode::Unsupported);
        }
        let cluster_count = cluster_count as u32;

        let root_cluster = ebpb.root_dir_cluster;
        if !(RESERVED_CLUSTER_COUNT..cluster_count + RESERVED_CLUSTER_COUNT).contains(&root_cluster) {
            log::warn!("FAT32: root directory cluster {} is out of range", root_cluster);
            return Err(ErrorCode::Unsupported);
        }

        let bytes_per_cluster = ebpb.sectors_per_cluster as usize * ebpb.bytes_per_sector as usize;
        let one_percent_of_ram = options.total_ram_bytes / 100;

        let fat_cache_size = one_percent_of_ram
            .min(options.max_fat_cache_bytes)
            .min(sectors_per_fat * ebpb.bytes_per_sector as u64);
        log::info!("FAT32: FAT cache size is ~{} KB", fat_cache_size / KB);
        let fat_cache_entries = (round_down_to_page(fat_cache_size) / 4) as usize;

        let data_cache_size = (one_percent_of_ram * 2)
            .min(options.max_data_cache_bytes)
            .min(cluster_count as u64 * bytes_per_cluster as u64);
        log::info!("FAT32: data cache size is ~{} KB", data_cache_size / KB);
        let data_cache_clusters = (round_down_to_page(data_cache_size) / bytes_per_cluster as u64) as usize;

        let fat_cache = DiskCache::with_mirrors(device.clone(), fat_range, 4, fat_cache_entries, mirrors);
        let data_cache = DiskCache::new(device.clone(), data_range, bytes_per_cluster, data_cache_clusters);
        let mut fat = FatTable::new(fat_cache, cluster_count);

        let mut fsinfo_lba = None;
        let mut synced_fsinfo = None;

        if ebpb.has_fsinfo() {
            let sector = ebpb.fs_information_sector as u64;
            log::debug!("FAT32: FSINFO at sector {}", sector);

            let fsinfo = if sector < lba_count {
                FsInfo::parse(&meta[sector as usize * info.logical_block_size..])
            } else {
                let mut buffer = vec![0u8; info.logical_block_size];
                storage::read_blocking(&*device, &mut buffer, LbaRange::new(lba_range.begin() + sector, 1));
                FsInfo::parse(&buffer)
            };

            match fsinfo.first_invalid_signature() {
                Some(index) => log::warn!("FAT32: FSINFO signature {} is invalid", index),
                None => {
                    fsinfo_lba = Some(lba_range.begin() + sector);

                    if let Some((free, last_allocated)) = fsinfo_counters(&fsinfo, cluster_count) {
                        log::info!(
                            "FAT32: FSINFO seems to be valid: last allocated cluster {}, free clusters {}",
                            last_allocated,
                            free
                        );
                        fat.set_free_state(free, last_allocated + 1);
                        synced_fsinfo = Some((free, last_allocated));
                    }
                }
            }
        } else {
            log::info!("FAT32: no FSINFO sector for this volume");
        }

        if synced_fsinfo.is_none() {
            fat.recompute_free_state();
        }

        log::info!("FAT32: total cluster count {}, free clusters {}", cluster_count, fat.free_clusters());
        log::info!("FAT32: end of chain is {:#x}", fat.end_of_chain());

        let volume = Arc::new(Volume {
            device,
            lba_range,
            ebpb,
            bytes_per_cluster,
            root_cluster,
            fat: spin::Mutex::new(fat),
            data: spin::Mutex::new(data_cache),
            clock: options.clock,
        });

        let open_files = OpenFileTable::default();
        let root = open_files.lock().open_or_incref(Identifier::ROOT, || {
            File::new(String::from("/"), FileAttributes::IS_DIRECTORY, Identifier::ROOT, root_cluster, 0, volume.clone())
        });

        Ok(Self { volume, open_files, root, fsinfo_lba, synced_fsinfo: spin::Mutex::new(synced_fsinfo) })
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.volume.bytes_per_cluster
    }

    pub fn cluster_count(&self) -> u32 {
        self.volume.fat.lock().cluster_count()
    }

    pub fn free_clusters(&self) -> u32 {
        self.volume.fat.lock().free_clusters()
    }

    /// How many handles to the entry at `identifier` are open, 0 if it isn't.
    pub fn open_count(&self, identifier: Identifier) -> usize {
        self.open_files.lock().refcount(identifier)
    }

    pub fn lba_range(&self) -> LbaRange {
        self.volume.lba_range
    }

    #[cfg(test)]
    pub(crate) fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    fn release(&self, file: &Arc<File>) {
        let result = self.open_files.lock().close(file);
        debug_assert!(result.is_ok(), "FAT32: released {:?} more often than it was opened", file);
    }

    /// Opens `name` inside `directory`.
    ///
    /// The scan runs under the directory lock alone. The table lock is taken
    /// afterwards, and if the directory changed in between the lookup starts over.
    fn open_child(&self, directory: &Arc<File>, name: &str) -> Result<Arc<File>, ErrorCode> {
        if !directory.is_directory() {
            return Err(ErrorCode::IsFile);
        }

        loop {
            let (entry, generation) = {
                let state = directory.lock();
                let (entry, _) =
                    directory::find_entry(&self.volume, state.first_cluster(), name).ok_or(ErrorCode::NoSuchFile)?;
                (entry, state.generation())
            };

            let mut open_files = self.open_files.lock();
            if directory.lock().generation() != generation {
                log::trace!("FAT32: {} changed while looking up {}, retrying", directory.name(), name);
                continue;
            }

            return Ok(open_files.open_or_incref(entry.identifier(), || {
                File::new(
                    entry.name.clone(),
                    entry.attributes(),
                    entry.identifier(),
                    entry.first_data_cluster(),
                    entry.entry.size,
                    self.volume.clone(),
                )
            }));
        }
    }

    fn open_components(&self, components: &[&str], only_if: OnlyIf) -> Result<Arc<File>, ErrorCode> {
        let mut current = self.open_files.lock().incref(&self.root);

        for name in components {
            let next = self.open_child(&current, name);
            self.release(&current);
            current = next?;
        }

        let error = match only_if {
            OnlyIf::File if current.is_directory() => ErrorCode::IsDirectory,
            OnlyIf::Directory if !current.is_directory() => ErrorCode::IsFile,
            _ => return Ok(current),
        };

        self.release(&current);
        Err(error)
    }

    /// Opens a regular file. Every call must be paired with [`Self::close`].
    pub fn open(&self, path: &str) -> Result<Arc<File>, ErrorCode> {
        let components = path::components(path)?;
        self.open_components(&components, OnlyIf::File)
    }

    pub fn close(&self, file: Arc<File>) -> Result<(), ErrorCode> {
        let mut open_files = self.open_files.lock();

        // The volume keeps its own reference to the root.
        if Arc::ptr_eq(&file, &self.root) && open_files.refcount(Identifier::ROOT) <= 1 {
            return Err(ErrorCode::InvalidArgument);
        }

        open_files.close(&file)
    }

    pub fn open_directory(&self, path: &str) -> Result<Directory, ErrorCode> {
        let components = path::components(path)?;
        let file = self.open_components(&components, OnlyIf::Directory)?;
        Ok(Directory::new(file))
    }

    pub fn close_directory(&self, directory: Directory) -> Result<(), ErrorCode> {
        self.close(directory.into_file())
    }

    /// Creates an empty file, or a directory when `attributes` has `IS_DIRECTORY`.
    pub fn create(&self, path: &str, attributes: FileAttributes) -> Result<(), ErrorCode> {
        let (parent_path, name) = path::split_leaf(path)?;
        let parent = self.open_components(&parent_path, OnlyIf::Directory)?;

        let result = self.create_in(&parent, name, attributes);
        self.release(&parent);
        result
    }

    fn create_in(&self, parent: &File, name: &str, attributes: FileAttributes) -> Result<(), ErrorCode> {
        let volume = &*self.volume;
        let mut state = parent.lock();

        let (mut needs_long_name, mut alias, mut case_info) = match short_name::classify(name) {
            NameEncoding::Short { name: alias, case_info } => (false, alias, case_info),
            NameEncoding::Long => (true, short_name::generate_short_name(name), CaseInfo::empty()),
        };

        // Rescan from the top after every alias collision.
        let mut cursor = Cursor::new(state.first_cluster());
        loop {
            let mut collides = false;
            while let Some(entry) = cursor.next_native(volume) {
                if entry.matches(name) {
                    return Err(ErrorCode::FileAlreadyExists);
                }
                collides |= entry.entry.short_name() == alias;
            }

            if !collides {
                break;
            }

            // Only generated aliases collide without the name itself matching.
            needs_long_name = true;
            case_info = CaseInfo::empty();
            alias = short_name::next_short_name(&alias).ok_or(ErrorCode::BadFilename)?;
            cursor.rewind(state.first_cluster());
        }

        let is_directory = attributes.contains(FileAttributes::IS_DIRECTORY);
        let long_entries = if needs_long_name { name.len().div_ceil(CHARACTERS_PER_ENTRY) } else { 0 };

        let data_cluster = match is_directory {
            true => Some(volume.allocate_cluster_chain(1, None)?[0]),
            false => None,
        };

        let mut slot = match directory::allocate_entries(volume, &mut state, long_entries + 1) {
            Ok(slot) => slot,
            Err(error) => {
                if let Some(cluster) = data_cluster {
                    volume.free_cluster_chain_starting_at(cluster, FreeMode::IncludingFirst);
                }
                return Err(error);
            }
        };

        // A directory that had no clusters at all just got its first one.
        if state.is_dirty() {
            parent.flush_locked(&mut state);
        }

        let (date, time) = volume.clock.now().to_dos();
        let mut entry = RawDirEntry::new(&alias, if is_directory { Attributes::SUBDIRECTORY } else { Attributes::ARCHIVE });
        entry.case_info = case_info;
        entry.created_date = date;
        entry.created_time = time;
        entry.last_modified_date = date;
        entry.last_modified_time = time;
        entry.last_accessed_date = date;
        if let Some(cluster) = data_cluster {
            entry.set_first_cluster(cluster);
        }

        if long_entries != 0 {
            let checksum = short_name::checksum(&alias);
            let bytes = name.as_bytes();

            for sequence in (1..=long_entries).rev() {
                let begin = (sequence - 1) * CHARACTERS_PER_ENTRY;
                let end = (begin + CHARACTERS_PER_ENTRY).min(bytes.len());
                let long = LongNameEntry::for_fragment(sequence as u8, sequence == long_entries, &bytes[begin..end], checksum);
                slot.write_next(volume, &long.to_bytes());
            }
        }

        let identifier = slot.write_next(volume, &entry.to_bytes());
        state.bump_generation();

        if let Some(cluster) = data_cluster {
            let parent_cluster = if parent.identifier() == Identifier::ROOT { 0 } else { state.first_cluster() };
            self.write_dot_entries(cluster, parent_cluster, date, time);
        }

        log::debug!("FAT32: created {} at {:?}, {} long entries", name, identifier, long_entries);
        Ok(())
    }

    fn write_dot_entries(&self, cluster: u32, parent_cluster: u32, date: u16, time: u16) {
        self.volume.zero_cluster(cluster);

        for (offset, name, target) in [(0, b".          ", cluster), (32, b"..         ", parent_cluster)] {
            let mut entry = RawDirEntry::new(name, Attributes::SUBDIRECTORY);
            entry.set_first_cluster(target);
            entry.created_date = date;
            entry.created_time = time;
            entry.last_modified_date = date;
            entry.last_modified_time = time;
            entry.last_accessed_date = date;
            self.volume.write_data(cluster, offset, &entry.to_bytes());
        }
    }

    /// Removes a file or an empty directory.
    pub fn remove(&self, path: &str) -> Result<(), ErrorCode> {
        let components = path::components(path)?;
        let Some((name, parent_path)) = components.split_last() else {
            return Err(ErrorCode::AccessDenied);
        };

        let parent = self.open_components(parent_path, OnlyIf::Directory)?;
        let result = self.remove_in(&parent, name);
        self.release(&parent);
        result
    }

    fn remove_in(&self, parent: &File, name: &str) -> Result<(), ErrorCode> {
        let volume = &*self.volume;

        let (entry, mut cursor, mut state, open_files) = loop {
            let (entry, cursor, generation) = {
                let state = parent.lock();
                let (entry, cursor) =
                    directory::find_entry(volume, state.first_cluster(), name).ok_or(ErrorCode::NoSuchFile)?;
                (entry, cursor, state.generation())
            };

            // Held until the entry is gone so nobody can open it in the meantime.
            let open_files = self.open_files.lock();
            let state = parent.lock();
            if state.generation() == generation {
                break (entry, cursor, state, open_files);
            }
        };

        if open_files.contains(entry.identifier()) {
            return Err(ErrorCode::FileIsBusy);
        }

        // Nothing can be created in it while it isn't open and the table is locked.
        if entry.entry.is_directory() && Cursor::new(entry.first_data_cluster()).next_native(volume).is_some() {
            return Err(ErrorCode::FileIsBusy);
        }

        let first_data_cluster = entry.first_data_cluster();
        if first_data_cluster >= RESERVED_CLUSTER_COUNT {
            volume.free_cluster_chain_starting_at(first_data_cluster, FreeMode::IncludingFirst);
        }

        let is_last = cursor.at_end(volume);
        let first_entry_cluster = entry.clusters[0];
        let owns_its_clusters = entry.first_entry_offset == 0 && first_entry_cluster != state.first_cluster();

        if is_last && owns_its_clusters {
            // Nothing else lives in the clusters this entry starts, cut them off the directory.
            let (length, predecessor) = self.cluster_before(state.first_cluster(), first_entry_cluster);
            volume.free_cluster_chain_starting_at(predecessor, FreeMode::KeepFirst);
            state.truncate_chain(length, predecessor);
        } else {
            let marker = if is_last { END_OF_DIRECTORY_MARK } else { DELETED_MARK };
            for (cluster, offset) in entry.entry_positions(volume.bytes_per_cluster) {
                volume.write_data(cluster, offset as usize, &[marker]);
            }
        }

        state.bump_generation();
        log::debug!("FAT32: removed {} ({:?})", name, entry.identifier());
        Ok(())
    }

    /// The cluster preceding `target` in the chain at `first`, with its 1-based position.
    fn cluster_before(&self, first: u32, target: u32) -> (u32, u32) {
        let mut cluster = first;
        let mut position = 1;

        loop {
            match self.volume.next_in_chain(cluster) {
                Some(next) if next == target => return (position, cluster),
                Some(next) => {
                    cluster = next;
                    position += 1;
                }
                None => panic!("FAT32: cluster {} is not part of the chain at {}", target, first),
            }
        }
    }

    /// Renaming isn't supported, within a volume or across volumes.
    pub fn move_file(&self, _path: &str, _new_path: &str) -> Result<(), ErrorCode> {
        Err(ErrorCode::Unsupported)
    }

    pub fn copy_file(&self, _path: &str, _new_path: &str) -> Result<(), ErrorCode> {
        Err(ErrorCode::Unsupported)
    }

    /// Writes every dirty cache block back, then FSINFO if the free counters
    /// moved since the last time it was written.
    pub fn sync(&self) {
        let mut synced = self.synced_fsinfo.lock();

        let (fat_blocks, free, next_free) = {
            let mut fat = self.volume.fat.lock();
            (fat.flush(), fat.free_clusters(), fat.next_free_hint())
        };
        let data_blocks = self.volume.data.lock().flush();
        log::debug!("FAT32: sync flushed {} FAT and {} data blocks", fat_blocks, data_blocks);

        let Some(lba) = self.fsinfo_lba else {
            return;
        };

        let counters = (free, next_free.saturating_sub(1).max(RESERVED_CLUSTER_COUNT));
        if *synced == Some(counters) {
            log::debug!("FAT32: FSINFO is up to date");
            return;
        }

        let logical_block_size = self.volume.device.query_info().logical_block_size;
        let mut sector = vec![0u8; logical_block_size];
        let range = LbaRange::new(lba, 1);
        storage::read_blocking(&*self.volume.device, &mut sector, range);
        FsInfo::write_counters(&mut sector, counters.0, counters.1);
        storage::write_blocking(&*self.volume.device, &sector, range);

        log::debug!("FAT32: FSINFO updated, {} free clusters, last allocated {}", counters.0, counters.1);
        *synced = Some(counters);
    }
}
