//! In-memory file objects.
//!
//! There is at most one `File` per directory entry on the volume, handed out
//! by the open file table. Its lock guards the size and the cluster chain and
//! is held for the whole of a read, a write or a metadata flush.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::ops::Range;

use kernel_api_types::{ErrorCode, FileAttributes};

use crate::consts::DIRECTORY_ENTRY_SIZE;
use crate::structures::RawDirEntry;
use crate::volume::Volume;

/// Location of a file's short directory entry: `(cluster, byte offset within the cluster)`.
///
/// The first data cluster can't serve as an identity since every empty file has
/// a first cluster of 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier {
    pub cluster: u32,
    pub offset: u32,
}

impl Identifier {
    /// The root directory has no directory entry of its own.
    pub const ROOT: Identifier = Identifier { cluster: 0, offset: 0 };
}

pub(crate) struct FileState {
    first_cluster: u32,
    size: u32,
    /// `(chain length, last cluster)`, filled in on first use.
    tail: Option<(u32, u32)>,
    dirty: bool,
    /// Bumped whenever entries are added to or removed from a directory.
    generation: u64,
}

impl FileState {
    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn chain_tail(&mut self, volume: &Volume) -> (u32, u32) {
        if self.first_cluster == 0 {
            return (0, 0);
        }

        *self.tail.get_or_insert_with(|| volume.chain_tail(self.first_cluster))
    }

    /// Records clusters that were just linked to the end of the chain.
    pub fn append_clusters(&mut self, clusters: &[u32], previous_length: u32) {
        let Some(&last) = clusters.last() else { return };

        if self.first_cluster == 0 {
            self.first_cluster = clusters[0];
            self.dirty = true;
        }
        self.tail = Some((previous_length + clusters.len() as u32, last));
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// The chain now ends at `last` after having been cut to `length` clusters.
    pub fn truncate_chain(&mut self, length: u32, last: u32) {
        self.tail = Some((length, last));
    }
}

pub struct File {
    name: String,
    attributes: FileAttributes,
    identifier: Identifier,
    volume: Arc<Volume>,
    state: spin::Mutex<FileState>,
}

impl File {
    pub(crate) fn new(
        name: String,
        attributes: FileAttributes,
        identifier: Identifier,
        first_cluster: u32,
        size: u32,
        volume: Arc<Volume>,
    ) -> Self {
        Self {
            name,
            attributes,
            identifier,
            volume,
            state: spin::Mutex::new(FileState { first_cluster, size, tail: None, dirty: false, generation: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> FileAttributes {
        self.attributes
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::IS_DIRECTORY)
    }

    pub fn size(&self) -> u32 {
        self.state.lock().size
    }

    pub fn first_cluster(&self) -> u32 {
        self.state.lock().first_cluster
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub(crate) fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, FileState> {
        self.state.lock()
    }

    /// Calls `f(cluster, offset within cluster, range of the request)` for every
    /// cluster-sized piece of `[offset, offset + length)`.
    fn for_each_chunk(&self, first_cluster: u32, offset: u64, length: usize, mut f: impl FnMut(u32, usize, Range<usize>)) {
        assert!(first_cluster != 0, "FAT32: {} has data past its last cluster", self.name);

        let bytes_per_cluster = self.volume.bytes_per_cluster;
        let mut cluster = self.volume.nth_cluster_in_chain(first_cluster, (offset / bytes_per_cluster as u64) as u32);
        let mut offset_within_cluster = (offset % bytes_per_cluster as u64) as usize;
        let mut done = 0;

        while done < length {
            let chunk = (bytes_per_cluster - offset_within_cluster).min(length - done);
            f(cluster, offset_within_cluster, done..done + chunk);
            done += chunk;

            if done < length {
                cluster = self.volume.next_in_chain(cluster).unwrap_or_else(|| {
                    panic!("FAT32: chain of {} ends before byte {}", self.name, offset + done as u64)
                });
                offset_within_cluster = 0;
            }
        }
    }

    /// Reads up to `buffer.len()` bytes at `offset`. Returns how many bytes were
    /// read, 0 at or past the end of the file.
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> usize {
        let state = self.state.lock();
        let size = state.size as u64;

        if offset >= size || buffer.is_empty() {
            return 0;
        }

        let length = buffer.len().min((size - offset) as usize);
        self.for_each_chunk(state.first_cluster, offset, length, |cluster, offset_within_cluster, range| {
            self.volume.read_data(cluster, offset_within_cluster, &mut buffer[range]);
        });

        length
    }

    /// Writes `buffer` at `offset`, growing the file as needed. Any hole between
    /// the old end of the file and `offset` reads back as zeroes.
    pub fn write(&self, offset: u64, buffer: &[u8]) -> Result<usize, ErrorCode> {
        if self.is_directory() {
            return Err(ErrorCode::IsDirectory);
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(buffer.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or(ErrorCode::InvalidArgument)?;

        let bytes_per_cluster = self.volume.bytes_per_cluster as u64;
        let mut state = self.state.lock();
        let (chain_length, last_cluster) = state.chain_tail(&self.volume);
        let clusters_needed = end.div_ceil(bytes_per_cluster) as u32;

        if clusters_needed > chain_length {
            let link_to = (chain_length != 0).then_some(last_cluster);
            let new_clusters = self.volume.allocate_cluster_chain(clusters_needed - chain_length, link_to)?;

            for (i, &cluster) in new_clusters.iter().enumerate() {
                let begin = (chain_length as u64 + i as u64) * bytes_per_cluster;
                let fully_overwritten = offset <= begin && end >= begin + bytes_per_cluster;
                if !fully_overwritten {
                    self.volume.zero_cluster(cluster);
                }
            }

            state.append_clusters(&new_clusters, chain_length);
        }

        // Stale bytes past the old size in clusters the file already owned.
        let size = state.size as u64;
        let gap_end = offset.min(chain_length as u64 * bytes_per_cluster);
        if gap_end > size {
            self.for_each_chunk(state.first_cluster, size, (gap_end - size) as usize, |cluster, at, range| {
                self.volume.write_data(cluster, at, &vec![0u8; range.len()]);
            });
        }

        self.for_each_chunk(state.first_cluster, offset, buffer.len(), |cluster, at, range| {
            self.volume.write_data(cluster, at, &buffer[range]);
        });

        if end > size {
            state.size = end as u32;
            state.dirty = true;
        }

        if state.dirty {
            self.flush_locked(&mut state);
        }

        Ok(buffer.len())
    }

    /// Writes the size and first cluster back into the file's directory entry.
    pub fn flush_meta_modifications(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    /// Same as [`Self::flush_meta_modifications`] for a caller already holding the lock.
    pub(crate) fn flush_locked(&self, state: &mut FileState) {
        if self.identifier == Identifier::ROOT {
            state.dirty = false;
            return;
        }

        let Identifier { cluster, offset } = self.identifier;
        let mut bytes = [0u8; DIRECTORY_ENTRY_SIZE];
        self.volume.read_data(cluster, offset as usize, &mut bytes);

        let mut entry = RawDirEntry::from_bytes(&bytes);
        entry.set_first_cluster(state.first_cluster);
        if !self.is_directory() {
            entry.size = state.size;
        }

        let (date, time) = self.volume.clock.now().to_dos();
        entry.last_modified_date = date;
        entry.last_modified_time = time;
        entry.last_accessed_date = date;

        self.volume.write_data(cluster, offset as usize, &entry.to_bytes());
        state.dirty = false;
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}
