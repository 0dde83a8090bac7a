// Host-side helpers shared by the unit tests: an in-memory disk and fatfs-built images.

extern crate std;

use std::io::{Cursor, Read, Write};
use std::string::String;
use std::sync::Arc;
use std::vec;
use std::vec::Vec;

use crate::fat32::{Fat32, MountOptions};
use crate::storage::{AsyncRequest, LbaRange, RequestBuffer, StorageDevice, StorageInfo};

/// Block device backed by a `Vec<u8>` that remembers every LBA it was asked to write.
pub struct MemDisk {
    block_size: usize,
    data: spin::Mutex<Vec<u8>>,
    writes: spin::Mutex<Vec<u64>>,
}

impl MemDisk {
    pub fn new(block_size: usize, bytes: Vec<u8>) -> Arc<Self> {
        assert_eq!(bytes.len() % block_size, 0);
        Arc::new(Self { block_size, data: spin::Mutex::new(bytes), writes: spin::Mutex::new(Vec::new()) })
    }

    pub fn zeroed(block_size: usize, blocks: usize) -> Arc<Self> {
        Self::new(block_size, vec![0u8; block_size * blocks])
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn writes_to(&self, lba: u64) -> usize {
        self.writes.lock().iter().filter(|&&w| w == lba).count()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

impl StorageDevice for MemDisk {
    fn query_info(&self) -> StorageInfo {
        let len = self.data.lock().len();
        StorageInfo {
            logical_block_size: self.block_size,
            block_count: (len / self.block_size) as u64,
            optimal_read_size: 4096,
        }
    }

    fn submit_request(&self, request: &mut AsyncRequest<'_>) {
        let range = request.lba_range();
        let off = range.begin() as usize * self.block_size;
        let len = range.length() as usize * self.block_size;
        let mut data = self.data.lock();
        if off + len > data.len() {
            request.complete(false);
            return;
        }
        match request.buffer() {
            RequestBuffer::Read(buf) => buf[..len].copy_from_slice(&data[off..off + len]),
            RequestBuffer::Write(buf) => {
                data[off..off + len].copy_from_slice(&buf[..len]);
                let mut writes = self.writes.lock();
                writes.extend(range.begin()..range.end());
            }
        }
        request.complete(true);
    }
}

/// Formats a 40 MiB FAT32 image with `fatfs`.
///
/// FAT32 needs at least 65 525 clusters; with the `Fat32` hint fatfs picks
/// 512 byte clusters, so anything below ~34 MiB would be rejected.
pub fn make_image() -> Vec<u8> {
    make_image_with_sectors(40 * 1024 * 1024, 512)
}

/// A FAT32 image of `size` bytes with `bytes_per_sector` sized sectors.
/// Clusters are at least one sector, so 4 KiB sectors need ~270 MiB.
pub fn make_image_with_sectors(size: usize, bytes_per_sector: u16) -> Vec<u8> {
    let mut cursor = Cursor::new(vec![0u8; size]);
    let options = fatfs::FormatVolumeOptions::new()
        .fat_type(fatfs::FatType::Fat32)
        .bytes_per_sector(bytes_per_sector);
    fatfs::format_volume(&mut cursor, options).expect("format_volume failed");
    cursor.into_inner()
}

pub fn create_file_via_fatfs(image: &mut Vec<u8>, path: &str, content: &[u8]) {
    let mut cursor = Cursor::new(image);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).expect("FileSystem::new failed");
    let mut f = fs.root_dir().create_file(path).expect("create_file failed");
    f.truncate().unwrap();
    f.write_all(content).unwrap();
}

pub fn create_dir_via_fatfs(image: &mut Vec<u8>, path: &str) {
    let mut cursor = Cursor::new(image);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).expect("FileSystem::new failed");
    fs.root_dir().create_dir(path).expect("create_dir failed");
}

pub fn image_with_file(name: &str, content: &[u8]) -> Vec<u8> {
    let mut image = make_image();
    create_file_via_fatfs(&mut image, name, content);
    image
}

pub fn read_via_fatfs(image: &mut Vec<u8>, path: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(image);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let mut f = fs.root_dir().open_file(path).unwrap();
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).unwrap();
    buf
}

/// Long names of every entry in `dir` (root when empty), without the dot entries.
pub fn names_via_fatfs(image: &mut Vec<u8>, dir: &str) -> Vec<String> {
    let mut cursor = Cursor::new(image);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let dir = if dir.is_empty() { fs.root_dir() } else { fs.root_dir().open_dir(dir).unwrap() };
    let names = dir
        .iter()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n != "." && n != "..")
        .collect();
    names
}

pub fn mount(disk: &Arc<MemDisk>) -> Fat32 {
    let blocks = disk.query_info().block_count;
    Fat32::mount(disk.clone(), LbaRange::new(0, blocks), MountOptions::default()).expect("mount failed")
}

pub fn mount_image(image: Vec<u8>) -> (Arc<MemDisk>, Fat32) {
    let disk = MemDisk::new(512, image);
    let fs = mount(&disk);
    (disk, fs)
}
