// Library crate root. No_std when not testing (e.g. `cargo check --target x86_64-unknown-none`).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod consts;
pub mod directory;
pub mod disk_cache;
pub mod fat32;
pub mod fat_table;
pub mod file;
mod open_files;
pub mod path;
pub mod short_name;
pub mod storage;
pub mod structures;
pub mod time;
mod volume;

#[cfg(test)]
mod test_support;

pub use directory::{Directory, DirectoryEntry};
pub use fat32::{Fat32, MountOptions};
pub use file::{File, Identifier};
pub use kernel_api_types::{ErrorCode, FileAttributes};
pub use storage::{AsyncRequest, LbaRange, StorageDevice, StorageInfo};
pub use time::{Clock, EpochClock, Timestamp};
