#![no_std]

#[cfg(test)]
extern crate std;

pub mod fs;

pub use fs::{ErrorCode, FileAttributes};
