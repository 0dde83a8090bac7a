//! Every open file and directory of a volume, keyed by the location of its
//! directory entry. The table is the only place `File`s are created, which
//! keeps a single in-memory instance per entry no matter how many times it is
//! opened.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use kernel_api_types::ErrorCode;

use crate::file::{File, Identifier};

struct OpenFile {
    file: Arc<File>,
    refcount: usize,
}

#[derive(Default)]
pub(crate) struct OpenFileTable {
    map: spin::Mutex<BTreeMap<Identifier, OpenFile>>,
}

impl OpenFileTable {
    /// Takes the table lock. Directory locks may be taken while holding it, never the other way around.
    pub fn lock(&self) -> OpenFiles<'_> {
        OpenFiles { map: self.map.lock() }
    }
}

pub(crate) struct OpenFiles<'a> {
    map: spin::MutexGuard<'a, BTreeMap<Identifier, OpenFile>>,
}

impl OpenFiles<'_> {
    /// Returns the live `File` for `identifier`, creating it with `make` on the
    /// first open. Either way the refcount goes up by one.
    pub fn open_or_incref(&mut self, identifier: Identifier, make: impl FnOnce() -> File) -> Arc<File> {
        let open = self
            .map
            .entry(identifier)
            .or_insert_with(|| OpenFile { file: Arc::new(make()), refcount: 0 });

        open.refcount += 1;
        open.file.clone()
    }

    /// Takes another reference to a file that is already open.
    pub fn incref(&mut self, file: &Arc<File>) -> Arc<File> {
        self.open_or_incref(file.identifier(), || unreachable!("FAT32: {:?} is not open", file))
    }

    /// Drops one reference, forgetting the file once the last one is gone.
    pub fn close(&mut self, file: &Arc<File>) -> Result<(), ErrorCode> {
        let identifier = file.identifier();
        let open = match self.map.get_mut(&identifier) {
            Some(open) if Arc::ptr_eq(&open.file, file) => open,
            _ => return Err(ErrorCode::InvalidArgument),
        };

        open.refcount -= 1;
        if open.refcount == 0 {
            self.map.remove(&identifier);
        }

        Ok(())
    }

    pub fn contains(&self, identifier: Identifier) -> bool {
        self.map.contains_key(&identifier)
    }

    pub fn refcount(&self, identifier: Identifier) -> usize {
        self.map.get(&identifier).map_or(0, |open| open.refcount)
    }
}
