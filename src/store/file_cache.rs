//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mdbox.
//
// Mdbox is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mdbox is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mdbox. If not, see <http://www.gnu.org/licenses/>.

use std::collections::VecDeque;

use super::file::PhysicalFile;

/// A bounded cache of open, unlocked storage files.
///
/// Files are checked out with `take()` and returned with `release()`; a file
/// is never in the cache while someone is using it. When the cache is full,
/// the least recently released file is closed.
#[derive(Debug)]
pub struct FileCache {
    capacity: usize,
    /// Oldest first.
    files: VecDeque<PhysicalFile>,
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        FileCache {
            capacity,
            files: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn take(&mut self, file_id: u32) -> Option<PhysicalFile> {
        let ix = self.files.iter().position(|f| f.file_id() == file_id)?;
        self.files.remove(ix)
    }

    /// Return `file` to the cache, unlocking it.
    ///
    /// Files without an id are not worth caching and are simply closed.
    pub fn release(&mut self, mut file: PhysicalFile) {
        file.unlock();
        if 0 == file.file_id() || 0 == self.capacity {
            return;
        }

        if let Some(ix) =
            self.files.iter().position(|f| f.file_id() == file.file_id())
        {
            self.files.remove(ix);
        }

        while self.files.len() >= self.capacity {
            self.files.pop_front();
        }
        self.files.push_back(file);
    }

    /// Close `file_id` if it is cached, e.g. because it was deleted.
    pub fn forget(&mut self, file_id: u32) {
        let _ = self.take(file_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn make_file(root: &TempDir, file_id: u32) -> PhysicalFile {
        let mut file = PhysicalFile::create(root.path()).unwrap();
        file.finish_append().unwrap();
        file.assign_id(root.path(), file_id).unwrap();
        file
    }

    #[test]
    fn evicts_least_recently_released() {
        let root = TempDir::new().unwrap();
        let mut cache = FileCache::new(2);

        cache.release(make_file(&root, 1));
        cache.release(make_file(&root, 2));
        let one = cache.take(1).unwrap();
        cache.release(one);
        cache.release(make_file(&root, 3));

        assert_eq!(2, cache.len());
        assert!(cache.take(2).is_none());
        assert!(cache.take(1).is_some());
        assert!(cache.take(3).is_some());
        assert_eq!(0, cache.len());
    }

    #[test]
    fn released_files_are_unlocked() {
        let root = TempDir::new().unwrap();
        let mut cache = FileCache::new(4);

        let file = make_file(&root, 1);
        assert!(file.is_locked());
        cache.release(file);
        assert!(!cache.take(1).unwrap().is_locked());
    }

    #[test]
    fn uncommitted_files_are_not_cached() {
        let root = TempDir::new().unwrap();
        let mut cache = FileCache::new(4);
        cache.release(PhysicalFile::create(root.path()).unwrap());
        assert_eq!(0, cache.len());

        let mut zero = FileCache::new(0);
        zero.release(make_file(&root, 1));
        assert_eq!(0, zero.len());
    }
}
