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

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use super::append::AppendContext;
use super::file::{file_name, PhysicalFile};
use super::file_cache::FileCache;
use super::map::Map;
use super::metadata::Metadata;
use super::save::SaveContext;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::StorageConfig;

/// A message read back out of storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub map_uid: u32,
    pub body: Vec<u8>,
    pub metadata: Metadata,
}

/// Summary of the state of a storage, as reported by `Storage::status()`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageStatus {
    pub uid_validity: u32,
    pub messages: usize,
    pub live_messages: usize,
    pub total_bytes: u64,
    pub dead_bytes: u64,
    pub files: BTreeSet<u32>,
    pub zero_ref_files: BTreeSet<u32>,
    pub want_purge: bool,
    pub files_corrupted: bool,
}

/// One process's handle on a storage directory.
///
/// Any number of `Storage` instances, in any number of processes, can work on
/// the same directory at once.
#[derive(Debug)]
pub struct Storage {
    pub(super) config: StorageConfig,
    pub(super) map: Map,
    pub(super) log_prefix: LogPrefix,
    files: FileCache,
    files_corrupted: Arc<AtomicBool>,
}

impl Storage {
    /// Open the storage described by `config`, creating it if `create` is
    /// true and it does not exist yet.
    pub fn open(
        config: StorageConfig,
        create: bool,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        let files_corrupted = Arc::new(AtomicBool::new(false));
        let map = Map::open(
            &config,
            create,
            log_prefix.clone(),
            Arc::clone(&files_corrupted),
        )?;

        Ok(Storage {
            files: FileCache::new(config.max_open_files),
            config,
            map,
            log_prefix,
            files_corrupted,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn map(&mut self) -> &mut Map {
        &mut self.map
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    /// Whether this instance has run into corrupted files or map entries.
    pub fn files_corrupted(&self) -> bool {
        self.files_corrupted.load(Ordering::Relaxed)
    }

    pub fn append_begin(&mut self) -> Result<AppendContext<'_>, Error> {
        AppendContext::begin(self)
    }

    pub fn save_begin(&mut self) -> Result<SaveContext<'_>, Error> {
        SaveContext::begin(self)
    }

    /// Get an unlocked handle on `file_id`, from the cache if possible.
    ///
    /// Returns `None` if the file does not exist.
    pub(super) fn open_file(
        &mut self,
        file_id: u32,
    ) -> Result<Option<PhysicalFile>, Error> {
        if let Some(file) = self.files.take(file_id) {
            return Ok(Some(file));
        }

        PhysicalFile::open(
            &self.config.path,
            self.config.alt_path.as_deref(),
            file_id,
        )
    }

    /// Return a file obtained from `open_file()` to the cache.
    pub(super) fn release_file(&mut self, file: PhysicalFile) {
        self.files.release(file);
    }

    pub(super) fn forget_cached_file(&mut self, file_id: u32) {
        self.files.forget(file_id);
    }

    /// Log that `path` is corrupt, flag this instance, and return the error
    /// to report.
    pub(super) fn set_file_corrupted(&self, path: &Path, reason: String) -> Error {
        error!(
            "{} Storage file corrupted: {}: {}",
            self.log_prefix,
            path.display(),
            reason
        );
        self.files_corrupted.store(true, Ordering::Relaxed);
        Error::FileCorrupted {
            path: path.to_owned(),
            reason,
        }
    }

    pub(super) fn note_error(&self, e: &Error) {
        if e.is_corruption() {
            self.files_corrupted.store(true, Ordering::Relaxed);
        }
    }

    /// Read the body and metadata of `map_uid`.
    pub fn read_message(&mut self, map_uid: u32) -> Result<StoredMessage, Error> {
        let mut refreshed = false;
        loop {
            let rec = self.map.lookup_rec(map_uid)?.ok_or(Error::NxMessage)?;
            let file = match self.open_file(rec.file_id)? {
                Some(file) => file,
                // The message may have been moved by a purge we haven't seen
                // yet
                None if !refreshed => {
                    refreshed = true;
                    self.map.refresh()?;
                    continue;
                }
                None => {
                    warn!(
                        "{} File unexpectedly lost: {}",
                        self.log_prefix,
                        file_name(rec.file_id)
                    );
                    return Err(self.map.set_corrupted(format!(
                        "map_uid={} is in missing file {}",
                        map_uid,
                        file_name(rec.file_id)
                    )));
                }
            };

            let path = file.path().to_owned();
            let envelope = file.read_envelope(u64::from(rec.offset));
            self.release_file(file);

            return match envelope? {
                Some(envelope) => Ok(StoredMessage {
                    map_uid,
                    body: envelope.body,
                    metadata: Metadata::decode_lines(&envelope.metadata),
                }),
                None => Err(self.set_file_corrupted(
                    &path,
                    format!(
                        "Broken offset {} for map_uid={}",
                        rec.offset, map_uid
                    ),
                )),
            };
        }
    }

    /// Adjust the refcounts of existing messages.
    pub fn update_refcounts(
        &mut self,
        map_uids: &[u32],
        delta: i32,
    ) -> Result<(), Error> {
        self.map.update_refcounts(map_uids, delta)
    }

    /// Drop every map record pointing into `file_id`, e.g. because the file
    /// has been lost.
    pub fn forget_file(&mut self, file_id: u32) -> Result<(), Error> {
        self.forget_cached_file(file_id);
        self.map.remove_file_id(file_id)?;
        info!(
            "{} Removed all references to {}",
            self.log_prefix,
            file_name(file_id)
        );
        Ok(())
    }

    pub fn status(&mut self) -> Result<StorageStatus, Error> {
        self.map.refresh()?;

        let mut status = StorageStatus {
            uid_validity: self.map.uid_validity()?,
            ..StorageStatus::default()
        };
        for seq in 0..self.map.view().entries.len() {
            let rec = self.map.view_lookup_rec(seq)?;
            let size = u64::from(rec.rec.size);

            status.messages += 1;
            status.total_bytes += size;
            if 0 == rec.refcount {
                status.dead_bytes += size;
            } else {
                status.live_messages += 1;
            }
            status.files.insert(rec.rec.file_id);
        }

        status.zero_ref_files = self.map.get_zero_ref_files()?;
        status.want_purge = self.map.want_purge();
        status.files_corrupted = self.files_corrupted();
        Ok(status)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::os::unix::fs::FileExt;

    use rayon::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::store::record_log::{LogTransaction, MapRecord};
    use crate::store::save::SaveRequest;

    fn config(root: &TempDir) -> StorageConfig {
        StorageConfig {
            path: root.path().join("storage"),
            rotate_size: 4096,
            rotate_min_size: 0,
            rotate_days: 0,
            ..StorageConfig::default()
        }
    }

    fn open(root: &TempDir, create: bool) -> Storage {
        crate::init_test_log();
        Storage::open(config(root), create, LogPrefix::new("storage-test".to_owned()))
            .unwrap()
    }

    fn save(storage: &mut Storage, bodies: &[&[u8]]) -> Vec<u32> {
        let mut ctx = storage.save_begin().unwrap();
        for body in bodies {
            ctx.save(&SaveRequest::default(), *body, body.len() as u64)
                .unwrap();
        }
        ctx.commit().unwrap().saved
    }

    #[test]
    fn open_without_create_fails_on_missing_storage() {
        let root = TempDir::new().unwrap();
        assert_matches!(
            Err(Error::StorageNotFound),
            Storage::open(config(&root), false, LogPrefix::new("x".to_owned()))
        );
    }

    #[test]
    fn unknown_message_is_not_found() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        save(&mut storage, &[b"hello"]);
        assert_matches!(Err(Error::NxMessage), storage.read_message(2));
        assert!(!storage.files_corrupted());
    }

    #[test]
    fn reads_follow_messages_moved_by_other_instances() {
        let root = TempDir::new().unwrap();
        let mut a = open(&root, true);
        let mut b = open(&root, false);

        let uids = save(&mut a, &[b"moved", b"dead"]);
        b.update_refcounts(&uids[1..], -1).unwrap();
        // Prime a's view while the message is still in file 1
        assert_eq!(1, a.map().lookup(uids[0]).unwrap().unwrap().0);
        a.forget_cached_file(1);

        b.purge().unwrap();
        assert!(!root.path().join("storage/m.1").exists());

        assert_eq!(b"moved".to_vec(), a.read_message(uids[0]).unwrap().body);
        assert!(!a.files_corrupted());
    }

    #[test]
    fn lost_file_is_corruption() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &[b"lost"]);

        let mut other = open(&root, false);
        fs::remove_file(root.path().join("storage/m.1")).unwrap();

        assert_matches!(
            Err(Error::MapCorrupted(..)),
            other.read_message(uids[0])
        );
        assert!(other.files_corrupted());

        other.forget_file(1).unwrap();
        assert_matches!(Err(Error::NxMessage), other.read_message(uids[0]));
    }

    #[test]
    fn broken_offset_is_corruption() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &[b"first", b"second"]);

        let rec = storage.map().lookup_rec(uids[1]).unwrap().unwrap();
        let mut tx = LogTransaction::new();
        tx.update_record(
            uids[1],
            MapRecord {
                offset: rec.offset + 1,
                ..rec
            },
        );
        storage.map().sync_begin().unwrap();
        storage.map().sync_commit(tx).unwrap();

        assert_matches!(
            Err(Error::FileCorrupted { .. }),
            storage.read_message(uids[1])
        );
        assert!(storage.files_corrupted());
        // Other messages in the file are still readable
        assert_eq!(b"first".to_vec(), storage.read_message(uids[0]).unwrap().body);
    }

    #[test]
    fn damaged_pre_header_is_corruption() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &[b"damaged"]);
        let (file_id, offset) = storage.map().lookup(uids[0]).unwrap().unwrap();

        let mut other = open(&root, false);
        let f = fs::OpenOptions::new()
            .write(true)
            .open(root.path().join("storage").join(file_name(file_id)))
            .unwrap();
        f.write_all_at(b"XX", u64::from(offset)).unwrap();

        assert_matches!(
            Err(Error::FileCorrupted { .. }),
            other.read_message(uids[0])
        );
    }

    #[test]
    fn status_reports_totals() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &[b"alive", b"dead"]);
        storage.update_refcounts(&uids[1..], -1).unwrap();

        let status = storage.status().unwrap();
        assert_ne!(0, status.uid_validity);
        assert_eq!(2, status.messages);
        assert_eq!(1, status.live_messages);
        assert!(status.dead_bytes > 4);
        assert!(status.total_bytes > status.dead_bytes);
        assert_eq!(vec![1], status.files.into_iter().collect::<Vec<_>>());
        assert_eq!(
            vec![1],
            status.zero_ref_files.into_iter().collect::<Vec<_>>()
        );
        assert!(!status.want_purge);
        assert!(!status.files_corrupted);
    }

    #[test]
    fn garbled_map_is_corruption() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        save(&mut storage, &[b"message"]);
        fs::write(root.path().join("storage/mdbox.map"), b"garbage garbage")
            .unwrap();

        assert_matches!(Err(Error::MapCorrupted(..)), storage.read_message(99));
        assert!(storage.files_corrupted());

        let other = Storage::open(
            config(&root),
            true,
            LogPrefix::new("storage-test-2".to_owned()),
        );
        assert_matches!(Err(Error::MapCorrupted(..)), other);
        assert_matches!(Err(Error::MapCorrupted(..)), storage.status());
    }

    #[test]
    fn fresh_storage_opens_without_create() {
        let root = TempDir::new().unwrap();
        drop(open(&root, true));

        let mut storage = open(&root, false);
        let status = storage.status().unwrap();
        assert_eq!(0, status.uid_validity);
        assert_eq!(0, status.messages);
        assert!(!status.files_corrupted);
    }

    #[test]
    fn concurrent_instances_never_share_bytes() {
        let root = TempDir::new().unwrap();
        drop(open(&root, true));

        let saved = (0..8u32)
            .into_par_iter()
            .map(|worker| {
                let mut storage = open(&root, false);
                let mut saved = Vec::new();
                for batch in 0..5u32 {
                    let bodies = (0..=batch % 3)
                        .map(|n| {
                            format!(
                                "worker {} batch {} message {} {}",
                                worker,
                                batch,
                                n,
                                "x".repeat((worker * 37 + batch * 11) as usize)
                            )
                        })
                        .collect::<Vec<_>>();

                    let mut ctx = storage.save_begin().unwrap();
                    for body in &bodies {
                        ctx.save(
                            &SaveRequest::default(),
                            body.as_bytes(),
                            body.len() as u64,
                        )
                        .unwrap();
                    }
                    let uids = ctx.commit().unwrap().saved;
                    assert_eq!(bodies.len(), uids.len());
                    saved.extend(uids.into_iter().zip(bodies));
                }
                saved
            })
            .reduce(Vec::new, |mut a, b| {
                a.extend(b);
                a
            });

        let mut storage = open(&root, false);
        let mut uids = saved.iter().map(|&(uid, _)| uid).collect::<Vec<_>>();
        uids.sort();
        uids.dedup();
        assert_eq!(saved.len(), uids.len());

        for (uid, body) in &saved {
            assert_eq!(
                body.as_bytes(),
                &storage.read_message(*uid).unwrap().body[..]
            );
        }

        let mut ranges = saved
            .iter()
            .map(|&(uid, _)| storage.map().lookup_rec(uid).unwrap().unwrap())
            .map(|r| (r.file_id, r.offset, r.offset + r.size))
            .collect::<Vec<_>>();
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].0 == pair[1].0 {
                assert!(pair[0].2 <= pair[1].1, "Overlap: {:?}", pair);
            }
        }
        assert!(!storage.files_corrupted());
    }
}
