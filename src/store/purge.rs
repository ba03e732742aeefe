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

//! Reclaiming the space of dead messages.
//!
//! A file is compacted by copying every message that is still referenced
//! into other files, moving the map records along with them, and then
//! deleting the file. The source file stays locked throughout, which also
//! keeps appenders away from it.

use log::{debug, error, info, warn};

use super::append::AppendContext;
use super::file::{file_name, LockOutcome, PhysicalFile};
use super::storage::Storage;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Someone else has the file locked.
    Busy,
    /// The file no longer exists.
    Gone,
    /// Nothing in the file was alive, so it was simply deleted.
    Deleted { expunged: usize },
    /// Live messages were moved elsewhere and the file deleted.
    Compacted { moved: usize, expunged: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub files_compacted: usize,
    pub files_deleted: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub messages_moved: usize,
    pub messages_expunged: usize,
}

impl Storage {
    /// Compact every file which contains dead messages.
    ///
    /// A failure in one file is logged and does not stop the others.
    pub fn purge(&mut self) -> Result<PurgeStats, Error> {
        let mut stats = PurgeStats::default();

        for file_id in self.map.get_zero_ref_files()? {
            match self.purge_file(file_id) {
                Ok(PurgeOutcome::Busy) | Ok(PurgeOutcome::Gone) => {
                    stats.files_skipped += 1;
                }
                Ok(PurgeOutcome::Deleted { expunged }) => {
                    stats.files_deleted += 1;
                    stats.messages_expunged += expunged;
                }
                Ok(PurgeOutcome::Compacted { moved, expunged }) => {
                    stats.files_compacted += 1;
                    stats.messages_moved += moved;
                    stats.messages_expunged += expunged;
                }
                Err(e) => {
                    error!(
                        "{} Failed to purge {}: {}",
                        self.log_prefix,
                        file_name(file_id),
                        e
                    );
                    stats.files_failed += 1;
                }
            }
        }

        info!(
            "{} Purge finished: {} compacted, {} deleted, {} skipped, \
             {} failed; {} messages moved, {} expunged",
            self.log_prefix,
            stats.files_compacted,
            stats.files_deleted,
            stats.files_skipped,
            stats.files_failed,
            stats.messages_moved,
            stats.messages_expunged
        );
        Ok(stats)
    }

    /// Compact the single file `file_id`.
    ///
    /// On error, neither the file nor the map have been changed.
    pub fn purge_file(&mut self, file_id: u32) -> Result<PurgeOutcome, Error> {
        let mut file = match self.open_file(file_id)? {
            Some(file) => file,
            None => return self.purge_missing_file(file_id),
        };

        match file.try_lock() {
            Ok(LockOutcome::Locked) => (),
            Ok(LockOutcome::Busy) => {
                debug!(
                    "{} {} is busy, not purging it now",
                    self.log_prefix,
                    file_name(file_id)
                );
                self.release_file(file);
                return Ok(PurgeOutcome::Busy);
            }
            Ok(LockOutcome::Gone) => return Ok(PurgeOutcome::Gone),
            Err(e) => {
                self.release_file(file);
                return Err(e);
            }
        }

        let result = self.compact_locked(&file);
        match result {
            Ok(PurgeOutcome::Deleted { .. })
            | Ok(PurgeOutcome::Compacted { .. }) => {
                self.forget_cached_file(file_id);
            }
            Ok(_) => self.release_file(file),
            Err(ref e) => {
                self.note_error(e);
                self.release_file(file);
            }
        }

        result
    }

    /// Handle a file which the map knows about but which doesn't exist.
    fn purge_missing_file(
        &mut self,
        file_id: u32,
    ) -> Result<PurgeOutcome, Error> {
        let messages = self.map.get_file_messages(file_id)?;
        if messages.is_empty() {
            // Already purged by someone else
            return Ok(PurgeOutcome::Gone);
        }

        if messages.iter().all(|m| 0 == m.refcount) {
            // Deleted by a purge which did not finish updating the map
            self.map.remove_file_id(file_id)?;
            return Ok(PurgeOutcome::Deleted {
                expunged: messages.len(),
            });
        }

        warn!(
            "{} File unexpectedly lost: {}",
            self.log_prefix,
            file_name(file_id)
        );
        Err(self.map.set_corrupted(format!(
            "{} is missing but still referenced",
            file_name(file_id)
        )))
    }

    fn compact_locked(
        &mut self,
        source: &PhysicalFile,
    ) -> Result<PurgeOutcome, Error> {
        let file_id = source.file_id();
        let log_prefix = self.log_prefix.clone();
        let messages = self.map.get_file_messages(file_id)?;

        let mut moved = Vec::new();
        let mut expunged = Vec::new();
        let mut ctx = AppendContext::begin(&mut *self)?;
        for message in &messages {
            if 0 == message.refcount {
                expunged.push(message.map_uid);
                continue;
            }

            let envelope = source
                .read_envelope(u64::from(message.offset))?
                .ok_or_else(|| Error::FileCorrupted {
                    path: source.path().to_owned(),
                    reason: format!(
                        "Broken offset {} for map_uid={}",
                        message.offset, message.map_uid
                    ),
                })?;

            let mut w = ctx.append_next(envelope.size)?;
            w.write_bytes(&envelope.pre_header)?;
            w.write_bytes(&envelope.body)?;
            w.write_bytes(&envelope.trailer)?;
            ctx.finish()?;

            moved.push(message.map_uid);
        }

        if moved.is_empty() {
            ctx.rollback();
            if !expunged.is_empty() {
                self.map.remove_file_id(file_id)?;
            }
            source.unlink(&log_prefix)?;

            info!(
                "{} Deleted {} with {} dead messages",
                log_prefix,
                file_name(file_id),
                expunged.len()
            );
            return Ok(PurgeOutcome::Deleted {
                expunged: expunged.len(),
            });
        }

        ctx.append_move(&moved, &expunged)?;
        ctx.commit()?;
        source.unlink(&log_prefix)?;

        info!(
            "{} Compacted {}: {} messages moved, {} expunged",
            log_prefix,
            file_name(file_id),
            moved.len(),
            expunged.len()
        );
        Ok(PurgeOutcome::Compacted {
            moved: moved.len(),
            expunged: expunged.len(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::os::unix::fs::FileExt;

    use tempfile::TempDir;

    use super::*;
    use crate::store::file::pre_header;
    use crate::store::metadata::{self, MailFlags, Metadata};
    use crate::store::save::SaveRequest;
    use crate::support::log_prefix::LogPrefix;
    use crate::support::system_config::StorageConfig;

    fn config(root: &TempDir) -> StorageConfig {
        StorageConfig {
            path: root.path().join("storage"),
            rotate_size: 1 << 20,
            rotate_min_size: 0,
            rotate_days: 0,
            ..StorageConfig::default()
        }
    }

    fn open(root: &TempDir, create: bool) -> Storage {
        crate::init_test_log();
        Storage::open(config(root), create, LogPrefix::new("purge-test".to_owned()))
            .unwrap()
    }

    fn save(storage: &mut Storage, bodies: &[&str]) -> Vec<u32> {
        let mut ctx = storage.save_begin().unwrap();
        for (ix, body) in bodies.iter().enumerate() {
            let request = SaveRequest {
                flags: if 0 == ix % 2 {
                    MailFlags::SEEN
                } else {
                    MailFlags::empty()
                },
                keywords: vec![format!("kw{}", ix)],
                ..SaveRequest::default()
            };
            ctx.save(&request, body.as_bytes(), body.len() as u64)
                .unwrap();
        }
        ctx.commit().unwrap().saved
    }

    fn file_exists(root: &TempDir, file_id: u32) -> bool {
        root.path().join("storage").join(file_name(file_id)).exists()
    }

    #[test]
    fn live_messages_survive_compaction() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &["alpha", "beta", "gamma", "delta"]);
        storage.update_refcounts(&[uids[1]], -1).unwrap();
        storage.update_refcounts(&[uids[3]], 1).unwrap();

        let before = uids
            .iter()
            .map(|&uid| storage.read_message(uid).unwrap())
            .collect::<Vec<_>>();

        let stats = storage.purge().unwrap();
        assert_eq!(
            PurgeStats {
                files_compacted: 1,
                messages_moved: 3,
                messages_expunged: 1,
                ..PurgeStats::default()
            },
            stats
        );
        assert!(!file_exists(&root, 1));
        assert!(file_exists(&root, 2));

        for (ix, &uid) in uids.iter().enumerate() {
            if 1 == ix {
                assert_matches!(Err(Error::NxMessage), storage.read_message(uid));
                continue;
            }

            // Byte-for-byte identical, including the metadata
            assert_eq!(before[ix], storage.read_message(uid).unwrap());
            assert_eq!(2, storage.map().lookup(uid).unwrap().unwrap().0);
        }

        let view = storage.map().view();
        assert_eq!(Some(1), view.get(uids[0]).unwrap().refcount);
        assert_eq!(Some(2), view.get(uids[3]).unwrap().refcount);
        assert!(storage.map().get_zero_ref_files().unwrap().is_empty());
    }

    #[test]
    fn compaction_copies_trailers_verbatim() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let dead = save(&mut storage, &["dead"]);

        let mut trailer = Vec::new();
        metadata::write_trailer(
            &mut trailer,
            &Metadata::default().encode_lines(),
        )
        .unwrap();
        let padding = trailer
            .iter()
            .rev()
            .skip(1)
            .take_while(|&&b| b' ' == b)
            .count();
        trailer.truncate(trailer.len() - padding - 1);
        trailer.extend_from_slice(b" odd padding\n");

        let body = b"live";
        let mut expected = pre_header(body.len() as u64).to_vec();
        expected.extend_from_slice(body);
        expected.extend_from_slice(&trailer);

        let mut ctx = storage.append_begin().unwrap();
        let mut w = ctx.append_next(expected.len() as u64).unwrap();
        w.write_bytes(&expected).unwrap();
        ctx.finish().unwrap();
        let (live, _) = ctx.commit().unwrap().unwrap();
        assert_eq!(1, storage.map().lookup(live).unwrap().unwrap().0);

        storage.update_refcounts(&dead, -1).unwrap();
        assert_eq!(
            PurgeOutcome::Compacted {
                moved: 1,
                expunged: 1
            },
            storage.purge_file(1).unwrap()
        );

        let (file_id, offset) = storage.map().lookup(live).unwrap().unwrap();
        assert_eq!(2, file_id);
        let file =
            fs::File::open(root.path().join("storage").join(file_name(2)))
                .unwrap();
        let mut actual = vec![0u8; expected.len()];
        file.read_exact_at(&mut actual, u64::from(offset)).unwrap();
        assert_eq!(expected, actual);
        assert_eq!(body.to_vec(), storage.read_message(live).unwrap().body);
    }

    #[test]
    fn dead_file_is_deleted_outright() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &["one", "two"]);
        storage.update_refcounts(&uids, -1).unwrap();

        assert_eq!(
            PurgeOutcome::Deleted { expunged: 2 },
            storage.purge_file(1).unwrap()
        );
        assert!(!file_exists(&root, 1));
        assert!(!file_exists(&root, 2));
        assert!(storage.map().view().entries.is_empty());
        assert!(!storage.files_corrupted());
    }

    #[test]
    fn busy_file_is_skipped() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &["one", "two"]);
        storage.update_refcounts(&uids[..1], -1).unwrap();

        let mut other = open(&root, false);
        let mut ctx = other.append_begin().unwrap();
        let mut w = ctx.append_next(10).unwrap();
        w.write_bytes(b"holds the lock").unwrap();

        assert_eq!(PurgeOutcome::Busy, storage.purge_file(1).unwrap());
        assert!(file_exists(&root, 1));
        assert_eq!(2, storage.map().view().entries.len());

        ctx.rollback();
        assert_matches!(
            Ok(PurgeOutcome::Compacted {
                moved: 1,
                expunged: 1
            }),
            storage.purge_file(1)
        );
    }

    #[test]
    fn missing_dead_file_is_forgotten() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        let uids = save(&mut storage, &["one"]);
        storage.update_refcounts(&uids, -1).unwrap();

        let mut other = open(&root, false);
        fs::remove_file(root.path().join("storage/m.1")).unwrap();
        assert_eq!(
            PurgeOutcome::Deleted { expunged: 1 },
            other.purge_file(1).unwrap()
        );
        assert!(other.map().view().entries.is_empty());
        assert_eq!(PurgeOutcome::Gone, other.purge_file(1).unwrap());
    }

    #[test]
    fn missing_live_file_is_corruption() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);
        save(&mut storage, &["one"]);

        let mut other = open(&root, false);
        fs::remove_file(root.path().join("storage/m.1")).unwrap();
        assert_matches!(Err(Error::MapCorrupted(..)), other.purge_file(1));
        assert!(other.files_corrupted());
    }

    #[test]
    fn corrupt_file_does_not_block_others() {
        let root = TempDir::new().unwrap();
        let mut storage = open(&root, true);

        let a = save(&mut storage, &["broken", "dead"]);
        // Put the next batch in a separate file
        let mut holder = PhysicalFile::open(&root.path().join("storage"), None, 1)
            .unwrap()
            .unwrap();
        assert_eq!(LockOutcome::Locked, holder.try_lock().unwrap());
        let b = save(&mut storage, &["fine", "dead too"]);
        holder.unlock();

        assert_eq!(2, storage.map().lookup(b[0]).unwrap().unwrap().0);
        storage.update_refcounts(&[a[1], b[1]], -1).unwrap();

        let (_, offset) = storage.map().lookup(a[0]).unwrap().unwrap();
        let f = fs::OpenOptions::new()
            .write(true)
            .open(root.path().join("storage/m.1"))
            .unwrap();
        f.write_all_at(b"??", u64::from(offset)).unwrap();

        let mut storage = open(&root, false);
        let stats = storage.purge().unwrap();
        assert_eq!(1, stats.files_failed);
        assert_eq!(1, stats.files_compacted);
        assert!(storage.files_corrupted());

        // The broken file and its map records are untouched
        assert!(file_exists(&root, 1));
        assert_eq!(Some((1, offset)), storage.map().lookup(a[0]).unwrap());
        assert_eq!(Some(0), storage.map().view().get(a[1]).unwrap().refcount);

        assert!(!file_exists(&root, 2));
        assert_eq!(
            b"fine".to_vec(),
            storage.read_message(b[0]).unwrap().body
        );
        assert_eq!(None, storage.map().lookup(b[1]).unwrap());
    }

    #[test]
    fn nothing_to_purge_at_100_percent() {
        let root = TempDir::new().unwrap();
        let mut storage = Storage::open(
            StorageConfig {
                purge_min_percentage: 100,
                ..config(&root)
            },
            true,
            LogPrefix::new("purge-test".to_owned()),
        )
        .unwrap();
        let uids = save(&mut storage, &["one"]);
        storage.update_refcounts(&uids, -1).unwrap();

        assert_eq!(PurgeStats::default(), storage.purge().unwrap());
        assert!(file_exists(&root, 1));
    }
}
