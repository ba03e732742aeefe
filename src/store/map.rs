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

//! The map index.
//!
//! Every message instance in the storage has a map UID. The map records, for
//! each map UID, where the message physically lives (file id, offset, size)
//! and how many mailbox entries refer to it.
//!
//! A refcount of 0 means the message is dead but its bytes have not been
//! reclaimed yet; the compactor takes care of that. Map UIDs are only
//! expunged once the bytes are gone.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;

use super::record_log::{
    FileRecordLog, LogTransaction, LogView, MapRecord, RecordLog,
};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::StorageConfig;

/// Refcounts are 16 bits. Updates which would bring a refcount to this value
/// are rejected, leaving headroom for other processes whose increments are
/// merged at commit time.
pub const REFCOUNT_LIMIT: i32 = 32768;

/// A fully-resolved record from the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupRec {
    pub map_uid: u32,
    pub rec: MapRecord,
    pub refcount: u16,
}

/// A message found in a particular file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileMessage {
    pub map_uid: u32,
    pub offset: u32,
    pub refcount: u16,
}

pub struct Map {
    log: Box<dyn RecordLog + Send>,
    config: StorageConfig,
    log_prefix: LogPrefix,
    files_corrupted: Arc<AtomicBool>,
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Map")
            .field("path", &self.config.path)
            .field("view", self.view())
            .finish()
    }
}

impl Map {
    /// Open the map for the storage described by `config`.
    ///
    /// If `create` is true and the storage directory or map do not exist,
    /// they are created.
    pub fn open(
        config: &StorageConfig,
        create: bool,
        log_prefix: LogPrefix,
        files_corrupted: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        if create {
            fs::create_dir_all(&config.path)?;
        } else if !config.path.is_dir() {
            return Err(Error::StorageNotFound);
        }

        let log =
            match FileRecordLog::open(&config.path, create, config.lock_timeout())
            {
                Ok(log) => log,
                Err(Error::MapCorrupted(reason)) => {
                    error!(
                        "{} Map index corrupted: {} (in {})",
                        log_prefix,
                        reason,
                        config.path.display()
                    );
                    files_corrupted.store(true, Ordering::Relaxed);
                    return Err(Error::MapCorrupted(reason));
                }
                Err(e) => return Err(e),
            };
        Ok(Self::with_log(
            Box::new(log),
            config.clone(),
            log_prefix,
            files_corrupted,
        ))
    }

    pub fn with_log(
        log: Box<dyn RecordLog + Send>,
        config: StorageConfig,
        log_prefix: LogPrefix,
        files_corrupted: Arc<AtomicBool>,
    ) -> Self {
        Map {
            log,
            config,
            log_prefix,
            files_corrupted,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn view(&self) -> &LogView {
        self.log.view()
    }

    #[cfg(test)]
    pub(super) fn log_mut(&mut self) -> &mut dyn RecordLog {
        &mut *self.log
    }

    pub fn refresh(&mut self) -> Result<(), Error> {
        self.log.refresh().map_err(|e| self.flag_error(e))
    }

    /// Enter the exclusive sync mode of the record log, bringing the view up
    /// to the head.
    pub(super) fn sync_begin(&mut self) -> Result<(), Error> {
        self.log.sync_begin().map_err(|e| self.flag_error(e))
    }

    pub(super) fn sync_commit(
        &mut self,
        tx: LogTransaction,
    ) -> Result<Option<(u32, u32)>, Error> {
        self.log.sync_commit(tx).map_err(|e| self.flag_error(e))
    }

    pub(super) fn sync_rollback(&mut self) {
        self.log.sync_rollback();
    }

    pub(super) fn is_syncing(&self) -> bool {
        self.log.is_syncing()
    }

    /// Route corruption reported by the record log through
    /// `set_corrupted()`.
    fn flag_error(&self, e: Error) -> Error {
        match e {
            Error::MapCorrupted(reason) => self.set_corrupted(reason),
            e => e,
        }
    }

    /// Log that the map is inconsistent, flag the storage as having
    /// corrupted files, and return the error to report to the caller.
    pub fn set_corrupted(&self, reason: String) -> Error {
        error!(
            "{} Map index corrupted: {} (in {})",
            self.log_prefix,
            reason,
            self.config.path.display()
        );
        self.files_corrupted.store(true, Ordering::Relaxed);
        Error::MapCorrupted(reason)
    }

    pub(super) fn lookup_seq(&self, seq: usize) -> Result<MapRecord, Error> {
        let entry = &self.view().entries[seq];
        match entry.rec {
            Some(rec) if 0 != rec.file_id => Ok(rec),
            _ => Err(self
                .set_corrupted(format!("file_id=0 for map_uid={}", entry.uid))),
        }
    }

    fn get_seq(&mut self, map_uid: u32) -> Result<Option<usize>, Error> {
        if let Some(seq) = self.view().seq_of(map_uid) {
            return Ok(Some(seq));
        }

        // Not found; it may have been added since we last looked
        self.refresh()?;
        Ok(self.view().seq_of(map_uid))
    }

    /// Resolve `map_uid` to the file id and offset of its envelope.
    pub fn lookup(&mut self, map_uid: u32) -> Result<Option<(u32, u32)>, Error> {
        Ok(self
            .lookup_rec(map_uid)?
            .map(|rec| (rec.file_id, rec.offset)))
    }

    /// Like `lookup()`, but also returns the size.
    pub fn lookup_rec(
        &mut self,
        map_uid: u32,
    ) -> Result<Option<MapRecord>, Error> {
        match self.get_seq(map_uid)? {
            None => Ok(None),
            Some(seq) => self.lookup_seq(seq).map(Some),
        }
    }

    /// Read the full record at 0-based sequence number `seq` of the current
    /// view.
    pub fn view_lookup_rec(&self, seq: usize) -> Result<LookupRec, Error> {
        let entry = &self.view().entries[seq];
        let rec = entry.rec.ok_or_else(|| {
            self.set_corrupted(format!(
                "missing map extension for map_uid={}",
                entry.uid
            ))
        })?;
        let refcount = entry.refcount.ok_or_else(|| {
            self.set_corrupted(format!(
                "missing ref extension for map_uid={}",
                entry.uid
            ))
        })?;

        Ok(LookupRec {
            map_uid: entry.uid,
            rec,
            refcount,
        })
    }

    /// List every message the map places in `file_id`.
    pub fn get_file_messages(
        &mut self,
        file_id: u32,
    ) -> Result<Vec<FileMessage>, Error> {
        self.refresh()?;

        let mut messages = Vec::new();
        for seq in 0..self.view().entries.len() {
            let rec = self.view_lookup_rec(seq)?;
            if rec.rec.file_id == file_id {
                messages.push(FileMessage {
                    map_uid: rec.map_uid,
                    offset: rec.rec.offset,
                    refcount: rec.refcount,
                });
            }
        }

        Ok(messages)
    }

    /// Find the files which contain at least one dead message and which
    /// meet the configured purge percentage.
    pub fn get_zero_ref_files(&mut self) -> Result<BTreeSet<u32>, Error> {
        let mut files = BTreeSet::new();
        if self.config.purge_min_percentage >= 100 {
            return Ok(files);
        }

        self.refresh()?;

        for entry in &self.view().entries {
            if entry.refcount.map_or(false, |r| 0 != r) {
                continue;
            }

            if let Some(rec) = entry.rec {
                files.insert(rec.file_id);
            }
        }

        if self.config.purge_min_percentage > 0 && !files.is_empty() {
            self.filter_zero_refs(&mut files);
        }

        Ok(files)
    }

    fn filter_zero_refs(&self, files: &mut BTreeSet<u32>) {
        #[derive(Default)]
        struct FileSize {
            file_size: u64,
            ref0_size: u64,
        }

        let mut sizes = HashMap::<u32, FileSize>::new();
        for entry in &self.view().entries {
            let (rec, refcount) = match (entry.rec, entry.refcount) {
                (Some(rec), Some(refcount)) => (rec, refcount),
                _ => continue,
            };

            if !files.contains(&rec.file_id) {
                continue;
            }

            let size = sizes.entry(rec.file_id).or_default();
            if 0 == refcount {
                size.ref0_size += u64::from(rec.size);
            }
            size.file_size = size
                .file_size
                .max(u64::from(rec.offset) + u64::from(rec.size));
        }

        let min_percentage = u64::from(self.config.purge_min_percentage);
        files.retain(|file_id| {
            sizes.get(file_id).map_or(false, |size| {
                0 != size.file_size
                    && size.ref0_size * 100 / size.file_size >= min_percentage
            })
        });
    }

    /// Whether enough of the storage is dead that a purge is worthwhile.
    pub fn want_purge(&self) -> bool {
        if self.config.purge_min_percentage >= 100 {
            return false;
        }

        let mut ref0_size = 0u64;
        let mut total_size = 0u64;
        for entry in &self.view().entries {
            if let (Some(rec), Some(refcount)) = (entry.rec, entry.refcount) {
                if 0 == refcount {
                    ref0_size += u64::from(rec.size);
                }
                total_size += u64::from(rec.size);
            }
        }

        if 0 == total_size || ref0_size < self.config.force_purge_min_bytes {
            return false;
        }

        ref0_size as f64 / total_size as f64 >= self.config.force_purge_min_ratio
    }

    /// Adjust the refcount of every message in `map_uids` by `delta` in a
    /// transaction of its own.
    ///
    /// The update is checked against the latest state of the map, so this
    /// fails exactly when the result would leave the valid range.
    pub fn update_refcounts(
        &mut self,
        map_uids: &[u32],
        delta: i32,
    ) -> Result<(), Error> {
        self.sync_begin()?;

        let mut tx = MapTransaction::default();
        let mut log_tx = LogTransaction::new();
        match tx.update_refcounts(self, map_uids, delta) {
            Ok(()) => tx.stage_into(&mut log_tx),
            Err(e) => {
                self.sync_rollback();
                return Err(e);
            }
        }

        self.sync_commit(log_tx)?;
        Ok(())
    }

    /// Expunge every record which points into `file_id`.
    ///
    /// This is used when the file has been deleted, or found to be lost, so
    /// that its messages no longer resolve to anything.
    pub fn remove_file_id(&mut self, file_id: u32) -> Result<(), Error> {
        // The expunges must be computed against the head of the log,
        // otherwise we could expunge messages that were just moved
        // elsewhere.
        self.sync_begin()?;

        let staged = (|| {
            let mut log_tx = LogTransaction::new();
            for entry in &self.view().entries {
                match entry.rec {
                    None => {
                        return Err(self.set_corrupted(format!(
                            "missing map extension for map_uid={}",
                            entry.uid
                        )))
                    }
                    Some(rec) if rec.file_id == file_id => {
                        log_tx.expunge(entry.uid)
                    }
                    Some(_) => (),
                }
            }
            Ok(log_tx)
        })();

        match staged {
            Ok(log_tx) => {
                self.sync_commit(log_tx)?;
                Ok(())
            }
            Err(e) => {
                self.sync_rollback();
                Err(e)
            }
        }
    }

    /// The UID validity of the map, or 0 if nothing was ever stored.
    pub fn uid_validity(&mut self) -> Result<u32, Error> {
        if 0 == self.view().uid_validity {
            // It may have just been set by another process
            self.refresh()?;
        }
        Ok(self.view().uid_validity)
    }
}

/// Pending refcount changes.
///
/// Changes are checked against the map when they are added so that callers
/// find out about problems early, and checked again under the map lock when
/// they are committed.
#[derive(Clone, Debug, Default)]
pub struct MapTransaction {
    /// Net change per map UID.
    pending: HashMap<u32, i32>,
    /// Map UIDs in the order they were first touched.
    order: Vec<u32>,
}

impl MapTransaction {
    pub fn is_empty(&self) -> bool {
        self.pending.values().all(|&d| 0 == d)
    }

    /// Adjust the refcount of every message in `map_uids` by `delta`.
    ///
    /// A map UID appearing multiple times is adjusted multiple times. If any
    /// resulting refcount would be out of range, the whole call fails and
    /// this transaction is left unchanged.
    pub fn update_refcounts(
        &mut self,
        map: &Map,
        map_uids: &[u32],
        delta: i32,
    ) -> Result<(), Error> {
        let mut tentative = HashMap::<u32, i32>::new();
        for &uid in map_uids {
            let pending = tentative
                .entry(uid)
                .or_insert_with(|| self.pending.get(&uid).copied().unwrap_or(0));
            *pending += delta;
            check_refcount(map, uid, *pending)?;
        }

        for &uid in map_uids {
            if !self.pending.contains_key(&uid) {
                self.order.push(uid);
            }
            if let Some(&pending) = tentative.get(&uid) {
                self.pending.insert(uid, pending);
            }
        }

        Ok(())
    }

    /// Check every pending change against the current view of `map`.
    pub fn revalidate(&self, map: &Map) -> Result<(), Error> {
        for uid in &self.order {
            check_refcount(map, *uid, self.pending[uid])?;
        }
        Ok(())
    }

    /// Add the pending changes to a log transaction.
    pub fn stage_into(&self, tx: &mut LogTransaction) {
        for uid in &self.order {
            let delta = self.pending[uid];
            if 0 != delta {
                tx.atomic_inc_ref(*uid, delta);
            }
        }
    }
}

fn check_refcount(map: &Map, map_uid: u32, pending: i32) -> Result<(), Error> {
    let entry = map.view().get(map_uid).ok_or_else(|| {
        map.set_corrupted(format!(
            "refcount update lost map_uid={}",
            map_uid
        ))
    })?;

    let result = i32::from(entry.refcount.unwrap_or(0)) + pending;
    if result < 0 {
        Err(map.set_corrupted(format!(
            "refcount of map_uid={} would become {}",
            map_uid, result
        )))
    } else if result >= REFCOUNT_LIMIT {
        Err(Error::TooManyCopies)
    } else {
        Ok(())
    }
}
