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

//! The record log underneath the map index.
//!
//! The map only needs a small contract from its log: a view of records keyed
//! by monotonically increasing UIDs, each carrying an optional location
//! extension and an optional 16-bit refcount extension; a header with the UID
//! validity and the highest file id; transactions applied atomically; and an
//! exclusive "sync" mode which serialises writers across processes.
//!
//! `FileRecordLog` implements this contract by keeping the whole log as one
//! CBOR document which is atomically replaced on every commit. The document is
//! small (a few dozen bytes per message), and commits are serialised by an
//! exclusive `flock()` on a sibling lock file, so this is adequate for the
//! message counts a single storage directory sees.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// The location extension of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRecord {
    pub file_id: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub uid: u32,
    pub rec: Option<MapRecord>,
    pub refcount: Option<u16>,
}

/// A consistent snapshot of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogView {
    /// 0 until the first record is appended.
    pub uid_validity: u32,
    pub next_uid: u32,
    /// The header extension recording the highest file id ever assigned.
    pub highest_file_id: Option<u32>,
    /// Sorted by UID ascending.
    pub entries: Vec<LogEntry>,
}

impl Default for LogView {
    fn default() -> Self {
        LogView {
            uid_validity: 0,
            next_uid: 1,
            highest_file_id: None,
            entries: Vec::new(),
        }
    }
}

impl LogView {
    /// Find the sequence number (0-based index) of `uid`, if present.
    pub fn seq_of(&self, uid: u32) -> Option<usize> {
        self.entries.binary_search_by_key(&uid, |e| e.uid).ok()
    }

    pub fn get(&self, uid: u32) -> Option<&LogEntry> {
        self.seq_of(uid).map(|seq| &self.entries[seq])
    }

    fn get_mut(&mut self, uid: u32) -> Option<&mut LogEntry> {
        match self.seq_of(uid) {
            Some(seq) => Some(&mut self.entries[seq]),
            None => None,
        }
    }

    fn apply(&mut self, tx: LogTransaction) -> Result<Option<(u32, u32)>, Error> {
        let mut appended: Option<(u32, u32)> = None;

        for op in tx.ops {
            match op {
                LogOp::Append { rec, refcount } => {
                    let uid = self.next_uid;
                    self.next_uid = self
                        .next_uid
                        .checked_add(1)
                        .ok_or_else(|| {
                            Error::MapCorrupted("UID space exhausted".to_owned())
                        })?;
                    self.entries.push(LogEntry {
                        uid,
                        rec: Some(rec),
                        refcount: Some(refcount),
                    });
                    appended = Some(match appended {
                        None => (uid, uid),
                        Some((first, _)) => (first, uid),
                    });
                }

                LogOp::UpdateRecord { uid, rec } => {
                    self.get_mut(uid)
                        .ok_or_else(|| vanished(uid))?
                        .rec = Some(rec);
                }

                LogOp::AtomicIncRef { uid, delta } => {
                    let entry = self.get_mut(uid).ok_or_else(|| vanished(uid))?;
                    let current = i32::from(entry.refcount.unwrap_or(0));
                    let new = (current + delta).max(0).min(i32::from(u16::MAX));
                    entry.refcount = Some(new as u16);
                }

                LogOp::Expunge { uid } => {
                    if let Some(seq) = self.seq_of(uid) {
                        self.entries.remove(seq);
                    }
                }

                LogOp::SetHighestFileId(file_id) => {
                    self.highest_file_id =
                        Some(self.highest_file_id.unwrap_or(0).max(file_id));
                }

                LogOp::SetUidValidity(uid_validity) => {
                    if 0 == self.uid_validity {
                        self.uid_validity = uid_validity;
                    }
                }
            }
        }

        Ok(appended)
    }
}

fn vanished(uid: u32) -> Error {
    Error::MapCorrupted(format!("UID {} vanished during transaction", uid))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum LogOp {
    Append { rec: MapRecord, refcount: u16 },
    UpdateRecord { uid: u32, rec: MapRecord },
    AtomicIncRef { uid: u32, delta: i32 },
    Expunge { uid: u32 },
    SetHighestFileId(u32),
    SetUidValidity(u32),
}

/// A set of changes to be applied to the log atomically.
///
/// Operations are applied in the order they were added. Refcount increments
/// are applied against whatever the refcount is at commit time, so concurrent
/// increments from different processes both take effect.
#[derive(Clone, Debug, Default)]
pub struct LogTransaction {
    ops: Vec<LogOp>,
    appends: usize,
}

impl LogTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new record. Returns the index of this append among all
    /// appends in the transaction; the committed UIDs are assigned
    /// contiguously in this order.
    pub fn append(&mut self, rec: MapRecord, refcount: u16) -> usize {
        self.ops.push(LogOp::Append { rec, refcount });
        self.appends += 1;
        self.appends - 1
    }

    pub fn update_record(&mut self, uid: u32, rec: MapRecord) {
        self.ops.push(LogOp::UpdateRecord { uid, rec });
    }

    pub fn atomic_inc_ref(&mut self, uid: u32, delta: i32) {
        self.ops.push(LogOp::AtomicIncRef { uid, delta });
    }

    pub fn expunge(&mut self, uid: u32) {
        self.ops.push(LogOp::Expunge { uid });
    }

    pub fn set_highest_file_id(&mut self, file_id: u32) {
        self.ops.push(LogOp::SetHighestFileId(file_id));
    }

    pub fn set_uid_validity(&mut self, uid_validity: u32) {
        self.ops.push(LogOp::SetUidValidity(uid_validity));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The interface the map index requires from its record log.
pub trait RecordLog {
    /// The view as of the last refresh or commit.
    fn view(&self) -> &LogView;

    /// Bring the view up to date with the latest committed state.
    fn refresh(&mut self) -> Result<(), Error>;

    /// Enter exclusive sync mode, waiting a bounded time for other writers to
    /// finish, then refresh the view to the head.
    fn sync_begin(&mut self) -> Result<(), Error>;

    fn is_syncing(&self) -> bool;

    /// Apply `tx` atomically and leave sync mode.
    ///
    /// Returns the UID range assigned to appended records, if any.
    fn sync_commit(
        &mut self,
        tx: LogTransaction,
    ) -> Result<Option<(u32, u32)>, Error>;

    /// Leave sync mode without changing anything.
    fn sync_rollback(&mut self);

    /// Apply `tx` in a sync of its own.
    fn commit(
        &mut self,
        tx: LogTransaction,
    ) -> Result<Option<(u32, u32)>, Error> {
        self.sync_begin()?;
        self.sync_commit(tx)
    }
}

pub const MAP_FILE: &str = "mdbox.map";
pub const LOCK_FILE: &str = "mdbox.map.lock";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

// Inode numbers alone get reused once the replaced document is unlinked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    dev: u64,
    ino: u64,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
}

/// A record log stored as a single CBOR document.
#[derive(Debug)]
pub struct FileRecordLog {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    view: LogView,
    /// Identity of the document `view` was loaded from.
    loaded: Option<FileStamp>,
    sync_lock: Option<fs::File>,
}

impl FileRecordLog {
    /// Open the log in `dir`.
    ///
    /// If the log does not exist yet, an empty one is created when `create`
    /// is true; otherwise `StorageNotFound` is returned.
    pub fn open(
        dir: &Path,
        create: bool,
        lock_timeout: Duration,
    ) -> Result<Self, Error> {
        let path = dir.join(MAP_FILE);
        if !path.is_file() {
            if !create {
                return Err(Error::StorageNotFound);
            }

            // Another process may win the race to create it
            let data = serde_cbor::to_vec(&LogView::default())?;
            file_ops::spit(dir, &path, false, 0o600, &data)
                .ignore_already_exists()?;
        }

        let mut this = FileRecordLog {
            dir: dir.to_owned(),
            lock_path: dir.join(LOCK_FILE),
            path,
            lock_timeout,
            view: LogView::default(),
            loaded: None,
            sync_lock: None,
        };
        this.refresh()?;
        Ok(this)
    }

    fn stat(&self) -> Result<Option<FileStamp>, Error> {
        match fs::metadata(&self.path) {
            Ok(md) => Ok(Some(FileStamp {
                dev: md.dev(),
                ino: md.ino(),
                size: md.size(),
                mtime: md.mtime(),
                mtime_nsec: md.mtime_nsec(),
            })),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn try_lock_once(&self) -> Result<Option<fs::File>, Error> {
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        if file_ops::try_lock_exclusive(&file)? {
            Ok(Some(file))
        } else {
            Ok(None)
        }
    }
}

impl RecordLog for FileRecordLog {
    fn view(&self) -> &LogView {
        &self.view
    }

    fn refresh(&mut self) -> Result<(), Error> {
        let current = self.stat()?;
        if current.is_none() || current == self.loaded {
            return Ok(());
        }

        let data = match fs::read(&self.path) {
            Ok(data) => data,
            // Replaced between stat and open; the next refresh will see it
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };

        let view: LogView = serde_cbor::from_slice(&data).map_err(|e| {
            Error::MapCorrupted(format!(
                "{}: undecodable: {}",
                self.path.display(),
                e
            ))
        })?;

        if view.entries.windows(2).any(|w| w[0].uid >= w[1].uid)
            || view.entries.last().map_or(false, |e| e.uid >= view.next_uid)
        {
            return Err(Error::MapCorrupted(format!(
                "{}: UIDs out of order",
                self.path.display()
            )));
        }

        self.view = view;
        self.loaded = current;
        Ok(())
    }

    fn sync_begin(&mut self) -> Result<(), Error> {
        if self.sync_lock.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let lock = loop {
            if let Some(lock) = self.try_lock_once()? {
                break lock;
            }

            if start.elapsed() >= self.lock_timeout {
                return Err(Error::LockTimeout);
            }

            thread::sleep(LOCK_RETRY_INTERVAL);
        };

        self.sync_lock = Some(lock);
        // Writers must never build on a stale view, so reload unconditionally
        self.loaded = None;
        if let Err(e) = self.refresh() {
            self.sync_lock = None;
            return Err(e);
        }

        Ok(())
    }

    fn is_syncing(&self) -> bool {
        self.sync_lock.is_some()
    }

    fn sync_commit(
        &mut self,
        tx: LogTransaction,
    ) -> Result<Option<(u32, u32)>, Error> {
        if self.sync_lock.is_none() {
            return Err(Error::MapCorrupted(
                "commit attempted outside of sync".to_owned(),
            ));
        }

        if tx.is_empty() {
            self.sync_lock = None;
            return Ok(None);
        }

        let result = (|| -> Result<Option<(u32, u32)>, Error> {
            let mut view = self.view.clone();
            let appended = view.apply(tx)?;
            let data = serde_cbor::to_vec(&view)?;
            file_ops::spit(&self.dir, &self.path, true, 0o600, &data)?;
            // Committed as soon as the rename lands; nothing after this may
            // fail the commit
            if let Err(e) = file_ops::sync_dir(&self.dir) {
                warn!("{}: fsync failed: {}", self.dir.display(), e);
            }

            self.loaded = self.stat().ok().flatten();
            self.view = view;
            Ok(appended)
        })();

        self.sync_lock = None;
        if let Ok(Some((first, last))) = result {
            debug!(
                "{}: committed UIDs {}..={}",
                self.path.display(),
                first,
                last
            );
        }
        result
    }

    fn sync_rollback(&mut self) {
        self.sync_lock = None;
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn rec(file_id: u32, offset: u32) -> MapRecord {
        MapRecord {
            file_id,
            offset,
            size: 100,
        }
    }

    #[test]
    fn log_is_created_only_on_request() {
        let root = TempDir::new().unwrap();
        assert_matches!(
            Err(Error::StorageNotFound),
            FileRecordLog::open(root.path(), false, TIMEOUT)
        );

        let log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        assert_eq!(&LogView::default(), log.view());
        assert!(root.path().join(MAP_FILE).is_file());

        // A second instance finds the empty log without creating it
        let other = FileRecordLog::open(root.path(), false, TIMEOUT).unwrap();
        assert_eq!(&LogView::default(), other.view());

        // Creating again doesn't clobber what is there
        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        let mut log = log;
        log.commit(tx).unwrap();
        let again = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        assert_eq!(log.view(), again.view());
    }

    #[test]
    fn appends_are_durable_and_contiguous() {
        let root = TempDir::new().unwrap();
        let mut log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();

        let mut tx = LogTransaction::new();
        assert_eq!(0, tx.append(rec(1, 10), 1));
        assert_eq!(1, tx.append(rec(1, 110), 1));
        tx.set_highest_file_id(1);
        tx.set_uid_validity(42);
        assert_eq!(Some((1, 2)), log.commit(tx).unwrap());

        let reopened =
            FileRecordLog::open(root.path(), false, TIMEOUT).unwrap();
        assert_eq!(log.view(), reopened.view());
        assert_eq!(3, reopened.view().next_uid);
        assert_eq!(Some(1), reopened.view().highest_file_id);
        assert_eq!(42, reopened.view().uid_validity);
        assert_eq!(Some(rec(1, 110)), reopened.view().get(2).unwrap().rec);
    }

    #[test]
    fn expunged_uids_are_never_reused() {
        let root = TempDir::new().unwrap();
        let mut log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();

        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        tx.append(rec(1, 110), 1);
        log.commit(tx).unwrap();

        let mut tx = LogTransaction::new();
        tx.expunge(2);
        log.commit(tx).unwrap();

        let mut tx = LogTransaction::new();
        tx.append(rec(2, 10), 1);
        assert_eq!(Some((3, 3)), log.commit(tx).unwrap());
        assert_eq!(None, log.view().get(2));
        assert_eq!(
            vec![1, 3],
            log.view().entries.iter().map(|e| e.uid).collect::<Vec<_>>()
        );
    }

    #[test]
    fn concurrent_increments_merge() {
        let root = TempDir::new().unwrap();
        let mut a = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        a.commit(tx).unwrap();

        let mut b = FileRecordLog::open(root.path(), false, TIMEOUT).unwrap();

        // Both stage increments against the same stale view
        let mut tx_a = LogTransaction::new();
        tx_a.atomic_inc_ref(1, 2);
        let mut tx_b = LogTransaction::new();
        tx_b.atomic_inc_ref(1, 3);

        a.commit(tx_a).unwrap();
        b.commit(tx_b).unwrap();

        a.refresh().unwrap();
        assert_eq!(Some(6), a.view().get(1).unwrap().refcount);
    }

    #[test]
    fn refcount_never_goes_negative() {
        let root = TempDir::new().unwrap();
        let mut log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        tx.atomic_inc_ref(1, -5);
        log.commit(tx).unwrap();
        assert_eq!(Some(0), log.view().get(1).unwrap().refcount);
    }

    #[test]
    fn sync_excludes_other_writers() {
        let root = TempDir::new().unwrap();
        let mut a = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let mut b = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();

        a.sync_begin().unwrap();
        assert!(a.is_syncing());
        assert_matches!(Err(Error::LockTimeout), b.sync_begin());
        assert!(!b.is_syncing());

        a.sync_rollback();
        b.sync_begin().unwrap();
        b.sync_rollback();
    }

    #[test]
    fn rollback_changes_nothing() {
        let root = TempDir::new().unwrap();
        let mut log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let before = fs::read(root.path().join(MAP_FILE)).unwrap();
        log.sync_begin().unwrap();
        log.sync_rollback();
        assert_eq!(before, fs::read(root.path().join(MAP_FILE)).unwrap());
        assert_eq!(&LogView::default(), log.view());
    }

    #[test]
    fn refresh_sees_other_instances() {
        let root = TempDir::new().unwrap();
        let mut a = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let mut b = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();

        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        a.commit(tx).unwrap();

        assert!(b.view().get(1).is_none());
        b.refresh().unwrap();
        assert_eq!(Some(rec(1, 10)), b.view().get(1).unwrap().rec);
    }

    #[test]
    fn operations_on_vanished_uids_fail_atomically() {
        let root = TempDir::new().unwrap();
        let mut log = FileRecordLog::open(root.path(), true, TIMEOUT).unwrap();
        let mut tx = LogTransaction::new();
        tx.append(rec(1, 10), 1);
        log.commit(tx).unwrap();

        let mut tx = LogTransaction::new();
        tx.atomic_inc_ref(1, 1);
        tx.update_record(99, rec(2, 10));
        assert_matches!(Err(Error::MapCorrupted(..)), log.commit(tx));
        assert!(!log.is_syncing());
        assert_eq!(Some(1), log.view().get(1).unwrap().refcount);
    }
}
