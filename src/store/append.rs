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

//! Batched appends.
//!
//! An `AppendContext` collects a number of messages written into storage
//! files and then makes them visible all at once by committing one map
//! transaction. Until then, the written bytes live past the durable append
//! offset of their files (or in files that do not have a name yet) and are
//! invisible to everyone else.
//!
//! Every file the context writes into is exclusively locked for the lifetime
//! of the context. Files locked by someone else are skipped rather than
//! waited for.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};

use chrono::prelude::*;
use log::{debug, error, warn};

use super::file::{day_begin_stamp, LockOutcome, PhysicalFile};
use super::map::MapTransaction;
use super::record_log::{LogTransaction, MapRecord};
use super::storage::Storage;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// How many distinct files of recently appended messages are considered for
/// reuse before giving up and creating a new file.
const MAX_BACKWARDS_LOOKUPS: usize = 10;

#[derive(Debug)]
struct FileAppend {
    file: PhysicalFile,
    /// The append offset of the file before this context touched it.
    first_append_offset: u64,
    /// Whether the file was created by this context.
    created: bool,
}

#[derive(Clone, Copy, Debug)]
struct Append {
    /// Index into `AppendContext::files`.
    file_ix: usize,
    offset: u64,
    /// `None` until `finish()`.
    size: Option<u64>,
}

enum Candidate {
    Use(usize),
    Skip,
    /// The file is older than the rotation boundary, and so is everything
    /// before it.
    TooOld,
}

/// An in-progress batch of appends.
///
/// Dropping the context without committing rolls it back.
pub struct AppendContext<'s> {
    storage: &'s mut Storage,
    files: Vec<FileAppend>,
    appends: Vec<Append>,
    /// Files before this index in `files` are known to not accept more
    /// data.
    files_nonappendable_count: usize,
    refs: MapTransaction,
    /// The map transaction built by `assign_map_uids()` or `append_move()`.
    /// The record log is in sync mode while this is set.
    staged: Option<LogTransaction>,
    failed: bool,
    done: bool,
}

impl<'s> AppendContext<'s> {
    pub fn begin(storage: &'s mut Storage) -> Result<Self, Error> {
        storage.map.refresh()?;
        Ok(AppendContext {
            storage,
            files: Vec::new(),
            appends: Vec::new(),
            files_nonappendable_count: 0,
            refs: MapTransaction::default(),
            staged: None,
            failed: false,
            done: false,
        })
    }

    /// The number of messages appended so far.
    pub fn append_count(&self) -> usize {
        self.appends.len()
    }

    fn check_usable(&self) -> Result<(), Error> {
        if self.failed || self.done {
            Err(Error::BatchFailed)
        } else {
            Ok(())
        }
    }

    fn check_unstaged(&self) -> Result<(), Error> {
        self.check_usable()?;
        if self.staged.is_some() {
            Err(Error::BatchFailed)
        } else {
            Ok(())
        }
    }

    /// Start appending a new message of roughly `mail_size` bytes.
    ///
    /// The returned writer appends to the end of a file chosen for this
    /// message. When the message is complete, call `finish()`. If the
    /// previous message was never finished, it is finished implicitly.
    pub fn append_next(
        &mut self,
        mail_size: u64,
    ) -> Result<AppendWriter<'_>, Error> {
        self.check_unstaged()?;
        if self.appends.last().map_or(false, |a| a.size.is_none()) {
            self.finish()?;
        }

        let stamp = day_begin_stamp(self.storage.config.rotate_days);
        let file_ix = self.find_appendable_file(mail_size, stamp)?;

        let offset = self.files[file_ix].file.output_offset();
        self.appends.push(Append {
            file_ix,
            offset,
            size: None,
        });

        Ok(AppendWriter {
            file: &mut self.files[file_ix].file,
            start: offset,
        })
    }

    fn find_appendable_file(
        &mut self,
        mail_size: u64,
        stamp: i64,
    ) -> Result<usize, Error> {
        if mail_size < self.storage.config.rotate_size {
            let config = &self.storage.config;
            // Files already opened by this batch, newest first
            for ix in (self.files_nonappendable_count..self.files.len()).rev()
            {
                if self.files[ix].file.get_append_stream(mail_size, config, stamp)
                {
                    return Ok(ix);
                }
            }
            self.files_nonappendable_count = self.files.len();

            if let Some(ix) = self.find_existing_file(mail_size, stamp)? {
                return Ok(ix);
            }
        }

        let file = PhysicalFile::create(&self.storage.config.path)?;
        debug!(
            "{} Created new storage file {}",
            self.storage.log_prefix,
            file.path().display()
        );
        self.files.push(FileAppend {
            first_append_offset: file.output_offset(),
            file,
            created: true,
        });
        Ok(self.files.len() - 1)
    }

    /// Look for a file with room among the files holding the most recently
    /// appended messages.
    fn find_existing_file(
        &mut self,
        mail_size: u64,
        stamp: i64,
    ) -> Result<Option<usize>, Error> {
        self.storage.map.refresh()?;

        let mut checked = HashSet::<u32>::new();
        let mut lookups = 0;
        for seq in (0..self.storage.map.view().entries.len()).rev() {
            let rec = self.storage.map.lookup_seq(seq)?;
            if !checked.insert(rec.file_id) {
                continue;
            }

            lookups += 1;
            if lookups > MAX_BACKWARDS_LOOKUPS {
                break;
            }

            let config = &self.storage.config;
            let end = u64::from(rec.offset) + u64::from(rec.size);
            if end >= config.rotate_min_size
                && end + mail_size > config.rotate_size
            {
                continue;
            }

            if self.files.iter().any(|f| f.file.file_id() == rec.file_id) {
                continue;
            }

            match self.try_existing_file(rec.file_id, mail_size, stamp)? {
                Candidate::Use(ix) => return Ok(Some(ix)),
                Candidate::Skip => continue,
                Candidate::TooOld => break,
            }
        }

        Ok(None)
    }

    fn try_existing_file(
        &mut self,
        file_id: u32,
        mail_size: u64,
        stamp: i64,
    ) -> Result<Candidate, Error> {
        let mut file = match self.storage.open_file(file_id)? {
            Some(file) => file,
            None => return Ok(Candidate::Skip),
        };

        if file.header().create_time < stamp {
            self.storage.release_file(file);
            return Ok(Candidate::TooOld);
        }

        match file.try_lock() {
            Ok(LockOutcome::Locked) => (),
            Ok(LockOutcome::Busy) => {
                debug!(
                    "{} Storage file {} is busy, skipping",
                    self.storage.log_prefix, file_id
                );
                self.storage.release_file(file);
                return Ok(Candidate::Skip);
            }
            Ok(LockOutcome::Gone) => return Ok(Candidate::Skip),
            Err(e) => {
                self.storage.release_file(file);
                return Err(e);
            }
        }

        if file.get_append_stream(mail_size, &self.storage.config, stamp) {
            self.files.push(FileAppend {
                first_append_offset: file.output_offset(),
                file,
                created: false,
            });
            Ok(Candidate::Use(self.files.len() - 1))
        } else {
            self.storage.release_file(file);
            Ok(Candidate::Skip)
        }
    }

    /// Record the final size of the message most recently started by
    /// `append_next()`.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.check_unstaged()?;
        let append = self.appends.last_mut().ok_or(Error::BatchFailed)?;
        let end = self.files[append.file_ix].file.output_offset();
        let size = end - append.offset;
        if size > u64::from(u32::MAX) || end > u64::from(u32::MAX) {
            return Err(Error::MessageTooLarge);
        }

        append.size = Some(size);
        Ok(())
    }

    /// Discard the message most recently started by `append_next()`,
    /// leaving the rest of the batch intact.
    pub fn cancel_last(&mut self) -> Result<(), Error> {
        self.check_unstaged()?;
        let append = match self.appends.pop() {
            Some(append) => append,
            None => return Ok(()),
        };

        if let Err(e) =
            self.files[append.file_ix].file.cancel_append(append.offset)
        {
            self.failed = true;
            return Err(e);
        }

        // A file created just for this message isn't needed anymore
        let last_ix = self.files.len() - 1;
        if append.file_ix == last_ix
            && self.files[last_ix].created
            && !self.appends.iter().any(|a| a.file_ix == last_ix)
        {
            if let Some(fa) = self.files.pop() {
                fs::remove_file(fa.file.path()).ignore_not_found()?;
            }
            self.files_nonappendable_count =
                self.files_nonappendable_count.min(self.files.len());
        }

        Ok(())
    }

    /// Adjust the refcounts of existing messages by `delta` as part of this
    /// batch.
    ///
    /// The change is validated immediately; if it fails, nothing about the
    /// batch changes.
    pub fn update_refcounts(
        &mut self,
        map_uids: &[u32],
        delta: i32,
    ) -> Result<(), Error> {
        self.check_unstaged()?;
        self.refs.update_refcounts(&self.storage.map, map_uids, delta)
    }

    /// Flush every file and give permanent ids to the new ones.
    ///
    /// The record log must be in sync mode.
    fn assign_file_ids(&mut self, tx: &mut LogTransaction) -> Result<(), Error> {
        let first_id = self
            .storage
            .map
            .view()
            .highest_file_id
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| {
                self.storage
                    .map
                    .set_corrupted("file id space exhausted".to_owned())
            })?;

        let mut next_id = first_id;
        for fa in &mut self.files {
            fa.file.finish_append()?;
            if 0 != fa.file.file_id() {
                continue;
            }

            // A crash between naming a file and committing the map can
            // leave an unreferenced file occupying an id
            loop {
                match fa.file.assign_id(&self.storage.config.path, next_id) {
                    Ok(()) => break,
                    Err(Error::Io(e))
                        if io::ErrorKind::AlreadyExists == e.kind() =>
                    {
                        warn!(
                            "{} Stale storage file {} is in the way",
                            self.storage.log_prefix, next_id
                        );
                        next_id += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            next_id += 1;
        }

        if next_id != first_id {
            tx.set_highest_file_id(next_id - 1);
            file_ops::sync_dir(&self.storage.config.path)?;
        }

        Ok(())
    }

    /// Prepare the map records for everything appended in this batch.
    ///
    /// This enters the exclusive sync mode of the record log, which lasts
    /// until `commit()` or rollback. The returned range is the map UIDs the
    /// appended messages will get, in the order they were appended.
    pub fn assign_map_uids(&mut self) -> Result<Option<(u32, u32)>, Error> {
        self.check_unstaged()?;
        if self.appends.last().map_or(false, |a| a.size.is_none()) {
            self.finish()?;
        }

        if self.appends.is_empty() && self.refs.is_empty() {
            return Ok(None);
        }

        self.storage.map.sync_begin()?;
        match self.stage_appends() {
            Ok(range) => Ok(range),
            Err(e) => {
                self.storage.map.sync_rollback();
                self.failed = true;
                Err(e)
            }
        }
    }

    fn stage_appends(&mut self) -> Result<Option<(u32, u32)>, Error> {
        let mut tx = LogTransaction::new();
        self.assign_file_ids(&mut tx)?;

        for append in &self.appends {
            tx.append(
                MapRecord {
                    file_id: self.files[append.file_ix].file.file_id(),
                    offset: append.offset as u32,
                    size: append.size.unwrap_or(0) as u32,
                },
                1,
            );
        }

        self.refs.revalidate(&self.storage.map)?;
        self.refs.stage_into(&mut tx);

        let view = self.storage.map.view();
        if 0 == view.uid_validity {
            tx.set_uid_validity(Utc::now().timestamp().max(1) as u32);
        }

        let range = if self.appends.is_empty() {
            None
        } else {
            let first = view.next_uid;
            let last = (first - 1)
                .checked_add(self.appends.len() as u32)
                .ok_or_else(|| {
                    self.storage
                        .map
                        .set_corrupted("UID space exhausted".to_owned())
                })?;
            Some((first, last))
        };

        self.staged = Some(tx);
        Ok(range)
    }

    /// Prepare to move existing messages into the messages appended in this
    /// batch.
    ///
    /// `map_uids[n]` is retargeted to the `n`th append of the batch. Every
    /// UID in `expunge_uids` is removed from the map.
    pub fn append_move(
        &mut self,
        map_uids: &[u32],
        expunge_uids: &[u32],
    ) -> Result<(), Error> {
        self.check_unstaged()?;
        if self.appends.last().map_or(false, |a| a.size.is_none()) {
            self.finish()?;
        }

        if map_uids.len() != self.appends.len() {
            self.failed = true;
            return Err(Error::BatchFailed);
        }

        self.storage.map.sync_begin()?;
        match self.stage_move(map_uids, expunge_uids) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.storage.map.sync_rollback();
                self.failed = true;
                Err(e)
            }
        }
    }

    fn stage_move(
        &mut self,
        map_uids: &[u32],
        expunge_uids: &[u32],
    ) -> Result<(), Error> {
        let mut tx = LogTransaction::new();
        self.assign_file_ids(&mut tx)?;

        for (&map_uid, append) in map_uids.iter().zip(&self.appends) {
            if self.storage.map.view().get(map_uid).is_none() {
                return Err(self.storage.map.set_corrupted(format!(
                    "map_uid={} vanished while being moved",
                    map_uid
                )));
            }

            tx.update_record(
                map_uid,
                MapRecord {
                    file_id: self.files[append.file_ix].file.file_id(),
                    offset: append.offset as u32,
                    size: append.size.unwrap_or(0) as u32,
                },
            );
        }

        for &map_uid in expunge_uids {
            tx.expunge(map_uid);
        }

        self.staged = Some(tx);
        Ok(())
    }

    /// Make the batch visible.
    ///
    /// If neither `assign_map_uids()` nor `append_move()` was called, this
    /// calls `assign_map_uids()` first. Returns the map UIDs assigned to the
    /// appended messages, if any.
    pub fn commit(mut self) -> Result<Option<(u32, u32)>, Error> {
        self.check_usable()?;
        if self.staged.is_none() {
            self.assign_map_uids()?;
        }

        let tx = match self.staged.take() {
            Some(tx) => tx,
            None => {
                self.release_files();
                return Ok(None);
            }
        };

        match self.storage.map.sync_commit(tx) {
            Ok(range) => {
                debug!(
                    "{} Committed {} appends in {} files",
                    self.storage.log_prefix,
                    self.appends.len(),
                    self.files.len()
                );
                self.release_files();
                Ok(range)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn release_files(&mut self) {
        self.done = true;
        for fa in self.files.drain(..) {
            self.storage.release_file(fa.file);
        }
    }

    /// Abandon the batch, leaving files and map as they were.
    pub fn rollback(mut self) {
        self.do_rollback();
    }

    fn do_rollback(&mut self) {
        self.done = true;
        if self.staged.take().is_some() || self.storage.map.is_syncing()
        {
            self.storage.map.sync_rollback();
        }

        while let Some(mut fa) = self.files.pop() {
            if fa.created {
                if let Err(e) = fs::remove_file(fa.file.path()).ignore_not_found()
                {
                    error!(
                        "{} Failed to remove abandoned file {}: {}",
                        self.storage.log_prefix,
                        fa.file.path().display(),
                        e
                    );
                }
            } else {
                if let Err(e) = fa.file.cancel_append(fa.first_append_offset) {
                    error!(
                        "{} Failed to roll back appends to {}: {}",
                        self.storage.log_prefix,
                        fa.file.path().display(),
                        e
                    );
                }
                self.storage.release_file(fa.file);
            }
        }

        self.appends.clear();
    }
}

impl Drop for AppendContext<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.do_rollback();
        }
    }
}

/// Writes the bytes of one message into its file.
pub struct AppendWriter<'a> {
    file: &'a mut PhysicalFile,
    start: u64,
}

impl AppendWriter<'_> {
    /// The offset at which this message starts.
    pub fn offset(&self) -> u64 {
        self.start
    }

    /// The number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.file.output_offset() - self.start
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.append_bytes(data)
    }

    /// Rewrite the pre-header at the start of this message to declare
    /// `body_size`.
    pub fn rewrite_pre_header(&mut self, body_size: u64) -> Result<(), Error> {
        self.file.rewrite_pre_header(self.start, body_size)
    }
}

impl Write for AppendWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.append_bytes(buf) {
            Ok(()) => Ok(buf.len()),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
