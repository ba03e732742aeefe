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

use std::io::{self, Read};

use chrono::prelude::*;
use log::error;

use super::append::{AppendContext, AppendWriter};
use super::file::pre_header;
use super::metadata::{self, MailFlags, Metadata};
use super::storage::Storage;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const COPY_BUF_SIZE: usize = 65536;

/// What the mailbox layer knows about a message being saved.
#[derive(Clone, Debug, Default)]
pub struct SaveRequest {
    /// Defaults to the time of the save.
    pub received_date: Option<DateTime<Utc>>,
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    pub guid: Option<String>,
    pub pop3_uidl: Option<String>,
    pub orig_mailbox: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveResult {
    /// The map UIDs of the saved messages, in the order they were saved.
    pub saved: Vec<u32>,
    /// The map UIDs whose refcounts were incremented by `copy()`.
    pub copied: Vec<u32>,
}

/// Saves messages for one mailbox transaction.
///
/// Nothing becomes visible until `commit()`. Dropping the context discards
/// everything.
pub struct SaveContext<'s> {
    ctx: AppendContext<'s>,
    copied: Vec<u32>,
    log_prefix: LogPrefix,
}

impl<'s> SaveContext<'s> {
    pub fn begin(storage: &'s mut Storage) -> Result<Self, Error> {
        let log_prefix = storage.log_prefix().clone();
        Ok(SaveContext {
            ctx: AppendContext::begin(storage)?,
            copied: Vec::new(),
            log_prefix,
        })
    }

    pub fn saved_count(&self) -> usize {
        self.ctx.append_count()
    }

    /// Stream a message from `src` into storage.
    ///
    /// `size_hint` is the expected size of the message and is used to pick a
    /// file to put it in. If anything fails, the partially written message is
    /// discarded but earlier messages in the batch are unaffected.
    pub fn save(
        &mut self,
        request: &SaveRequest,
        src: impl Read,
        size_hint: u64,
    ) -> Result<(), Error> {
        let before = self.ctx.append_count();
        let result = self.write_message(request, src, size_hint);

        if result.is_err() && self.ctx.append_count() > before {
            if let Err(e) = self.ctx.cancel_last() {
                error!(
                    "{} Failed to discard partially saved message: {}",
                    self.log_prefix, e
                );
            }
        }

        result
    }

    fn write_message(
        &mut self,
        request: &SaveRequest,
        mut src: impl Read,
        size_hint: u64,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut w = self.ctx.append_next(size_hint)?;

        w.write_bytes(&pre_header(0))?;
        let (body_size, virtual_size) = copy_body(&mut src, &mut w)?;
        w.rewrite_pre_header(body_size)?;

        let metadata = Metadata {
            guid: request.guid.clone(),
            pop3_uidl: request.pop3_uidl.clone(),
            received_date: Some(request.received_date.unwrap_or(now)),
            save_date: Some(now),
            virtual_size: Some(virtual_size),
            flags: Some(request.flags),
            keywords: request.keywords.clone(),
            orig_mailbox: request.orig_mailbox.clone(),
            ..Metadata::default()
        };
        metadata::write_trailer(&mut w, &metadata.encode_lines())?;

        self.ctx.finish()
    }

    /// Add a reference to the existing message `map_uid` as part of this
    /// batch.
    pub fn copy(&mut self, map_uid: u32) -> Result<(), Error> {
        self.ctx.update_refcounts(&[map_uid], 1)?;
        self.copied.push(map_uid);
        Ok(())
    }

    pub fn commit(self) -> Result<SaveResult, Error> {
        let SaveContext { ctx, copied, .. } = self;
        let saved = match ctx.commit()? {
            Some((first, last)) => (first..=last).collect(),
            None => Vec::new(),
        };

        Ok(SaveResult { saved, copied })
    }

    pub fn rollback(self) {
        self.ctx.rollback();
    }
}

/// Copy all of `src` into `dst`, returning the number of bytes copied and
/// the size the data would have with every bare LF turned into CRLF.
fn copy_body(
    src: &mut impl Read,
    dst: &mut AppendWriter<'_>,
) -> Result<(u64, u64), Error> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut size = 0u64;
    let mut virtual_size = 0u64;
    let mut last = 0u8;

    loop {
        let nread = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => return Err(e.into()),
        };

        let chunk = &buf[..nread];
        dst.write_bytes(chunk)?;

        size += nread as u64;
        virtual_size += nread as u64;
        for lf in memchr::memchr_iter(b'\n', chunk) {
            let prev = if 0 == lf { last } else { chunk[lf - 1] };
            if b'\r' != prev {
                virtual_size += 1;
            }
        }
        last = chunk[nread - 1];
    }

    Ok((size, virtual_size))
}
