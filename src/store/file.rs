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

//! Physical storage files.
//!
//! A storage file starts with a one-line header:
//!
//! ```text
//! 2 M<pre-header size> C<creation time> A<append offset>\n
//! ```
//!
//! All numbers are hexadecimal; the append offset is always exactly 8 digits
//! so that it can be rewritten in place.
//!
//! The header is followed by envelopes. Each envelope is a 30-byte
//! pre-header (magic, reserved bytes, 16 hex digits of body size), the
//! message body, and the metadata trailer described in `metadata`.
//!
//! Everything at or beyond the append offset is garbage from an append that
//! never committed and is ignored. The append offset is only advanced after
//! the data before it has been flushed to disk.
//!
//! Writers hold an exclusive `flock()` on the file itself for as long as they
//! may write to it. Locking never blocks; a busy file is simply skipped.

use std::fs;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::warn;
use rand::{rngs::OsRng, Rng};

use super::metadata;
use crate::support::error::Error;
use crate::support::file_ops::{self, ReadUninterruptibly};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::StorageConfig;

pub const FILE_VERSION: u32 = 2;
pub const PRE_HEADER_SIZE: usize = 30;
pub const MAGIC_PRE: [u8; 2] = [0x01, 0x02];

const MAX_HEADER_LINE: usize = 256;
const APPEND_OFFSET_DIGITS: usize = 8;

/// The file name of the committed file with the given id.
pub fn file_name(file_id: u32) -> String {
    format!("m.{}", file_id)
}

/// Parse a file name produced by `file_name()`.
pub fn parse_file_name(name: &str) -> Option<u32> {
    if !name.starts_with("m.") {
        return None;
    }

    let digits = &name[2..];
    if digits.is_empty() || digits.starts_with('0') {
        return None;
    }
    digits.parse().ok().filter(|&id| 0 != id)
}

/// The Unix time of local midnight `days - 1` days ago.
///
/// Files created before this time are too old to be appended to. 0 days
/// disables age-based rotation entirely, which is represented as a stamp of
/// 0.
pub fn day_begin_stamp(days: u32) -> i64 {
    if 0 == days {
        return 0;
    }

    let now = Local::now();
    let midnight = Local
        .from_local_datetime(&now.naive_local().date().and_hms(0, 0, 0))
        .earliest()
        .map(|m| m.timestamp())
        .unwrap_or_else(|| {
            now.timestamp() - i64::from(now.num_seconds_from_midnight())
        });

    midnight - 86400 * (i64::from(days) - 1)
}

/// Build the pre-header for a message body of the given size.
pub fn pre_header(body_size: u64) -> [u8; PRE_HEADER_SIZE] {
    let mut buf = [0u8; PRE_HEADER_SIZE];
    buf[0..2].copy_from_slice(&MAGIC_PRE);
    buf[2] = b'N';
    buf[3] = b' ';
    buf[4..12].copy_from_slice(b"00000000");
    buf[12] = b' ';
    buf[13..29].copy_from_slice(format!("{:016x}", body_size).as_bytes());
    buf[29] = b'\n';
    buf
}

/// Parse a pre-header, returning the body size it declares.
fn parse_pre_header(buf: &[u8; PRE_HEADER_SIZE]) -> Option<u64> {
    if MAGIC_PRE != buf[0..2] || b'N' != buf[2] || b'\n' != buf[29] {
        return None;
    }

    std::str::from_utf8(&buf[13..29])
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub pre_header_size: u32,
    pub create_time: i64,
    /// The durable end of committed data, if the header records one.
    pub append_offset: Option<u64>,
    /// The position of the append offset digits within the header line.
    append_offset_pos: Option<u64>,
    /// The length of the header line including its newline.
    pub header_size: u64,
}

impl FileHeader {
    fn new(create_time: i64) -> (Self, Vec<u8>) {
        let prefix = format!(
            "{} M{:x} C{:x} A",
            FILE_VERSION,
            PRE_HEADER_SIZE,
            create_time.max(0)
        );
        let header_size = (prefix.len() + APPEND_OFFSET_DIGITS + 1) as u64;
        let line = format!("{}{:08x}\n", prefix, header_size);

        (
            FileHeader {
                pre_header_size: PRE_HEADER_SIZE as u32,
                create_time,
                append_offset: Some(header_size),
                append_offset_pos: Some(prefix.len() as u64),
                header_size,
            },
            line.into_bytes(),
        )
    }

    fn parse(line: &[u8]) -> Result<Self, String> {
        let line = std::str::from_utf8(line)
            .map_err(|_| "Header is not UTF-8".to_owned())?;
        let mut tokens = line.split(' ');

        if Some(FILE_VERSION.to_string().as_str()) != tokens.next() {
            return Err("Invalid file version".to_owned());
        }

        let mut pos = 2u64;
        let mut pre_header_size = None;
        let mut create_time = 0;
        let mut append_offset = None;
        let mut append_offset_pos = None;

        for token in tokens {
            let mut chars = token.chars();
            let key = chars.next();
            let value = chars.as_str();

            match key {
                Some('M') => {
                    pre_header_size = u32::from_str_radix(value, 16).ok()
                }
                Some('C') => {
                    create_time = i64::from_str_radix(value, 16).unwrap_or(0)
                }
                Some('A') => {
                    if let Ok(offset) = u64::from_str_radix(value, 16) {
                        append_offset = Some(offset);
                        if APPEND_OFFSET_DIGITS == value.len() {
                            append_offset_pos = Some(pos + 1);
                        }
                    }
                }
                _ => (),
            }

            pos += token.len() as u64 + 1;
        }

        let pre_header_size = pre_header_size
            .filter(|&s| 0 != s)
            .ok_or_else(|| "Missing message header size".to_owned())?;

        Ok(FileHeader {
            pre_header_size,
            create_time,
            append_offset,
            append_offset_pos,
            header_size: line.len() as u64 + 1,
        })
    }
}

/// The outcome of trying to lock a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    /// Another process holds the lock.
    Busy,
    /// The file was deleted after it was opened.
    Gone,
}

/// A raw envelope as stored in a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub pre_header: [u8; PRE_HEADER_SIZE],
    pub body: Vec<u8>,
    /// The raw metadata lines, excluding magic and padding.
    pub metadata: Vec<u8>,
    /// The whole trailer exactly as stored, padding included.
    pub trailer: Vec<u8>,
    /// The total size of the envelope in the file.
    pub size: u64,
}

/// An open storage file.
#[derive(Debug)]
pub struct PhysicalFile {
    file_id: u32,
    path: PathBuf,
    file: fs::File,
    header: FileHeader,
    locked: bool,
    nonappendable: bool,
    /// Where the next append goes while locked.
    output_offset: u64,
}

impl PhysicalFile {
    /// Create a new, empty file under a temporary name in `dir`.
    ///
    /// The file is returned locked with file id 0. It only gets its real
    /// name when the map transaction that references it commits.
    pub fn create(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(format!(
            "temp.{}.{:016x}",
            std::process::id(),
            OsRng.gen::<u64>()
        ));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        if !file_ops::try_lock_exclusive(&file)? {
            let _ = fs::remove_file(&path);
            return Err(Error::FileCorrupted {
                path,
                reason: "Newly created file is already locked".to_owned(),
            });
        }

        let (header, line) = FileHeader::new(Utc::now().timestamp());
        if let Err(e) = file_ops::pwrite_all(&file, &line, 0) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        Ok(PhysicalFile {
            file_id: 0,
            path,
            file,
            output_offset: header.header_size,
            header,
            locked: true,
            nonappendable: false,
        })
    }

    /// Open the committed file `file_id`, searching `dir` and then
    /// `alt_dir`.
    ///
    /// Returns `None` if the file exists in neither.
    pub fn open(
        dir: &Path,
        alt_dir: Option<&Path>,
        file_id: u32,
    ) -> Result<Option<Self>, Error> {
        let name = file_name(file_id);
        for candidate in Some(dir).into_iter().chain(alt_dir) {
            let path = candidate.join(&name);
            let file = match fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if io::ErrorKind::NotFound == e.kind() => continue,
                Err(e) => return Err(e.into()),
            };

            let header = read_header(&file, &path)?;
            return Ok(Some(PhysicalFile {
                file_id,
                path,
                file,
                output_offset: header.append_offset.unwrap_or(0),
                header,
                locked: false,
                nonappendable: header.append_offset.is_none()
                    || header.append_offset_pos.is_none()
                    || PRE_HEADER_SIZE as u32 != header.pre_header_size,
            }));
        }

        Ok(None)
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The position at which the next append will be written.
    pub fn output_offset(&self) -> u64 {
        self.output_offset
    }

    /// Whether nothing has ever been committed to this file.
    pub fn is_empty(&self) -> bool {
        self.output_offset == self.header.header_size
    }

    /// Try to take the exclusive lock on this file without blocking.
    ///
    /// On success, the header is reread so that the append position reflects
    /// whatever other processes committed before we got the lock.
    pub fn try_lock(&mut self) -> Result<LockOutcome, Error> {
        if self.locked {
            return Ok(LockOutcome::Locked);
        }

        if !file_ops::try_lock_exclusive(&self.file)? {
            return Ok(LockOutcome::Busy);
        }

        // The file may have been purged between opening and locking it
        let same = match (fs::metadata(&self.path), self.file.metadata()) {
            (Ok(theirs), Ok(ours)) => {
                theirs.dev() == ours.dev() && theirs.ino() == ours.ino()
            }
            (Err(e), _) if io::ErrorKind::NotFound == e.kind() => false,
            (Err(e), _) | (_, Err(e)) => {
                self.release_lock();
                return Err(e.into());
            }
        };

        if !same {
            self.release_lock();
            self.nonappendable = true;
            return Ok(LockOutcome::Gone);
        }

        self.locked = true;
        if let Err(e) = self.reload_header() {
            self.unlock();
            return Err(e);
        }
        self.output_offset = self.header.append_offset.unwrap_or(0);
        Ok(LockOutcome::Locked)
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.release_lock();
            self.locked = false;
        }
    }

    fn release_lock(&self) {
        let _ = nix::fcntl::flock(
            self.file.as_raw_fd(),
            nix::fcntl::FlockArg::Unlock,
        );
    }

    /// Reread the header from disk.
    pub fn reload_header(&mut self) -> Result<(), Error> {
        let header = read_header(&self.file, &self.path)?;
        if header.append_offset.is_none()
            || header.append_offset_pos.is_none()
            || PRE_HEADER_SIZE as u32 != header.pre_header_size
        {
            self.nonappendable = true;
        }
        self.header = header;
        Ok(())
    }

    /// Determine whether `mail_size` more bytes may be appended.
    ///
    /// `stamp` is the result of `day_begin_stamp()` for the configured
    /// rotation age.
    pub fn can_append(
        &self,
        mail_size: u64,
        config: &StorageConfig,
        stamp: i64,
    ) -> bool {
        if self.nonappendable {
            return false;
        }

        // Offsets in the map are 32 bits
        if self.output_offset.saturating_add(mail_size) > u64::from(u32::MAX) {
            return false;
        }

        if self.is_empty() {
            return true;
        }

        if self.header.create_time < stamp {
            return false;
        }

        self.output_offset < config.rotate_min_size
            || self.output_offset + mail_size <= config.rotate_size
    }

    /// Prepare to append a message of `mail_size` bytes.
    ///
    /// If the rotation policy refuses, the file is marked non-appendable for
    /// the rest of its lifetime in this process and `false` is returned.
    pub fn get_append_stream(
        &mut self,
        mail_size: u64,
        config: &StorageConfig,
        stamp: i64,
    ) -> bool {
        if !self.locked {
            return false;
        }

        if self.can_append(mail_size, config, stamp) {
            true
        } else {
            self.nonappendable = true;
            false
        }
    }

    /// Write `data` at the current output offset and advance it.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.locked {
            return Err(Error::FileCorrupted {
                path: self.path.clone(),
                reason: "Append to unlocked file".to_owned(),
            });
        }

        let end = self.output_offset + data.len() as u64;
        if end > u64::from(u32::MAX) {
            return Err(Error::MessageTooLarge);
        }

        file_ops::pwrite_all(&self.file, data, self.output_offset)?;
        self.output_offset = end;
        Ok(())
    }

    /// Overwrite the pre-header of the envelope at `offset` to declare
    /// `body_size`.
    pub fn rewrite_pre_header(
        &mut self,
        offset: u64,
        body_size: u64,
    ) -> Result<(), Error> {
        file_ops::pwrite_all(&self.file, &pre_header(body_size), offset)?;
        Ok(())
    }

    /// Make everything written so far durable, then advance the header's
    /// append offset past it.
    pub fn finish_append(&mut self) -> Result<(), Error> {
        if Some(self.output_offset) == self.header.append_offset {
            return Ok(());
        }

        self.file.sync_data()?;
        self.write_append_offset(self.output_offset)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Discard everything from `offset` onwards, including any committed
    /// append offset beyond it.
    pub fn cancel_append(&mut self, offset: u64) -> Result<(), Error> {
        self.file.set_len(offset)?;
        self.output_offset = offset;
        if self.header.append_offset.map_or(false, |a| a > offset) {
            self.write_append_offset(offset)?;
        }
        Ok(())
    }

    fn write_append_offset(&mut self, offset: u64) -> Result<(), Error> {
        let pos = self.header.append_offset_pos.ok_or_else(|| {
            Error::FileCorrupted {
                path: self.path.clone(),
                reason: "Header has no rewritable append offset".to_owned(),
            }
        })?;

        file_ops::pwrite_all(
            &self.file,
            format!("{:08x}", offset).as_bytes(),
            pos,
        )?;
        self.header.append_offset = Some(offset);
        Ok(())
    }

    /// Give a newly created file its permanent id and name.
    pub fn assign_id(&mut self, dir: &Path, file_id: u32) -> Result<(), Error> {
        let new_path = dir.join(file_name(file_id));
        // Link-then-unlink so that we never clobber an existing file
        fs::hard_link(&self.path, &new_path)?;
        fs::remove_file(&self.path)?;
        self.path = new_path;
        self.file_id = file_id;
        Ok(())
    }

    /// Delete the file from disk.
    ///
    /// A file which is already gone is logged but is not an error.
    pub fn unlink(&self, log_prefix: &LogPrefix) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                warn!(
                    "{} File unexpectedly lost: {}",
                    log_prefix,
                    self.path.display()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the envelope starting at `offset`.
    ///
    /// Returns `None` if `offset` does not point at a valid envelope.
    pub fn read_envelope(&self, offset: u64) -> Result<Option<Envelope>, Error> {
        let len = self.file.metadata()?.len();
        if offset < self.header.header_size
            || offset.saturating_add(PRE_HEADER_SIZE as u64) > len
        {
            return Ok(None);
        }

        let mut pre = [0u8; PRE_HEADER_SIZE];
        self.file.read_exact_at(&mut pre, offset)?;
        let body_size = match parse_pre_header(&pre) {
            Some(size) => size,
            None => return Ok(None),
        };

        let body_offset = offset + PRE_HEADER_SIZE as u64;
        if body_offset
            .checked_add(body_size)
            .map_or(true, |end| end > len)
        {
            return Ok(None);
        }

        let mut body = vec![0u8; body_size as usize];
        self.file.read_exact_at(&mut body, body_offset)?;

        let mut reader = &self.file;
        reader.seek(SeekFrom::Start(body_offset + body_size))?;
        let (metadata, trailer_len) =
            match metadata::read_trailer(BufReader::new(reader))? {
                Some(t) => t,
                None => return Ok(None),
            };

        let mut trailer = vec![0u8; trailer_len as usize];
        self.file.read_exact_at(&mut trailer, body_offset + body_size)?;

        Ok(Some(Envelope {
            pre_header: pre,
            body,
            metadata,
            trailer,
            size: PRE_HEADER_SIZE as u64 + body_size + trailer_len,
        }))
    }

    /// Given the offset of one envelope, find the offset of the next one.
    ///
    /// An `offset` of 0 asks for the first envelope. Returns `None` at the
    /// durable end of the file. An envelope which cannot be parsed before
    /// that point means the file is corrupt.
    pub fn seek_next(&self, offset: u64) -> Result<Option<u64>, Error> {
        let end = self.header.append_offset.unwrap_or(0);
        let next = if 0 == offset {
            self.header.header_size
        } else {
            match self.read_envelope(offset)? {
                Some(envelope) => offset + envelope.size,
                None => {
                    return Err(Error::FileCorrupted {
                        path: self.path.clone(),
                        reason: format!("Broken envelope at {}", offset),
                    })
                }
            }
        };

        if next >= end {
            Ok(None)
        } else {
            Ok(Some(next))
        }
    }
}

impl Drop for PhysicalFile {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn read_header(file: &fs::File, path: &Path) -> Result<FileHeader, Error> {
    let mut buf = [0u8; MAX_HEADER_LINE];
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let nread = reader.read_uninteruptibly(&mut buf)?;

    let corrupt = |reason: String| Error::FileCorrupted {
        path: path.to_owned(),
        reason,
    };

    let eol = memchr::memchr(b'\n', &buf[..nread])
        .ok_or_else(|| corrupt("Unterminated file header".to_owned()))?;
    FileHeader::parse(&buf[..eol]).map_err(corrupt)
}
