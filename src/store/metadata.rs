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

//! The metadata trailer which follows every message body.
//!
//! The trailer begins with the two-byte magic `\x01\x03` and is followed by
//! any number of lines of the form `<key><value>\n`, where the key is a single
//! character. A line which is empty or which starts with a space ends the
//! trailer. Writers always end it with a line of 64 spaces so that the trailer
//! can later be rewritten in place with slightly longer values.

use std::io::{self, BufRead, Write};

use bitflags::bitflags;
use chrono::prelude::*;

pub const MAGIC_POST: [u8; 2] = [0x01, 0x03];
pub const EXTRA_SPACE: usize = 64;

const KEY_GUID: u8 = b'G';
const KEY_POP3_UIDL: u8 = b'P';
const KEY_RECEIVED_TIME: u8 = b'R';
const KEY_SAVE_TIME: u8 = b'S';
const KEY_PHYSICAL_SIZE: u8 = b'Z';
const KEY_VIRTUAL_SIZE: u8 = b'V';
const KEY_FLAGS: u8 = b'F';
const KEY_KEYWORDS: u8 = b'K';
const KEY_ORIG_MAILBOX: u8 = b'B';

bitflags! {
    /// The system flags which are stored in the trailer.
    ///
    /// They are encoded as five fixed positions in the order `AFDST`, each
    /// position holding the flag letter if set and `0` otherwise.
    #[derive(Default)]
    pub struct MailFlags: u8 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const SEEN = 1 << 3;
        const DRAFT = 1 << 4;
    }
}

const FLAG_CHARS: [(MailFlags, char); 5] = [
    (MailFlags::ANSWERED, 'A'),
    (MailFlags::FLAGGED, 'F'),
    (MailFlags::DELETED, 'D'),
    (MailFlags::SEEN, 'S'),
    (MailFlags::DRAFT, 'T'),
];

impl MailFlags {
    fn encode(self) -> String {
        FLAG_CHARS
            .iter()
            .map(|&(flag, ch)| if self.contains(flag) { ch } else { '0' })
            .collect()
    }

    fn decode(s: &str) -> Self {
        let mut flags = MailFlags::empty();
        for (&(flag, _), ch) in FLAG_CHARS.iter().zip(s.chars()) {
            if '0' != ch {
                flags |= flag;
            }
        }
        flags
    }

    /// Parse a flag given as a single letter or a full IMAP-style name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim_start_matches('\\');
        FLAG_CHARS
            .iter()
            .zip(&["answered", "flagged", "deleted", "seen", "draft"])
            .find(|&(&(_, ch), long)| {
                name.eq_ignore_ascii_case(long)
                    || (1 == name.len()
                        && name.starts_with(|c: char| {
                            c.to_ascii_uppercase() == ch
                        }))
            })
            .map(|(&(flag, _), _)| flag)
    }
}

/// The decoded content of a metadata trailer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub guid: Option<String>,
    pub pop3_uidl: Option<String>,
    pub received_date: Option<DateTime<Utc>>,
    pub save_date: Option<DateTime<Utc>>,
    pub physical_size: Option<u64>,
    pub virtual_size: Option<u64>,
    pub flags: Option<MailFlags>,
    pub keywords: Vec<String>,
    pub orig_mailbox: Option<String>,
    /// Lines with keys this code does not understand, kept so that rewriting
    /// the trailer does not lose them.
    pub other: Vec<(char, String)>,
}

impl Metadata {
    /// Encode the key/value lines of this trailer, without the magic or the
    /// padding.
    pub fn encode_lines(&self) -> Vec<u8> {
        let mut s = String::new();

        if let Some(ref guid) = self.guid {
            push_line(&mut s, KEY_GUID, &clean(guid));
        }
        if let Some(ref uidl) = self.pop3_uidl {
            push_line(&mut s, KEY_POP3_UIDL, &clean(uidl));
        }
        if let Some(received) = self.received_date {
            push_line(
                &mut s,
                KEY_RECEIVED_TIME,
                &format!("{:x}", received.timestamp().max(0)),
            );
        }
        if let Some(saved) = self.save_date {
            push_line(
                &mut s,
                KEY_SAVE_TIME,
                &format!("{:x}", saved.timestamp().max(0)),
            );
        }
        if let Some(size) = self.physical_size {
            push_line(&mut s, KEY_PHYSICAL_SIZE, &format!("{:x}", size));
        }
        if let Some(size) = self.virtual_size {
            push_line(&mut s, KEY_VIRTUAL_SIZE, &format!("{:x}", size));
        }
        if let Some(flags) = self.flags {
            push_line(&mut s, KEY_FLAGS, &flags.encode());
        }

        let keywords = self
            .keywords
            .iter()
            .map(|k| clean(k).replace(' ', ""))
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();
        if !keywords.is_empty() {
            push_line(&mut s, KEY_KEYWORDS, &keywords.join(" "));
        }

        if let Some(ref mailbox) = self.orig_mailbox {
            push_line(&mut s, KEY_ORIG_MAILBOX, &clean(mailbox));
        }
        for &(key, ref value) in &self.other {
            if key.is_ascii_graphic() {
                push_line(&mut s, key as u8, &clean(value));
            }
        }

        s.into_bytes()
    }

    /// Decode the raw lines of a trailer as returned by `read_trailer`.
    ///
    /// Malformed values are ignored rather than treated as errors, since the
    /// trailer is advisory and the message itself is still intact.
    pub fn decode_lines(raw: &[u8]) -> Self {
        let mut this = Metadata::default();

        for line in raw.split(|&b| b'\n' == b) {
            if line.is_empty() {
                continue;
            }

            let key = line[0];
            let value = String::from_utf8_lossy(&line[1..]).into_owned();
            match key {
                KEY_GUID => this.guid = Some(value),
                KEY_POP3_UIDL => this.pop3_uidl = Some(value),
                KEY_RECEIVED_TIME => this.received_date = parse_time(&value),
                KEY_SAVE_TIME => this.save_date = parse_time(&value),
                KEY_PHYSICAL_SIZE => {
                    this.physical_size = u64::from_str_radix(&value, 16).ok()
                }
                KEY_VIRTUAL_SIZE => {
                    this.virtual_size = u64::from_str_radix(&value, 16).ok()
                }
                KEY_FLAGS => this.flags = Some(MailFlags::decode(&value)),
                KEY_KEYWORDS => {
                    this.keywords = value
                        .split(' ')
                        .filter(|k| !k.is_empty())
                        .map(str::to_owned)
                        .collect()
                }
                KEY_ORIG_MAILBOX => this.orig_mailbox = Some(value),
                other => this.other.push((other as char, value)),
            }
        }

        this
    }
}

fn push_line(dst: &mut String, key: u8, value: &str) {
    dst.push(key as char);
    dst.push_str(value);
    dst.push('\n');
}

fn clean(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

fn parse_time(hex: &str) -> Option<DateTime<Utc>> {
    let secs = i64::from_str_radix(hex, 16).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Write a complete trailer consisting of the given raw lines.
pub fn write_trailer(mut out: impl Write, lines: &[u8]) -> io::Result<()> {
    out.write_all(&MAGIC_POST)?;
    out.write_all(lines)?;
    if !lines.is_empty() && !lines.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    out.write_all(&[b' '; EXTRA_SPACE])?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Read a trailer from `src`, which must be positioned at the magic.
///
/// Returns the raw lines, each with its terminating newline but excluding the
/// terminating line itself, along with the total number of bytes the trailer
/// occupies. Returns `None` if the magic is absent or the trailer is cut off
/// before its end, both of which indicate that the caller was given a bad
/// offset.
pub fn read_trailer(mut src: impl BufRead) -> io::Result<Option<(Vec<u8>, u64)>> {
    let mut magic = [0u8; 2];
    match src.read_exact(&mut magic) {
        Ok(()) => (),
        Err(e) if io::ErrorKind::UnexpectedEof == e.kind() => return Ok(None),
        Err(e) => return Err(e),
    }

    if MAGIC_POST != magic {
        return Ok(None);
    }

    let mut len = MAGIC_POST.len() as u64;
    let mut lines = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let nread = src.read_until(b'\n', &mut line)?;
        if 0 == nread || !line.ends_with(b"\n") {
            return Ok(None);
        }

        len += nread as u64;
        if b"\n" == &line[..] || b' ' == line[0] {
            return Ok(Some((lines, len)));
        }

        lines.extend_from_slice(&line);
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn flags_use_fixed_positions() {
        assert_eq!("00000", MailFlags::empty().encode());
        assert_eq!("A0D0T", (MailFlags::ANSWERED
            | MailFlags::DELETED
            | MailFlags::DRAFT)
            .encode());
        assert_eq!(MailFlags::SEEN | MailFlags::FLAGGED, MailFlags::decode("0F0S0"));
        assert_eq!(Some(MailFlags::SEEN), MailFlags::from_name("\\Seen"));
        assert_eq!(Some(MailFlags::DRAFT), MailFlags::from_name("t"));
        assert_eq!(None, MailFlags::from_name("\\Recent"));
    }

    #[test]
    fn trailer_layout() {
        let metadata = Metadata {
            received_date: Some(Utc.timestamp(0x5f00_0000, 0)),
            virtual_size: Some(300),
            flags: Some(MailFlags::SEEN),
            keywords: vec!["$Junk".to_owned(), "todo".to_owned()],
            ..Metadata::default()
        };

        let mut out = Vec::new();
        write_trailer(&mut out, &metadata.encode_lines()).unwrap();

        let mut expected = b"\x01\x03R5f000000\nV12c\nF000S0\nK$Junk todo\n"
            .to_vec();
        expected.extend_from_slice(&[b' '; 64]);
        expected.push(b'\n');
        assert_eq!(expected, out);

        let (raw, len) = read_trailer(&out[..]).unwrap().unwrap();
        assert_eq!(out.len() as u64, len);
        assert_eq!(metadata, Metadata::decode_lines(&raw));
    }

    #[test]
    fn unknown_keys_survive() {
        let raw = b"Xsomething\nV10\n";
        let metadata = Metadata::decode_lines(raw);
        assert_eq!(vec![('X', "something".to_owned())], metadata.other);
        assert_eq!(Some(16), metadata.virtual_size);
        assert_eq!(
            Metadata::decode_lines(raw),
            Metadata::decode_lines(&metadata.encode_lines())
        );
    }

    #[test]
    fn bad_trailers_are_rejected() {
        assert_eq!(None, read_trailer(&b""[..]).unwrap());
        assert_eq!(None, read_trailer(&b"\x01\x02R0\n\n"[..]).unwrap());
        // Cut off before the terminating line
        assert_eq!(None, read_trailer(&b"\x01\x03R0\nV1"[..]).unwrap());
        assert_eq!(
            Some((b"R0\n".to_vec(), 6)),
            read_trailer(&b"\x01\x03R0\n\nfollowing"[..]).unwrap()
        );
    }

    fn keyword() -> impl Strategy<Value = String> {
        "[a-zA-Z$][a-zA-Z0-9_$]{0,15}"
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        #[test]
        fn metadata_survives_encoding(
            guid in proptest::option::of("[0-9a-f]{32}"),
            uidl in proptest::option::of("[!-~]{1,20}"),
            received in proptest::option::of(0i64..0x7fff_ffff),
            saved in proptest::option::of(0i64..0x7fff_ffff),
            physical in proptest::option::of(0u64..u64::MAX),
            vsize in proptest::option::of(0u64..u64::MAX),
            flags in proptest::option::of(0u8..32),
            keywords in prop::collection::vec(keyword(), 0..5),
            mailbox in proptest::option::of("[a-zA-Z0-9/. ]{1,30}"),
        ) {
            let metadata = Metadata {
                guid,
                pop3_uidl: uidl,
                received_date: received.map(|t| Utc.timestamp(t, 0)),
                save_date: saved.map(|t| Utc.timestamp(t, 0)),
                physical_size: physical,
                virtual_size: vsize,
                flags: flags.map(MailFlags::from_bits_truncate),
                keywords,
                orig_mailbox: mailbox,
                other: vec![],
            };

            let mut out = Vec::new();
            write_trailer(&mut out, &metadata.encode_lines()).unwrap();
            let (raw, len) = read_trailer(&out[..]).unwrap().unwrap();
            prop_assert_eq!(out.len() as u64, len);
            prop_assert_eq!(metadata, Metadata::decode_lines(&raw));
        }
    }
}
