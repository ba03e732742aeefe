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

use std::io::{self, Write};

use super::main::{
    CatSubcommand, ForgetFileSubcommand, PurgeSubcommand, RefSubcommand,
};
use crate::store::metadata::Metadata;
use crate::store::storage::{Storage, StorageStatus};
use crate::support::sysexits::*;

pub(super) fn cat(mut storage: Storage, cmd: CatSubcommand) {
    let message = match storage.read_message(cmd.map_uid) {
        Ok(message) => message,
        Err(e) => die!(
            Sysexit::for_error(&e),
            "Failed to read map_uid={}: {}",
            cmd.map_uid,
            e
        ),
    };

    if cmd.metadata {
        eprint!("{}", format_metadata(&message.metadata));
    }

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    if let Err(e) = stdout
        .write_all(&message.body)
        .and_then(|()| stdout.flush())
    {
        die!(EX_IOERR, "Failed to write message: {}", e);
    }
}

fn format_metadata(md: &Metadata) -> String {
    let mut s = String::new();
    if let Some(ref guid) = md.guid {
        s.push_str(&format!("guid: {}\n", guid));
    }
    if let Some(ref uidl) = md.pop3_uidl {
        s.push_str(&format!("pop3-uidl: {}\n", uidl));
    }
    if let Some(received) = md.received_date {
        s.push_str(&format!("received: {}\n", received.to_rfc3339()));
    }
    if let Some(saved) = md.save_date {
        s.push_str(&format!("saved: {}\n", saved.to_rfc3339()));
    }
    if let Some(size) = md.virtual_size {
        s.push_str(&format!("virtual-size: {}\n", size));
    }
    if let Some(flags) = md.flags {
        s.push_str(&format!("flags: {:?}\n", flags));
    }
    if !md.keywords.is_empty() {
        s.push_str(&format!("keywords: {}\n", md.keywords.join(" ")));
    }
    if let Some(ref mailbox) = md.orig_mailbox {
        s.push_str(&format!("original-mailbox: {}\n", mailbox));
    }
    s
}

pub(super) fn adjust_ref(mut storage: Storage, cmd: RefSubcommand) {
    match storage.map().lookup(cmd.map_uid) {
        Ok(Some(_)) => (),
        Ok(None) => die!(EX_NOINPUT, "map_uid={} does not exist", cmd.map_uid),
        Err(e) => die!(
            Sysexit::for_error(&e),
            "Failed to look up map_uid={}: {}",
            cmd.map_uid,
            e
        ),
    }

    if let Err(e) = storage.update_refcounts(&[cmd.map_uid], cmd.delta) {
        die!(
            Sysexit::for_error(&e),
            "Failed to adjust refcount of map_uid={}: {}",
            cmd.map_uid,
            e
        );
    }

    match storage.map().view().get(cmd.map_uid).and_then(|e| e.refcount) {
        Some(refcount) => println!("{}", refcount),
        None => die!(EX_NOINPUT, "map_uid={} does not exist", cmd.map_uid),
    }
}

pub(super) fn purge(mut storage: Storage, cmd: PurgeSubcommand) {
    if !cmd.force {
        let wanted = storage.map().want_purge()
            || match storage.map().get_zero_ref_files() {
                Ok(files) => !files.is_empty(),
                Err(e) => die!(
                    Sysexit::for_error(&e),
                    "Failed to scan storage: {}",
                    e
                ),
            };
        if !wanted {
            println!("Nothing to purge");
            return;
        }
    }

    let stats = match storage.purge() {
        Ok(stats) => stats,
        Err(e) => die!(Sysexit::for_error(&e), "Purge failed: {}", e),
    };

    println!(
        "{} files compacted, {} deleted, {} skipped, {} failed\n\
         {} messages moved, {} expunged",
        stats.files_compacted,
        stats.files_deleted,
        stats.files_skipped,
        stats.files_failed,
        stats.messages_moved,
        stats.messages_expunged
    );

    if 0 != stats.files_failed || storage.files_corrupted() {
        EX_SOFTWARE.exit();
    }
}

pub(super) fn status(mut storage: Storage) {
    match storage.status() {
        Ok(status) => print!("{}", format_status(&status)),
        Err(e) => die!(Sysexit::for_error(&e), "Failed to scan storage: {}", e),
    }
}

fn format_status(status: &StorageStatus) -> String {
    let join = |ids: &std::collections::BTreeSet<u32>| {
        ids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")
    };

    format!(
        "uid-validity: {}\n\
         messages: {} ({} referenced)\n\
         bytes: {} ({} unreferenced)\n\
         files: {}\n\
         files-with-unreferenced: {}\n\
         want-purge: {}\n\
         corrupted: {}\n",
        status.uid_validity,
        status.messages,
        status.live_messages,
        status.total_bytes,
        status.dead_bytes,
        join(&status.files),
        join(&status.zero_ref_files),
        status.want_purge,
        status.files_corrupted
    )
}

pub(super) fn forget_file(mut storage: Storage, cmd: ForgetFileSubcommand) {
    if let Err(e) = storage.forget_file(cmd.file_id) {
        die!(
            Sysexit::for_error(&e),
            "Failed to forget file {}: {}",
            cmd.file_id,
            e
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_format() {
        let status = StorageStatus {
            uid_validity: 1234,
            messages: 3,
            live_messages: 2,
            total_bytes: 300,
            dead_bytes: 100,
            files: vec![1, 2].into_iter().collect(),
            zero_ref_files: vec![2].into_iter().collect(),
            want_purge: false,
            files_corrupted: false,
        };

        assert_eq!(
            "uid-validity: 1234\n\
             messages: 3 (2 referenced)\n\
             bytes: 300 (100 unreferenced)\n\
             files: 1 2\n\
             files-with-unreferenced: 2\n\
             want-purge: false\n\
             corrupted: false\n",
            format_status(&status)
        );
    }

    #[test]
    fn metadata_format_skips_absent_fields() {
        let md = Metadata {
            virtual_size: Some(42),
            keywords: vec!["a".to_owned(), "b".to_owned()],
            ..Metadata::default()
        };
        assert_eq!(
            "virtual-size: 42\nkeywords: a b\n",
            format_metadata(&md)
        );
    }
}
