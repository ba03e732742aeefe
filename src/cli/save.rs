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

use std::fs;
use std::io::{self, BufReader, Read};
use std::mem;
use std::path::{Path, PathBuf};

use log::error;

use super::main::SaveSubcommand;
use crate::store::metadata::MailFlags;
use crate::store::save::{SaveContext, SaveRequest};
use crate::store::storage::Storage;
use crate::support::{error::Error, sysexits::*};

pub(super) fn save(mut storage: Storage, mut cmd: SaveSubcommand) {
    let request = match build_request(&cmd) {
        Ok(request) => request,
        Err(flag) => die!(EX_USAGE, "Unknown flag: {}", flag),
    };

    let items = mem::take(&mut cmd.inputs);
    match run_save(&mut storage, &request, items.into_iter(), io::stdin().lock())
    {
        Ok(uids) => {
            for uid in uids {
                println!("{}", uid);
            }
        }
        Err(exit) => exit.exit(),
    }
}

fn build_request(cmd: &SaveSubcommand) -> Result<SaveRequest, String> {
    let mut flags = MailFlags::empty();
    for name in &cmd.flag {
        flags |= MailFlags::from_name(name).ok_or_else(|| name.clone())?;
    }

    Ok(SaveRequest {
        flags,
        keywords: cmd.keyword.clone(),
        ..SaveRequest::default()
    })
}

fn run_save(
    storage: &mut Storage,
    request: &SaveRequest,
    items: impl Iterator<Item = PathBuf>,
    mut stdin: impl Read,
) -> Result<Vec<u32>, Sysexit> {
    let fail = |item: &Path, e: Error| -> Sysexit {
        error!("Unable to store {}: {}", item.display(), e);
        match e {
            Error::Io(ref e) if io::ErrorKind::NotFound == e.kind() => {
                EX_NOINPUT
            }
            e => Sysexit::for_error(&e),
        }
    };

    let mut ctx = match storage.save_begin() {
        Ok(ctx) => ctx,
        Err(e) => return Err(fail(Path::new("-"), e)),
    };

    for item in items {
        if let Err(e) = save_single(&mut ctx, request, &item, &mut stdin) {
            return Err(fail(&item, e));
        }
    }

    match ctx.commit() {
        Ok(result) => Ok(result.saved),
        Err(e) => Err(fail(Path::new("-"), e)),
    }
}

fn save_single(
    ctx: &mut SaveContext<'_>,
    request: &SaveRequest,
    item: &Path,
    stdin: &mut impl Read,
) -> Result<(), Error> {
    if Path::new("-") == item {
        ctx.save(request, BufReader::new(stdin), 0)
    } else {
        let file = fs::File::open(item)?;
        let size = file.metadata()?.len();
        ctx.save(request, BufReader::new(file), size)
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::support::log_prefix::LogPrefix;
    use crate::support::system_config::StorageConfig;

    fn storage(root: &TempDir) -> Storage {
        crate::init_test_log();
        Storage::open(
            StorageConfig {
                path: root.path().join("storage"),
                ..StorageConfig::default()
            },
            true,
            LogPrefix::new("cli-test".to_owned()),
        )
        .unwrap()
    }

    #[test]
    fn saves_files_and_stdin_in_one_batch() {
        let root = TempDir::new().unwrap();
        let mut storage = storage(&root);
        let input = root.path().join("input.eml");
        fs::write(&input, b"from a file").unwrap();

        let request = SaveRequest {
            flags: MailFlags::SEEN,
            ..SaveRequest::default()
        };
        let uids = run_save(
            &mut storage,
            &request,
            vec![input, PathBuf::from("-")].into_iter(),
            &b"from stdin"[..],
        )
        .unwrap();
        assert_eq!(vec![1, 2], uids);

        let first = storage.read_message(1).unwrap();
        assert_eq!(b"from a file".to_vec(), first.body);
        assert_eq!(Some(MailFlags::SEEN), first.metadata.flags);
        assert_eq!(
            b"from stdin".to_vec(),
            storage.read_message(2).unwrap().body
        );
    }

    #[test]
    fn missing_input_stores_nothing() {
        let root = TempDir::new().unwrap();
        let mut storage = storage(&root);

        assert_eq!(
            Err(EX_NOINPUT),
            run_save(
                &mut storage,
                &SaveRequest::default(),
                vec![PathBuf::from("-"), root.path().join("nx")].into_iter(),
                &b"would be stored"[..],
            )
        );
        assert!(storage.map().view().entries.is_empty());
    }

    #[test]
    fn flags_are_parsed_by_name() {
        let cmd = SaveSubcommand {
            common: Default::default(),
            flag: vec!["\\Seen".to_owned(), "F".to_owned()],
            keyword: vec!["$Forwarded".to_owned()],
            inputs: vec![],
        };
        let request = build_request(&cmd).unwrap();
        assert_eq!(MailFlags::SEEN | MailFlags::FLAGGED, request.flags);
        assert_eq!(vec!["$Forwarded".to_owned()], request.keywords);

        let cmd = SaveSubcommand {
            flag: vec!["\\Bogus".to_owned()],
            ..cmd
        };
        assert_eq!(Err("\\Bogus".to_owned()), build_request(&cmd).map(|_| ()));
    }
}
