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
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::store::storage::Storage;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Save(SaveSubcommand),
    /// Write the body of a stored message to standard output.
    Cat(CatSubcommand),
    /// Adjust the reference count of a stored message.
    ///
    /// A message whose reference count drops to 0 is not deleted
    /// immediately; its space is reclaimed by the next purge.
    Ref(RefSubcommand),
    Purge(PurgeSubcommand),
    /// Show a summary of the storage.
    Status(CommonOptions),
    /// Remove all map entries that point into a storage file.
    ///
    /// This is the way to recover from a storage file being lost. Every
    /// message in the file, referenced or not, ceases to exist.
    ForgetFile(ForgetFileSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `mdbox.toml` etc
    /// [default: /etc/mdbox or /usr/local/etc/mdbox]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Save(ref mut c) => mem::take(&mut c.common),
            Command::Cat(ref mut c) => mem::take(&mut c.common),
            Command::Ref(ref mut c) => mem::take(&mut c.common),
            Command::Purge(ref mut c) => mem::take(&mut c.common),
            Command::Status(ref mut c) => mem::take(c),
            Command::ForgetFile(ref mut c) => mem::take(&mut c.common),
        }
    }
}

/// Store messages.
///
/// Each input is stored as one message, and the map UID of each is printed
/// on its own line in the order the inputs were given. Either all inputs
/// are stored or none are.
///
/// The storage is created if it does not exist yet.
#[derive(StructOpt)]
pub(super) struct SaveSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Set this flag (e.g., '\Seen' or 'S') on the stored message(s). Can be
    /// passed multiple times.
    #[structopt(short, long, number_of_values(1))]
    pub(super) flag: Vec<String>,

    /// Add this keyword to the stored message(s). Can be passed multiple
    /// times.
    #[structopt(short, long, number_of_values(1))]
    pub(super) keyword: Vec<String>,

    /// The files to store. "-" will read from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) inputs: Vec<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct CatSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Also print the metadata stored with the message.
    #[structopt(long)]
    pub(super) metadata: bool,

    pub(super) map_uid: u32,
}

#[derive(StructOpt)]
pub(super) struct RefSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    pub(super) map_uid: u32,

    /// The amount to add to the reference count; may be negative.
    #[structopt(allow_hyphen_values = true)]
    pub(super) delta: i32,
}

/// Reclaim space used by unreferenced messages.
///
/// Without --force, nothing happens unless there are files worth compacting.
#[derive(StructOpt)]
pub(super) struct PurgeSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Purge even if the storage doesn't look like it needs it.
    #[structopt(long)]
    pub(super) force: bool,
}

#[derive(StructOpt)]
pub(super) struct ForgetFileSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    pub(super) file_id: u32,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/mdbox/mdbox.toml").is_file() {
            "/etc/mdbox".to_owned().into()
        } else if Path::new("/usr/local/etc/mdbox/mdbox.toml").is_file() {
            "/usr/local/etc/mdbox".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/mdbox nor /usr/local/etc/mdbox looks like\n\
                 the Mdbox root; use --root=/path/to/mdbox if your\n\
                 installation is elsewhere."
            )
        }
    });

    let mut system_config = load_config(&root);
    if system_config.storage.path.as_os_str().is_empty() {
        die!(EX_CONFIG, "No storage path is configured in mdbox.toml");
    }
    if system_config.storage.path.is_relative() {
        system_config.storage.path = root.join(&system_config.storage.path);
    }
    if let Some(alt_path) = system_config.storage.alt_path.as_mut() {
        if alt_path.is_relative() {
            *alt_path = root.join(&*alt_path);
        }
    }

    init_logging(&root);

    let create = matches!(cmd, Command::Save(..));
    let storage = match Storage::open(
        system_config.storage.clone(),
        create,
        LogPrefix::new(format!("mdbox:{}", system_config.storage.path.display())),
    ) {
        Ok(storage) => storage,
        Err(Error::StorageNotFound) => die!(
            EX_NOINPUT,
            "No storage at '{}'",
            system_config.storage.path.display()
        ),
        Err(e) => die!(
            Sysexit::for_error(&e),
            "Failed to open storage at '{}': {}",
            system_config.storage.path.display(),
            e
        ),
    };

    match cmd {
        Command::Save(cmd) => super::save::save(storage, cmd),
        Command::Cat(cmd) => super::admin::cat(storage, cmd),
        Command::Ref(cmd) => super::admin::adjust_ref(storage, cmd),
        Command::Purge(cmd) => super::admin::purge(storage, cmd),
        Command::Status(_) => super::admin::status(storage),
        Command::ForgetFile(cmd) => super::admin::forget_file(storage, cmd),
    }
}

fn load_config(root: &Path) -> SystemConfig {
    let system_config_path = root.join("mdbox.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            system_config_path.display(),
            e
        );
    }

    match toml::from_slice(&system_config_toml) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            system_config_path.display(),
            e
        ),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_SOFTWARE, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}
