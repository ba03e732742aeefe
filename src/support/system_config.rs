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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Mdbox.
///
/// This is stored in a file named `mdbox.toml` under the configuration root,
/// which is typically `/usr/local/etc/mdbox` or `/etc/mdbox`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Configuration for the message storage itself.
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The directory containing the storage files and the map index.
    pub path: PathBuf,

    /// An optional secondary directory that storage files may have been moved
    /// to, typically on slower and cheaper media.
    ///
    /// Files are always created under `path`. When opening a file, `path` is
    /// searched first, then `alt_path`.
    pub alt_path: Option<PathBuf>,

    /// Once a file would grow beyond this many bytes, no more messages are
    /// appended to it.
    pub rotate_size: u64,

    /// Files smaller than this are always considered appendable with respect
    /// to size, even if the new message would push them past `rotate_size`.
    pub rotate_min_size: u64,

    /// Files created before the start of the day `rotate_days - 1` days ago
    /// are not appended to. 0 disables rotation by age.
    pub rotate_days: u32,

    /// A file is only compacted once at least this percentage of its bytes
    /// belong to messages that are no longer referenced.
    ///
    /// 100 disables compaction altogether.
    pub purge_min_percentage: u32,

    /// The global purge heuristic only requests purging once at least this
    /// many bytes are unreferenced...
    pub force_purge_min_bytes: u64,

    /// ... and unreferenced bytes make up at least this fraction of the total.
    pub force_purge_min_ratio: f64,

    /// The maximum number of storage files kept open between operations.
    pub max_open_files: usize,

    /// How long to wait for the map index lock before giving up.
    pub lock_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::new(),
            alt_path: None,
            rotate_size: 2 * 1024 * 1024,
            rotate_min_size: 16 * 1024,
            rotate_days: 1,
            purge_min_percentage: 0,
            force_purge_min_bytes: 10 * 1024 * 1024,
            force_purge_min_ratio: 0.5,
            max_open_files: 64,
            lock_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
