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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Map index corrupted: {0}")]
    MapCorrupted(String),
    #[error("{} corrupted: {reason}", path.display())]
    FileCorrupted { path: PathBuf, reason: String },
    #[error("Timed out waiting for the map index lock")]
    LockTimeout,
    #[error("Message has been copied too many times")]
    TooManyCopies,
    #[error("Non-existent message")]
    NxMessage,
    #[error("Storage does not exist")]
    StorageNotFound,
    #[error("Append batch already failed")]
    BatchFailed,
    #[error("Message or file too large")]
    MessageTooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}

impl Error {
    /// Whether this error indicates that on-disk structures are broken, as
    /// opposed to a transient or resource failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            *self,
            Error::MapCorrupted(..) | Error::FileCorrupted { .. }
        )
    }
}
