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

//! Constants from `sysexits.h`, and the mapping from storage errors onto them.
//!
//! The delivery agents that drive `mdbox save` treat `EX_TEMPFAIL` as "try
//! again later" and everything else as a permanent failure.

use crate::support::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// Choose the exit code that best describes a failed storage operation.
    pub fn for_error(error: &Error) -> Self {
        match *error {
            Error::LockTimeout => EX_TEMPFAIL,
            Error::NxMessage => EX_NOINPUT,
            Error::StorageNotFound => EX_CONFIG,
            Error::TooManyCopies | Error::MessageTooLarge => EX_DATAERR,
            Error::MapCorrupted(..) | Error::FileCorrupted { .. } => {
                EX_SOFTWARE
            }
            Error::BatchFailed => EX_SOFTWARE,
            Error::Io(..) | Error::Nix(..) | Error::Cbor(..) => EX_IOERR,
        }
    }
}
