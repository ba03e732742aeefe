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

//! The storage engine.
//!
//! Messages live in shared, append-only storage files (`file`). The map
//! index (`map`) records where each message lives and how many mailbox
//! entries reference it. New messages are written in batches (`append`,
//! `save`) and dead ones are reclaimed by compaction (`purge`).

pub mod append;
pub mod file;
pub mod file_cache;
pub mod map;
pub mod metadata;
pub mod purge;
pub mod record_log;
pub mod save;
pub mod storage;
