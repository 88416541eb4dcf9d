// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A log-structured file system for small raw NOR-flash devices.
//!
//! Two management blocks (or, per [`config::Geometry::management_blocks`],
//! two equal-sized groups of blocks) hold alternating generations of a
//! header, entry list, free-space bitmap, delta map and wear-level list;
//! every other block is plain file data. Writes that can't be programmed
//! in place redirect through the delta map instead of erasing; a merge
//! rebuilds the whole management area into the other generation,
//! reclaiming released pages and coalescing every file's map into fresh
//! contiguous runs.
//!
//! [`fs::FileSystem`] is the entry point: [`fs::FileSystem::format`] or
//! [`fs::FileSystem::mount`] over a [`driver::FlashDriver`] implementation,
//! then `open`/`read`/`write`/`seek`/`close`, directory operations, and
//! `merge`/`static_wear_level` for reclamation and wear management.

#![cfg_attr(not(test), no_std)]

mod address;
mod cache;
mod checksum;
mod config;
mod delta;
mod dir;
mod driver;
mod entry;
mod file;
mod fs;
mod fsbm;
mod layout;
mod map;
mod merge;
mod result;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
mod wear;

pub use address::Address;
pub use checksum::{Additive, Checksum};
pub use config::{Config, Geometry};
pub use dir::DirEntry;
pub use driver::FlashDriver;
pub use file::OpenMode;
pub use fs::{FileSystem, OpenOptions, SeekFrom};
pub use result::{Error, Result};
