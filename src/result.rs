// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Every failure mode the file system can report.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    NotInitialized,
    Checksum,
    InternalRange,
    /// An illegal free-space bitmap transition was requested. Indicates
    /// on-flash corruption or a caller bug.
    InternalAllocation,
    NoMoreSpace,
    NoMoreEntry,
    NoMoreResource,
    FileNotFound,
    FileAlreadyExists,
    IsDirectory,
    IsNotDirectory,
    DirectoryNotEmpty,
    InvalidFileName,
    InvalidOpenMode,
    SeekNotPossible,
    EndOfFile,
    FlashRead,
    FlashWrite,
    FlashErase,
    /// The proposed bytes are not programmable over the current page
    /// contents; the caller must route the write through a delta page.
    NotProgrammable,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "file system is not initialized",
            Self::Checksum => "checksum mismatch",
            Self::InternalRange => "address or index out of range (internal)",
            Self::InternalAllocation => {
                "illegal free-space bitmap transition (internal)"
            }
            Self::NoMoreSpace => "no free pages remain",
            Self::NoMoreEntry => "entry list is full",
            Self::NoMoreResource => "no free file or directory handles",
            Self::FileNotFound => "no such file or directory",
            Self::FileAlreadyExists => "file already exists",
            Self::IsDirectory => "is a directory",
            Self::IsNotDirectory => "is not a directory",
            Self::DirectoryNotEmpty => "directory not empty",
            Self::InvalidFileName => "invalid file name",
            Self::InvalidOpenMode => "invalid open mode",
            Self::SeekNotPossible => "seek not possible",
            Self::EndOfFile => "end of file",
            Self::FlashRead => "flash read error",
            Self::FlashWrite => "flash write error",
            Self::FlashErase => "flash erase error",
            Self::NotProgrammable => "page is not programmable in place",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
