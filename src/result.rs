// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Various errors
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    Io,
    Full,
    NotFound,
    NoFilesystem,
    Corrupt,
    NotMounted,
    Mounted,
    NameTooLong,
    BadHandle,
    Busy,
    Unsupported,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "Flash I/O failure",
            Self::Full => "No free block available",
            Self::NotFound => "No such file",
            Self::NoFilesystem => "No file system found on flash",
            Self::Corrupt => "Unrecognized block type on flash",
            Self::NotMounted => "File system not mounted",
            Self::Mounted => "File system already mounted",
            Self::NameTooLong => "File name too long",
            Self::BadHandle => "File handle is not open",
            Self::Busy => "File is busy",
            Self::Unsupported => "Operation not supported",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
