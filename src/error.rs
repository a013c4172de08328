// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Stable numeric classes shared by every engine.
///
/// The values are part of the public contract and never change between
/// releases; tooling stores them in status output and snapshot headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    NoImpl = 1,
    Invalid = 2,
    NoFile = 3,
    NoPerm = 4,
    Broken = 5,
    DupRec = 6,
    NoRec = 7,
    Logic = 8,
    System = 9,
    Misc = 15,
}

impl ErrorCode {
    /// Short name used in status maps and log lines.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::NoImpl => "not implemented",
            ErrorCode::Invalid => "invalid operation",
            ErrorCode::NoFile => "file not found",
            ErrorCode::NoPerm => "no permission",
            ErrorCode::Broken => "broken file",
            ErrorCode::DupRec => "record duplication",
            ErrorCode::NoRec => "no record",
            ErrorCode::Logic => "logical inconsistency",
            ErrorCode::System => "system error",
            ErrorCode::Misc => "miscellaneous error",
        }
    }
}

/// Database error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not implemented: {0}")]
    NoImpl(&'static str),
    #[error("invalid operation: {0}")]
    Invalid(&'static str),
    #[error("file not found: {0}")]
    NoFile(String),
    #[error("no permission: {0}")]
    NoPerm(&'static str),
    #[error("broken file: {0}")]
    Broken(String),
    #[error("record duplication")]
    DupRec,
    #[error("no record")]
    NoRec,
    #[error("logical inconsistency: {0}")]
    Logic(&'static str),
    #[error("system error: {0}")]
    System(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Misc(String),
}

impl Error {
    /// The numeric class of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoImpl(_) => ErrorCode::NoImpl,
            Error::Invalid(_) => ErrorCode::Invalid,
            Error::NoFile(_) => ErrorCode::NoFile,
            Error::NoPerm(_) => ErrorCode::NoPerm,
            Error::Broken(_) => ErrorCode::Broken,
            Error::DupRec => ErrorCode::DupRec,
            Error::NoRec => ErrorCode::NoRec,
            Error::Logic(_) => ErrorCode::Logic,
            Error::System(_) | Error::Io(_) => ErrorCode::System,
            Error::Misc(_) => ErrorCode::Misc,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

/// Alias for results produced by database operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Success as u8, 0);
        assert_eq!(ErrorCode::Broken as u8, 5);
        assert_eq!(ErrorCode::NoRec as u8, 7);
        assert_eq!(ErrorCode::Misc as u8, 15);
    }

    #[test]
    fn io_errors_are_system_class() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), ErrorCode::System);
    }
}
