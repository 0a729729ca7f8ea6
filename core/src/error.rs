/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Generic failure inside the loader or patcher.
    #[error("{0}")]
    Puma(String),
    /// A persisted record could not be read or written.
    #[error("I/O error: {0}")]
    Io(String),
    /// The firmware image failed a revision or layout sanity check.
    #[error("{0}")]
    Firmware(String),
    /// A read or write would leave the bounds of the buffer it targets.
    #[error("Access of 0x{len:X} bytes at {offset} is outside a buffer of 0x{size:X} bytes")]
    OutOfBounds { offset: isize, len: usize, size: usize },
    #[error("Invalid patch directive: {0}")]
    InvalidDirective(&'static str),
    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl Error {
    pub fn puma(msg: impl Into<String>) -> Self {
        Error::Puma(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    pub fn firmware(msg: impl Into<String>) -> Self {
        Error::Firmware(msg.into())
    }

    pub fn out_of_bounds(offset: isize, len: usize, size: usize) -> Self {
        Error::OutOfBounds { offset, len, size }
    }
}
