/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::config::Config;

pub const CAPABILITY_MAGIC: &[u8; 4] = b"LUMA";
pub const CAPABILITY_SIZE: usize = 16;

/// Identity of the running build, baked in by the binary embedding this crate.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo<'a> {
    /// Tag the build was made from, `vX.Y` or `vX.Y.Z` for releases.
    pub revision: &'a str,
    pub commit_hash: u32,
}

/// Record returned by the installed `svcGetCFWInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub version_major: u8,
    pub version_minor: u8,
    pub version_build: u8,
    pub flags: u8,
    pub commit_hash: u32,
    pub config: u32,
}

impl CapabilityInfo {
    pub const FLAG_RELEASE: u8 = 1;

    /// Anything after the version digits (a `-N-gHASH` suffix) marks a development build.
    pub fn new(build: &BuildInfo, config: Config) -> Self {
        let rev = build.revision.as_bytes();
        let digit = |i: usize| rev.get(i).map_or(0, |c| c.wrapping_sub(b'0'));

        let (version_build, is_release) = if rev.get(4) == Some(&b'.') {
            (digit(5), rev.len() == 6)
        } else {
            (0, rev.len() == 4)
        };

        Self {
            version_major: digit(1),
            version_minor: digit(3),
            version_build,
            flags: if is_release { Self::FLAG_RELEASE } else { 0 },
            commit_hash: build.commit_hash,
            config: config.raw(),
        }
    }

    pub fn is_release(&self) -> bool {
        self.flags & Self::FLAG_RELEASE != 0
    }

    /// Parses a record as written by `svcGetCFWInfo`.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < CAPABILITY_SIZE || &raw[..4] != CAPABILITY_MAGIC {
            return None;
        }

        Some(Self {
            version_major: raw[4],
            version_minor: raw[5],
            version_build: raw[6],
            flags: raw[7],
            commit_hash: le_u32!(raw, 8)?,
            config: le_u32!(raw, 12)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; CAPABILITY_SIZE] {
        let mut out = [0u8; CAPABILITY_SIZE];
        out[..4].copy_from_slice(CAPABILITY_MAGIC);
        out[4] = self.version_major;
        out[5] = self.version_minor;
        out[6] = self.version_build;
        out[7] = self.flags;
        out[8..12].copy_from_slice(&self.commit_hash.to_le_bytes());
        out[12..16].copy_from_slice(&self.config.to_le_bytes());
        out
    }
}
