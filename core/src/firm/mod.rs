/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod kernel11;
pub mod process9;
pub mod sysmodules;

use std::fmt;
use std::ops::Range;

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::le_u32;

pub use kernel11::{FreeSpace, Kernel11};
pub use process9::Process9;

pub const FIRM_MAGIC: &[u8; 4] = b"FIRM";
pub const FIRM_HEADER_SIZE: usize = 0x100;
/// Capacity of the staging region a FIRM is loaded and patched in.
pub const STAGING_SIZE: usize = 0x40_0000;
pub const SECTION_COUNT: usize = 4;

const SECTION_TABLE_OFFSET: usize = 0x40;
const SECTION_HEADER_SIZE: usize = 0x30;
const ARM11_ENTRY_OFFSET: usize = 0x08;
const ARM9_ENTRY_OFFSET: usize = 0x0C;

/// Which FIRM title is being booted. The discriminant is the index used for the
/// NAND title folders and the SD replacement file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    Native = 0,
    Twl = 1,
    Agb = 2,
    Safe = 3,
    /// O3DS NATIVE_FIRM older than 3.0, booted without section 0 injection.
    Native1x2x = 4,
}

impl FirmwareType {
    /// Maps the launch parameter digit (`'0'..'2'`) to a firmware type.
    pub fn from_launch_digit(digit: u16) -> Option<Self> {
        match digit.checked_sub(u16::from(b'0'))? {
            0 => Some(FirmwareType::Native),
            1 => Some(FirmwareType::Twl),
            2 => Some(FirmwareType::Agb),
            3 => Some(FirmwareType::Safe),
            _ => None,
        }
    }

    /// Index of the NAND title / SD file this type is loaded from.
    pub fn title_index(self) -> usize {
        match self {
            FirmwareType::Native1x2x => 0,
            other => other as usize,
        }
    }

    pub fn sd_path(self) -> &'static str {
        const FILES: [&str; 4] = [
            "/puma/firmware.bin",
            "/puma/firmware_twl.bin",
            "/puma/firmware_agb.bin",
            "/puma/firmware_safe.bin",
        ];
        FILES[self.title_index()]
    }

    pub fn is_legacy(self) -> bool {
        matches!(self, FirmwareType::Twl | FirmwareType::Agb)
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FirmwareType::Native => "NATIVE_FIRM",
            FirmwareType::Twl => "TWL_FIRM",
            FirmwareType::Agb => "AGB_FIRM",
            FirmwareType::Safe => "SAFE_FIRM",
            FirmwareType::Native1x2x => "NATIVE_FIRM (1.x/2.x)",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmSection {
    /// Offset of the section inside the image.
    pub offset: u32,
    /// Physical address the section is copied to before launch.
    pub address: u32,
    pub size: u32,
    pub proc_type: u32,
    pub hash: [u8; 0x20],
}

impl FirmSection {
    fn parse(raw: &[u8]) -> Option<Self> {
        let mut hash = [0u8; 0x20];
        hash.copy_from_slice(raw.get(0x10..0x30)?);

        Some(Self {
            offset: le_u32!(raw, 0x00)?,
            address: le_u32!(raw, 0x04)?,
            size: le_u32!(raw, 0x08)?,
            proc_type: le_u32!(raw, 0x0C)?,
            hash,
        })
    }

    /// A zero sized slot carries no section.
    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmHeader {
    pub arm11_entry: u32,
    pub arm9_entry: u32,
    pub sections: [FirmSection; SECTION_COUNT],
}

impl FirmHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIRM_HEADER_SIZE {
            return Err(Error::firmware("FIRM image is smaller than its header"));
        }
        if &data[..4] != FIRM_MAGIC {
            return Err(Error::firmware("Missing FIRM magic"));
        }

        let mut sections = [FirmSection::default(); SECTION_COUNT];
        for (i, section) in sections.iter_mut().enumerate() {
            let start = SECTION_TABLE_OFFSET + i * SECTION_HEADER_SIZE;
            *section = FirmSection::parse(&data[start..start + SECTION_HEADER_SIZE])
                .ok_or_else(|| Error::firmware("Truncated FIRM section header"))?;
        }

        Ok(Self {
            arm11_entry: le_u32!(data, ARM11_ENTRY_OFFSET).unwrap_or_default(),
            arm9_entry: le_u32!(data, ARM9_ENTRY_OFFSET).unwrap_or_default(),
            sections,
        })
    }

    /// Index of the section holding the ARM9 binary: legacy FIRMs carry it in slot 3.
    pub fn arm9_index(&self) -> usize {
        if self.sections[3].offset != 0 { 3 } else { 2 }
    }

    pub fn arm9_address(&self) -> u32 {
        self.sections[self.arm9_index()].address
    }
}

/// A FIRM loaded in the staging buffer together with its parsed header.
///
/// The header is parsed once at load time. Entry point changes are mirrored back
/// into the raw bytes so the two never disagree.
pub struct FirmImage {
    header: FirmHeader,
    data: Vec<u8>,
}

impl FirmImage {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() > STAGING_SIZE {
            return Err(Error::firmware(format!(
                "FIRM image of 0x{:X} bytes does not fit the staging buffer",
                data.len()
            )));
        }

        let header = FirmHeader::parse(&data)?;

        for (i, section) in header.sections.iter().enumerate().filter(|(_, s)| s.is_present()) {
            if section.range().end > data.len() {
                return Err(Error::firmware(format!("FIRM section {i} lies outside the image")));
            }
        }

        debug!(
            "FIRM: arm11 entry 0x{:08X}, arm9 entry 0x{:08X}",
            header.arm11_entry, header.arm9_entry
        );

        Ok(Self { header, data })
    }

    pub fn header(&self) -> &FirmHeader {
        &self.header
    }

    pub fn section(&self, index: usize) -> &FirmSection {
        &self.header.sections[index]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whole image for fixed-offset patches. The header is not parsed again, so
    /// writes must stay past [`FIRM_HEADER_SIZE`].
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn section_data(&self, index: usize) -> Result<&[u8]> {
        let section = self.header.sections.get(index).ok_or_else(|| Error::puma("No such FIRM section"))?;
        self.data
            .get(section.range())
            .ok_or_else(|| Error::firmware(format!("FIRM section {index} lies outside the image")))
    }

    pub fn section_data_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let section = self.header.sections.get(index).ok_or_else(|| Error::puma("No such FIRM section"))?;
        self.data
            .get_mut(section.range())
            .ok_or_else(|| Error::firmware(format!("FIRM section {index} lies outside the image")))
    }

    pub fn arm9_entry(&self) -> u32 {
        self.header.arm9_entry
    }

    pub fn arm11_entry(&self) -> u32 {
        self.header.arm11_entry
    }

    pub fn set_arm9_entry(&mut self, entry: u32) {
        self.header.arm9_entry = entry;
        self.data[ARM9_ENTRY_OFFSET..ARM9_ENTRY_OFFSET + 4].copy_from_slice(&entry.to_le_bytes());
    }

    /// Checks every present section against the SHA-256 stored in the header.
    pub fn verify_hashes(&self) -> bool {
        self.header.sections.iter().enumerate().filter(|(_, s)| s.is_present()).all(|(i, s)| {
            let digest = Sha256::digest(&self.data[s.range()]);
            let ok = digest.as_slice() == s.hash.as_slice();
            if !ok {
                warn!("FIRM section {i} hash mismatch");
            }
            ok
        })
    }
}

/// A staged FIRM together with what is known about where it came from.
pub struct LoadedFirm {
    pub image: FirmImage,
    pub firm_type: FirmwareType,
    /// Title content version, [`VERSION_UNKNOWN`] for images read from the SD card.
    pub version: u32,
}

pub const VERSION_UNKNOWN: u32 = 0xFFFF_FFFF;
