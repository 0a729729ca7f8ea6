/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use crate::config::{Config, MultiOption, SingleOption};
use crate::error::{Error, Result};
use crate::firm::FirmwareType;
use crate::platform::{ConsoleModel, NandTarget};

/// NAND a boot reads from. The discriminant is the value stored in the boot bits
/// of the configuration word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareSource {
    #[default]
    SysNand = 0,
    EmuNand1 = 1,
    EmuNand2 = 2,
    EmuNand3 = 3,
    EmuNand4 = 4,
}

impl FirmwareSource {
    /// Out of range values read back as SysNAND.
    pub fn from_bits(bits: u32) -> Self {
        Self::from_slot(bits).unwrap_or(FirmwareSource::SysNand)
    }

    /// EmuNAND slot `1..=4`.
    pub fn from_slot(slot: u32) -> Option<Self> {
        match slot {
            1 => Some(FirmwareSource::EmuNand1),
            2 => Some(FirmwareSource::EmuNand2),
            3 => Some(FirmwareSource::EmuNand3),
            4 => Some(FirmwareSource::EmuNand4),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn is_emunand(self) -> bool {
        self != FirmwareSource::SysNand
    }
}

impl fmt::Display for FirmwareSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareSource::SysNand => f.write_str("SysNAND"),
            other => write!(f, "EmuNAND {}", other.bits()),
        }
    }
}

/// Where a detected EmuNAND lives on the SD card, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmuNandLocation {
    /// First sector of the image.
    pub offset: u32,
    /// Sector holding the NCSD header.
    pub header: u32,
}

/// Firmware requested by the previous FIRM through a firmlaunch, `None` on a cold boot.
pub fn detect_relaunch(params: &[u16; 8]) -> Result<Option<FirmwareType>> {
    if params[5] == 0 {
        return Ok(None);
    }

    if params[7] == u16::from(b'3') {
        return Ok(Some(FirmwareType::Safe));
    }

    FirmwareType::from_launch_digit(params[5])
        .filter(|t| !matches!(t, FirmwareType::Safe))
        .map(Some)
        .ok_or_else(|| Error::firmware(format!("Unknown firmlaunch target 0x{:04X}", params[5])))
}

/// Everything decided before the FIRM is loaded. Built once per boot.
#[derive(Debug, Clone)]
pub struct BootContext {
    pub console_model: ConsoleModel,
    pub is_dev_unit: bool,
    pub is_a9lh: bool,
    pub is_relaunch: bool,
    pub nand_source: FirmwareSource,
    pub firm_source: FirmwareSource,
    /// Firmware that was asked for. The image actually loaded may narrow it down.
    pub firm_type: FirmwareType,
    pub config: Config,
    /// Location of the EmuNAND in use, if either source is one.
    pub emunand: Option<EmuNandLocation>,
}

impl BootContext {
    pub fn is_n3ds(&self) -> bool {
        self.console_model.is_n3ds()
    }

    pub fn option(&self, option: SingleOption) -> bool {
        self.config.single(option)
    }

    pub fn multi(&self, option: MultiOption) -> u32 {
        self.config.multi(option)
    }

    /// EmuNAND the running system will be redirected to.
    pub fn nand_redirect(&self) -> Option<EmuNandLocation> {
        self.emunand.filter(|_| self.nand_source.is_emunand())
    }

    /// NAND the FIRM title content is read from.
    pub fn firm_target(&self) -> NandTarget {
        match self.emunand {
            Some(loc) if self.firm_source.is_emunand() => NandTarget::EmuNand { offset: loc.offset },
            _ => NandTarget::SysNand,
        }
    }
}
