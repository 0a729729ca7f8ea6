/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod menu;
pub mod pin;

use std::fmt;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::platform::Storage;
use crate::{le_u16, le_u32};

pub const CONFIG_PATH: &str = "/puma/config.bin";
pub const CONFIG_MAGIC: &[u8; 4] = b"CONF";
pub const CONFIG_VERSION_MAJOR: u16 = 11;
pub const CONFIG_VERSION_MINOR: u16 = 0;
pub const CONFIG_RECORD_SIZE: usize = 12;

/// Bits 0..9 hold the last boot selection, everything above are user options.
pub const BOOT_BITS_MASK: u32 = 0x1FF;
pub const NO_FORCE_FLAG: u32 = 1 << 7;
pub const SAFE_MODE_FLAG: u32 = 1 << 8;
const A9LH_SHIFT: u32 = 6;

const MULTI_BASE: u32 = 9;
const SINGLE_BASE: u32 = 21;

/// Options with up to four choices, two bits each starting at bit 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiOption {
    DefaultEmu = 0,
    Brightness,
    Splash,
    Pin,
    NewCpu,
    DevOptions,
}

impl MultiOption {
    pub const ALL: [MultiOption; 6] = [
        MultiOption::DefaultEmu,
        MultiOption::Brightness,
        MultiOption::Splash,
        MultiOption::Pin,
        MultiOption::NewCpu,
        MultiOption::DevOptions,
    ];

    /// Number of selectable values.
    pub fn choices(self) -> u32 {
        match self {
            MultiOption::Splash | MultiOption::DevOptions => 3,
            _ => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MultiOption::DefaultEmu => "Default EmuNAND: 1( ) 2( ) 3( ) 4( )",
            MultiOption::Brightness => "Screen brightness: 4( ) 3( ) 2( ) 1( )",
            MultiOption::Splash => "Splash: Off( ) Before( ) After( ) payloads",
            MultiOption::Pin => "PIN lock: Off( ) 4( ) 6( ) 8( ) digits",
            MultiOption::NewCpu => "New 3DS CPU: Off( ) Clock( ) L2( ) Clock+L2( )",
            MultiOption::DevOptions => "Dev. features: ErrDisp( ) UNITINFO( ) Off( )",
        }
    }
}

/// On/off options, one bit each starting at bit 21.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleOption {
    AutobootSys = 0,
    UseSysFirm,
    LoadSdFirmsAndModules,
    UseCustomPath,
    UseLangEmuAndCode,
    PatchVerString,
    ShowGbaBoot,
    PatchAccess,
    RegionFree,
    PreventUpdates,
    SecureInfo,
    TestMenu,
}

impl SingleOption {
    pub const ALL: [SingleOption; 12] = [
        SingleOption::AutobootSys,
        SingleOption::UseSysFirm,
        SingleOption::LoadSdFirmsAndModules,
        SingleOption::UseCustomPath,
        SingleOption::UseLangEmuAndCode,
        SingleOption::PatchVerString,
        SingleOption::ShowGbaBoot,
        SingleOption::PatchAccess,
        SingleOption::RegionFree,
        SingleOption::PreventUpdates,
        SingleOption::SecureInfo,
        SingleOption::TestMenu,
    ];

    /// Mask of the option inside the config word. The last option would land on
    /// bit 32 and therefore has none: it always reads as disabled.
    pub fn bit(self) -> Option<u32> {
        1u32.checked_shl(SINGLE_BASE + self as u32)
    }

    pub fn label(self) -> &'static str {
        match self {
            SingleOption::AutobootSys => "( ) Autoboot SysNAND",
            SingleOption::UseSysFirm => "( ) Use SysNAND FIRM if booting with R (A9LH)",
            SingleOption::LoadSdFirmsAndModules => "( ) Enable FIRMs and modules loading from SD",
            SingleOption::UseCustomPath => "( ) Use custom path",
            SingleOption::UseLangEmuAndCode => "( ) Enable region/language emu. and ext. .code",
            SingleOption::PatchVerString => "( ) Show NAND or user string in System Settings",
            SingleOption::ShowGbaBoot => "( ) Show GBA boot screen in patched AGB_FIRM",
            SingleOption::PatchAccess => "( ) Patch SVC/service/archive/ARM9 access",
            SingleOption::RegionFree => "( ) Region free Home",
            SingleOption::PreventUpdates => "( ) Block auto/mandatory updates",
            SingleOption::SecureInfo => "( ) SecureInfo_C and unsigned SI_A support",
            SingleOption::TestMenu => "( ) Force TestMenu instead of Home",
        }
    }
}

/// Developer feature level stored in [`MultiOption::DevOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevOptions {
    /// Exception handlers plus the ErrDisp UNITINFO patches.
    ErrDisp,
    /// Exception handlers plus a forced UNITINFO value.
    UnitInfo,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplashMode {
    Off,
    BeforePayloads,
    AfterPayloads,
}

/// The 32-bit configuration word shared by the boot stage and the process patcher.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Config(u32);

impl Config {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn nand_source(self) -> u32 {
        self.0 & 7
    }

    pub fn firm_source(self) -> u32 {
        (self.0 >> 3) & 7
    }

    pub fn a9lh(self) -> bool {
        (self.0 >> A9LH_SHIFT) & 1 != 0
    }

    pub fn no_force_flag(self) -> bool {
        self.0 & NO_FORCE_FLAG != 0
    }

    pub fn safe_mode(self) -> bool {
        self.0 & SAFE_MODE_FLAG != 0
    }

    pub fn multi(self, option: MultiOption) -> u32 {
        (self.0 >> (MULTI_BASE + 2 * option as u32)) & 3
    }

    pub fn set_multi(&mut self, option: MultiOption, value: u32) {
        let shift = MULTI_BASE + 2 * option as u32;
        self.0 = (self.0 & !(3 << shift)) | ((value & 3) << shift);
    }

    pub fn single(self, option: SingleOption) -> bool {
        option.bit().is_some_and(|bit| self.0 & bit != 0)
    }

    /// Options without a bit in the word are left untouched.
    pub fn set_single(&mut self, option: SingleOption, enabled: bool) {
        let Some(bit) = option.bit() else {
            return;
        };
        if enabled {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn dev_options(self) -> DevOptions {
        match self.multi(MultiOption::DevOptions) {
            0 => DevOptions::ErrDisp,
            1 => DevOptions::UnitInfo,
            _ => DevOptions::Off,
        }
    }

    pub fn splash(self) -> SplashMode {
        match self.multi(MultiOption::Splash) {
            0 => SplashMode::Off,
            1 => SplashMode::BeforePayloads,
            _ => SplashMode::AfterPayloads,
        }
    }

    /// PIN length selected by the PIN option, `None` when the lock is off.
    pub fn pin_length(self) -> Option<u8> {
        match self.multi(MultiOption::Pin) {
            0 => None,
            mode => Some(4 + 2 * (mode as u8 - 1)),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Config(0x{:08X})", self.0)
    }
}

/// How the record on the SD card relates to the configuration in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    /// Boot options were forced, the menu is never offered.
    DontConfigure,
    Modify,
    /// No valid record exists yet.
    Create,
}

pub fn parse_record(bytes: &[u8]) -> Option<Config> {
    if bytes.len() != CONFIG_RECORD_SIZE
        || &bytes[..4] != CONFIG_MAGIC
        || le_u16!(bytes, 4)? != CONFIG_VERSION_MAJOR
        || le_u16!(bytes, 6)? != CONFIG_VERSION_MINOR
    {
        return None;
    }

    le_u32!(bytes, 8).map(Config::from_raw)
}

pub fn serialize_record(config: Config) -> [u8; CONFIG_RECORD_SIZE] {
    let mut out = [0u8; CONFIG_RECORD_SIZE];
    out[..4].copy_from_slice(CONFIG_MAGIC);
    out[4..6].copy_from_slice(&CONFIG_VERSION_MAJOR.to_le_bytes());
    out[6..8].copy_from_slice(&CONFIG_VERSION_MINOR.to_le_bytes());
    out[8..].copy_from_slice(&config.raw().to_le_bytes());
    out
}

/// Loads the persisted record. A missing or stale record yields a zeroed config in
/// create mode instead of an error.
pub fn read_config(storage: &mut dyn Storage) -> (Config, ConfigStatus) {
    let Some(bytes) = storage.read_file(CONFIG_PATH, CONFIG_RECORD_SIZE) else {
        info!("No configuration found, a new one will be created");
        return (Config::default(), ConfigStatus::Create);
    };

    match parse_record(&bytes) {
        Some(config) => (config, ConfigStatus::Modify),
        None => {
            warn!("Configuration record is invalid or outdated, resetting");
            (Config::default(), ConfigStatus::Create)
        }
    }
}

/// Folds the boot selection in `temp` into `stored`. Returns `None` when nothing
/// needs writing; a change of the no-force flag alone does not count.
pub fn merge_boot_bits(stored: Config, temp: u32, status: ConfigStatus) -> Option<Config> {
    if status != ConfigStatus::Create && temp & !NO_FORCE_FLAG == stored.raw() {
        return None;
    }

    Some(Config::from_raw((stored.raw() & !BOOT_BITS_MASK) | (temp & BOOT_BITS_MASK)))
}

/// Writes the merged record if it changed. Failure to write is fatal for the boot.
pub fn write_config(storage: &mut dyn Storage, stored: Config, temp: u32, status: ConfigStatus) -> Result<Config> {
    let Some(merged) = merge_boot_bits(stored, temp, status) else {
        return Ok(stored);
    };

    storage
        .write_file(CONFIG_PATH, &serialize_record(merged))
        .map_err(|_| Error::io("Error writing the configuration file"))?;

    info!("Saved configuration {merged:?}");
    Ok(merged)
}
