/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Seams to the hardware, the filesystem driver, the crypto engine and the screen.
//! The boot logic only talks to these traits, so it runs unchanged against the
//! real console or against in-memory fakes.

use crate::config::menu::ConfigMenu;
use crate::config::pin::PinPrompt;
use crate::error::Result;

pub mod buttons {
    pub const A: u32 = 1 << 0;
    pub const B: u32 = 1 << 1;
    pub const SELECT: u32 = 1 << 2;
    pub const START: u32 = 1 << 3;
    pub const RIGHT: u32 = 1 << 4;
    pub const LEFT: u32 = 1 << 5;
    pub const UP: u32 = 1 << 6;
    pub const DOWN: u32 = 1 << 7;
    pub const R1: u32 = 1 << 8;
    pub const L1: u32 = 1 << 9;
    pub const X: u32 = 1 << 10;
    pub const Y: u32 = 1 << 11;

    pub const DPAD: u32 = RIGHT | LEFT | UP | DOWN;
    pub const SAFE_MODE: u32 = R1 | L1 | UP | A;
    pub const SINGLE_PAYLOAD: u32 = DPAD | START | B | X | Y;
    pub const L_PAYLOAD: u32 = R1 | A | SELECT;
    pub const PIN: u32 = A | B | X | Y | DPAD | START;
    pub const MENU: u32 = A | DPAD | START;
    pub const EMUNAND: u32 = DPAD;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleModel {
    Old3ds,
    New3ds,
}

impl ConsoleModel {
    pub fn is_n3ds(self) -> bool {
        self == ConsoleModel::New3ds
    }
}

/// Which physical NAND backs CTRNAND while loading the FIRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NandTarget {
    SysNand,
    /// EmuNAND starting `offset` sectors into the SD card.
    EmuNand { offset: u32 },
}

/// Boot-time hardware access.
pub trait Platform {
    fn console_model(&self) -> ConsoleModel;
    fn is_dev_unit(&self) -> bool;
    /// True when booted by the ARM9 bootrom exploit (the SPI controller is left untouched).
    fn is_a9lh(&self) -> bool;
    /// `CFG_BOOTENV`: non zero after an MCU reboot, 7 after leaving AGB_FIRM.
    fn boot_env(&self) -> u32;
    /// The eight launched-title halfwords left behind by a firmlaunch.
    fn launch_params(&self) -> [u16; 8];
    fn held_buttons(&mut self) -> u32;

    fn copy_to_memory(&mut self, address: u32, data: &[u8]);
    fn write_u32(&mut self, address: u32, value: u32);
    fn deinit_screens(&mut self);
    fn flush_caches(&mut self);

    fn jump(&mut self, entry: u32) -> !;
    fn chainload(&mut self, payload: &[u8]) -> !;
    /// Renders a full-screen error and waits for a power cycle.
    fn halt(&mut self, message: &str) -> !;
    fn reboot(&mut self) -> !;
    fn power_off(&mut self) -> !;
}

/// FAT access to the SD card and to the mounted CTRNAND (`1:/` paths).
pub trait Storage {
    /// Whole file contents. `None` when missing or larger than `max_size` (0 means unbounded).
    fn read_file(&mut self, path: &str, max_size: usize) -> Option<Vec<u8>>;
    fn file_size(&mut self, path: &str) -> Option<usize>;
    /// Creates missing parent folders.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()>;
    fn delete_file(&mut self, path: &str);
    /// Names of the entries in `dir`.
    fn list_dir(&mut self, dir: &str) -> Vec<String>;
    /// First entry of `dir` matching a FAT wildcard.
    fn find_first(&mut self, dir: &str, pattern: &str) -> Option<String>;

    /// Raw 512-byte sectors of the SD card.
    fn read_sd_sectors(&mut self, sector: u32, count: u32) -> Option<Vec<u8>>;
    /// Size of the internal NAND in sectors.
    fn nand_sectors(&mut self) -> u32;
    fn mount_ctrnand(&mut self, target: NandTarget) -> Result<()>;
}

/// Work done by the AES engine keyslots.
pub trait Crypto {
    /// Decrypts a FIRM title content in place, leaving the plain FIRM at offset 0.
    fn decrypt_exefs(&mut self, content: &mut Vec<u8>) -> Result<()>;
    /// Decrypts the N3DS ARM9 binary in place.
    fn arm9_loader(&mut self, arm9: &mut [u8]) -> Result<()>;
    /// Installs the 7.x NCCH KeyX and the 6.x savegame KeyY on O3DS.
    fn set_rsa_mod0_keys(&mut self);
    /// Console-unique AES key and CID used to bind the PIN to this unit.
    fn pin_key_material(&mut self) -> ([u8; 16], [u8; 16]);
}

/// Screen and pad, used by the menu, the PIN lock and the splash.
pub trait Interactive {
    /// Blocks until a new button combination is pressed.
    fn wait_input(&mut self) -> u32;
    fn draw_config_menu(&mut self, menu: &ConfigMenu);
    fn draw_pin_prompt(&mut self, prompt: &PinPrompt);
    fn set_brightness(&mut self, level: u32);
    /// Shows `/puma/splash.bin` if present, returning whether it was drawn.
    fn show_splash(&mut self) -> bool;
    /// Waits for every button to be released, then pauses briefly.
    fn settle(&mut self);
}
