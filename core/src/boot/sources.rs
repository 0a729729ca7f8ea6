/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Button driven choices made on a cold boot: which NAND and FIRM to use, and
//! whether a payload is chainloaded instead.

use log::{debug, info};

use crate::boot::context::FirmwareSource;
use crate::config::{Config, ConfigStatus, MultiOption, SingleOption};
use crate::platform::{Storage, buttons};

pub const PAYLOADS_DIR: &str = "/puma/payloads";
/// Room left below the chainloader stub.
pub const MAX_PAYLOAD_SIZE: usize = 0xF_FF00;

/// `CFG_BOOTENV` value left by AGB_FIRM.
pub const BOOTENV_AGB_EXIT: u32 = 7;

/// Holding SELECT without L opens the menu; a missing record always does.
pub fn wants_config_menu(pressed: u32, status: ConfigStatus) -> bool {
    status == ConfigStatus::Create || (pressed & buttons::SELECT != 0 && pressed & buttons::L1 == 0)
}

pub fn wants_payload(pressed: u32) -> bool {
    (pressed & buttons::SINGLE_PAYLOAD != 0 && pressed & (buttons::L1 | buttons::R1) == 0)
        || (pressed & buttons::L_PAYLOAD != 0 && pressed & buttons::L1 != 0)
}

/// File name prefix of the payload bound to the held buttons.
pub fn payload_name(pressed: u32) -> &'static str {
    const ORDER: [(u32, &str); 10] = [
        (buttons::LEFT, "left"),
        (buttons::RIGHT, "right"),
        (buttons::UP, "up"),
        (buttons::DOWN, "down"),
        (buttons::START, "start"),
        (buttons::B, "b"),
        (buttons::X, "x"),
        (buttons::Y, "y"),
        (buttons::R1, "r"),
        (buttons::A, "a"),
    ];

    ORDER.iter().find(|(mask, _)| pressed & mask != 0).map_or("select", |(_, name)| name)
}

/// Reads `/puma/payloads/<name>_*.bin`. An empty or oversized file is ignored and
/// the boot goes on.
pub fn load_payload(storage: &mut dyn Storage, pressed: u32) -> Option<Vec<u8>> {
    let pattern = format!("{}_*.bin", payload_name(pressed));
    let Some(file) = storage.find_first(PAYLOADS_DIR, &pattern) else {
        debug!("No payload matches {pattern}");
        return None;
    };

    let payload = storage.read_file(&format!("{PAYLOADS_DIR}/{file}"), MAX_PAYLOAD_SIZE)?;
    if payload.is_empty() {
        return None;
    }

    info!("Chainloading {file} (0x{:X} bytes)", payload.len());
    Some(payload)
}

/// EmuNAND slot picked by the d-pad, or the configured default.
pub fn emunand_slot(pressed: u32, config: Config) -> FirmwareSource {
    let slot = match pressed & buttons::EMUNAND {
        buttons::UP => 1,
        buttons::RIGHT => 2,
        buttons::DOWN => 3,
        buttons::LEFT => 4,
        _ => 1 + config.multi(MultiOption::DefaultEmu),
    };
    FirmwareSource::from_bits(slot)
}

/// NAND and FIRM sources for a cold boot. R boots the NAND that is not updated
/// with the FIRM of the other one; otherwise L swaps the autoboot choice.
pub fn select_sources(pressed: u32, config: Config, is_a9lh: bool) -> (FirmwareSource, FirmwareSource) {
    let sys_firm_on_r = is_a9lh && config.single(SingleOption::UseSysFirm);

    let (nand_emu, firm_emu) = if pressed & buttons::R1 != 0 {
        (sys_firm_on_r, !sys_firm_on_r)
    } else {
        let emu = config.single(SingleOption::AutobootSys) == (pressed & buttons::L1 != 0);
        (emu, emu)
    };

    let slot = emunand_slot(pressed, config);
    let pick = |emu: bool| if emu { slot } else { FirmwareSource::SysNand };
    (pick(nand_emu), pick(firm_emu))
}

/// Boot options replayed after an MCU reboot instead of asking the user.
/// Returns `None` when the user gets to choose again.
pub fn forced_sources(
    boot_env: u32,
    pressed: u32,
    config: Config,
    status: ConfigStatus,
) -> Option<(FirmwareSource, FirmwareSource)> {
    let last_nand = FirmwareSource::from_bits(config.nand_source());
    let last_firm = FirmwareSource::from_bits(config.firm_source());

    match boot_env {
        0 => None,
        BOOTENV_AGB_EXIT => {
            let firm = if config.single(SingleOption::UseSysFirm) { FirmwareSource::SysNand } else { last_firm };
            Some((FirmwareSource::SysNand, firm))
        }
        _ if status != ConfigStatus::Create && pressed == 0 && !config.no_force_flag() => Some((last_nand, last_firm)),
        _ => None,
    }
}
