/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::borrow::Cow;

use log::{debug, info};

use crate::boot::context::BootContext;
use crate::config::SingleOption;
use crate::error::Result;
use crate::firm::sysmodules::rebuild_section0;
use crate::firm::{FirmImage, FirmwareType, SECTION_COUNT};
use crate::platform::{Platform, Storage};

pub const SYSMODULES_DIR: &str = "/puma/sysmodules";
pub const INJECTED_MODULE: &str = "loader";

/// Where the ARM11 cores pick up their entry point.
pub const ARM11_ENTRY_COLD: u32 = 0x1FFF_FFF8;
pub const ARM11_ENTRY_RELAUNCH: u32 = 0x1FFF_FFFC;

/// Whether section 0 is rebuilt before it is copied.
pub fn rebuilds_section0(firm_type: FirmwareType, ctx: &BootContext) -> bool {
    match firm_type {
        FirmwareType::Native => true,
        FirmwareType::Twl | FirmwareType::Agb => ctx.option(SingleOption::LoadSdFirmsAndModules),
        FirmwareType::Safe | FirmwareType::Native1x2x => false,
    }
}

/// Copies the FIRM sections to their load addresses. On NATIVE_FIRM the `loader`
/// sysmodule is swapped for `injector`; with SD modules enabled any module may be
/// replaced by `/puma/sysmodules/<name>.cxi` (up to twice its size).
pub fn relocate(
    platform: &mut dyn Platform,
    storage: &mut dyn Storage,
    image: &FirmImage,
    firm_type: FirmwareType,
    ctx: &BootContext,
    injector: &[u8],
) -> Result<()> {
    let mut first = 0;

    if rebuilds_section0(firm_type, ctx) && image.section(0).is_present() {
        let sd_modules = ctx.option(SingleOption::LoadSdFirmsAndModules);

        let section0 = rebuild_section0(image.section_data(0)?, |module| {
            if sd_modules
                && let Some(data) = storage
                    .read_file(&format!("{SYSMODULES_DIR}/{}.cxi", module.name), 2 * module.data.len())
                    .filter(|data| !data.is_empty())
            {
                return Some(Cow::Owned(data));
            }

            (firm_type == FirmwareType::Native && module.name == INJECTED_MODULE).then_some(Cow::Borrowed(injector))
        })?;

        platform.copy_to_memory(image.section(0).address, &section0);
        debug!("Section 0 rebuilt: 0x{:X} bytes at 0x{:08X}", section0.len(), image.section(0).address);
        first = 1;
    }

    for index in first..SECTION_COUNT {
        let section = image.section(index);
        if !section.is_present() {
            continue;
        }

        platform.copy_to_memory(section.address, image.section_data(index)?);
        debug!("Section {index}: 0x{:X} bytes at 0x{:08X}", section.size, section.address);
    }

    Ok(())
}

/// Hands the ARM11 entry point over and returns the ARM9 one to jump to.
pub fn prepare_launch(platform: &mut dyn Platform, image: &FirmImage, is_relaunch: bool) -> u32 {
    let vector = if is_relaunch {
        ARM11_ENTRY_RELAUNCH
    } else {
        platform.deinit_screens();
        ARM11_ENTRY_COLD
    };

    platform.write_u32(vector, image.arm11_entry());
    platform.flush_caches();

    info!("Launching: ARM9 0x{:08X}, ARM11 0x{:08X}", image.arm9_entry(), image.arm11_entry());
    image.arm9_entry()
}
