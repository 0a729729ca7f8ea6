/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Redirection of the NAND driver in Process9 to an image on the SD card.

use log::{info, warn};

use crate::boot::context::EmuNandLocation;
use crate::error::{Error, Result};
use crate::firm::Process9;
use crate::utilities::patching::{find_filler, find_pattern, find_pattern_in, patch, read_u32, write_u32};

const SDMMC_PATTERN: &[u8] = &[0x21, 0x20, 0x18, 0x20];
const NAND_RW_PATTERN: &[u8] = &[0x1E, 0x00, 0xC8, 0x05];
const NAND_RW_BACKTRACK: usize = 6;
const WRITE_SEARCH_WINDOW: usize = 0x100;
const MPU_PATTERN: &[u8] = &[0x03, 0x00, 0x24, 0x00];

const OFFSET_MARKER: &[u8] = b"NAND";
const HEADER_MARKER: &[u8] = b"NCSD";
const SDMMC_MARKER: &[u8] = b"SDMC";

/// `ldr r4, [pc]; blx r4`, followed by the literal.
const NAND_HOOK: [u8; 4] = [0x00, 0x4C, 0xA0, 0x47];
/// Word index and value of each relaxed MPU region.
const MPU_REGIONS: [(usize, u32); 3] = [(0, 0x0036_0003), (6, 0x0020_0603), (9, 0x001C_0603)];

/// Address of the SDMMC driver state, summed from two literals after its setup code.
fn sdmmc_address(code: &[u8]) -> Option<u32> {
    let off = find_pattern(code, SDMMC_PATTERN, 0)?;
    Some(read_u32(code, off + 9)?.wrapping_add(read_u32(code, off + 0xD)?))
}

/// Hook sites of the NAND read and write calls, relative to the Process9 code.
fn nand_rw_sites(code: &[u8]) -> Option<(usize, usize)> {
    let read_match = find_pattern(code, NAND_RW_PATTERN, 0)?;
    let read = read_match.checked_sub(NAND_RW_BACKTRACK)?;

    let from = read + 10;
    let write_match = find_pattern_in(code, NAND_RW_PATTERN, from..from + WRITE_SEARCH_WINDOW)?;
    Some((read, write_match.checked_sub(NAND_RW_BACKTRACK)?))
}

/// Places the redirection blob in ARM9 padding and reroutes Process9's NAND accesses
/// into it. Nothing is written unless every site and the padding are found.
pub fn patch_emunand(
    arm9: &mut [u8],
    arm9_address: u32,
    process9: &Process9,
    location: EmuNandLocation,
    blob: &[u8],
) -> Result<bool> {
    let code_range = process9.range();
    let code = arm9
        .get(code_range.clone())
        .ok_or_else(|| Error::firmware("Process9 lies outside the ARM9 section"))?;

    let Some(sdmmc) = sdmmc_address(code) else {
        warn!("EmuNAND: SDMMC structure not found, skipping");
        return Ok(false);
    };
    let Some((read_site, write_site)) = nand_rw_sites(code) else {
        warn!("EmuNAND: NAND read/write calls not found, skipping");
        return Ok(false);
    };
    let Some(mpu) = find_pattern(arm9, MPU_PATTERN, 0) else {
        warn!("EmuNAND: MPU setup not found, skipping");
        return Ok(false);
    };
    let Some(free) = find_filler(arm9, 0, blob.len(), 0xFF) else {
        warn!("EmuNAND: no free space for 0x{:X} bytes of redirection code", blob.len());
        return Ok(false);
    };

    let mut hook = blob.to_vec();
    for (marker, value) in [(OFFSET_MARKER, location.offset), (HEADER_MARKER, location.header), (SDMMC_MARKER, sdmmc)] {
        let at = find_pattern(&hook, marker, 0).ok_or_else(|| {
            Error::puma(format!("EmuNAND payload has no {} marker", String::from_utf8_lossy(marker)))
        })?;
        write_u32(&mut hook, at, value)?;
    }
    patch(arm9, free, &hook)?;

    let hook_va = arm9_address.wrapping_add(free as u32);
    for (site, target) in [(read_site, hook_va), (write_site, hook_va + 4)] {
        let at = code_range.start + site;
        patch(arm9, at, &NAND_HOOK)?;
        write_u32(arm9, at + NAND_HOOK.len(), target)?;
    }

    for (word, value) in MPU_REGIONS {
        write_u32(arm9, mpu + word * 4, value)?;
    }

    info!(
        "EmuNAND redirection at 0x{hook_va:08X} (offset 0x{:X}, header 0x{:X})",
        location.offset, location.header
    );
    Ok(true)
}
