/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::iter::once;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::firm::Kernel11;
use crate::patches::apply_set;
use crate::patches::capability::{CAPABILITY_MAGIC, CapabilityInfo};
use crate::platform::Storage;
use crate::utilities::arm::THUMB_MOVS_R0_0;
use crate::utilities::patching::{Directive, Replacement, find_pattern, find_pattern_in, patch, read_u32, write_u32};

pub const CUSTOM_PATH_FILE: &str = "/puma/path.txt";

pub const SVC_GET_CFW_INFO: usize = 0x2E;
pub const SVC_BACKDOOR: usize = 0x7B;

const SIGNATURE_CHECKS: &[Directive<'static>] = &[
    Directive::new(&[0xC0, 0x1C, 0x76, 0xE7], 0, Replacement::Halfword(THUMB_MOVS_R0_0)),
    // movs r0, #0; bx lr
    Directive::new(&[0xB5, 0x22, 0x4D, 0x0C], -1, Replacement::Bytes(&[0x00, 0x20, 0x70, 0x47])),
];

const TITLE_INSTALL_MIN_VERSION: &[Directive<'static>] =
    &[Directive::new(&[0x0A, 0x81, 0x42, 0x02], 4, Replacement::Bytes(&[0xE0]))];

const OLD_FIRM_WRITES: &[Directive<'static>] =
    &[Directive::new(&[0x04, 0x1E, 0x1D, 0xDB], 0, Replacement::Bytes(&[0x00, 0x24, 0x1D, 0xE0]))];

const FIRM_WRITES_ANCHOR: &[u8] = b"exe:";
const FIRM_WRITES_PATTERN: &[u8] = &[0x00, 0x28, 0x01, 0xDA];
const FIRM_WRITES_WINDOW: usize = 0x100;

const FIRMLAUNCH_PATTERN: &[u8] = &[0xE2, 0x20, 0x20, 0x90];
const FIRMLAUNCH_BACKTRACK: usize = 0x13;
const FOPEN_MARKER: &[u8] = b"OPEN";
const PATH_MARKER: &[u8] = b"s\0d\0";
const PATH_MARKER_SKIP: usize = 0xA;

/// Stock svcBackdoor, removed from Kernel11 in 11.0.
const SVC_BACKDOOR_CODE: [u8; 40] = [
    0xFF, 0x10, 0xCD, 0xE3, // bic   r1, sp, #0xff
    0x0F, 0x1C, 0x81, 0xE3, // orr   r1, r1, #0xf00
    0x28, 0x10, 0x81, 0xE2, // add   r1, r1, #0x28
    0x00, 0x20, 0x91, 0xE5, // ldr   r2, [r1]
    0x00, 0x60, 0x22, 0xE9, // stmdb r2!, {sp, lr}
    0x02, 0xD0, 0xA0, 0xE1, // mov   sp, r2
    0x30, 0xFF, 0x2F, 0xE1, // blx   r0
    0x03, 0x00, 0xBD, 0xE8, // pop   {r0, r1}
    0x00, 0xD0, 0xA0, 0xE1, // mov   sp, r0
    0x11, 0xFF, 0x2F, 0xE1, // bx    r1
];

/// Makes Process9 accept any RSA signature.
pub fn patch_signature_checks(code: &mut [u8]) -> Result<bool> {
    apply_set(code, "signature checks", SIGNATURE_CHECKS)
}

/// Lets titles older than the installed ones be installed.
pub fn patch_title_install_min_version_check(code: &mut [u8]) -> Result<bool> {
    apply_set(code, "title install minimum version check", TITLE_INSTALL_MIN_VERSION)
}

/// Stops Process9 from overwriting FIRM0/1, which would remove the bootrom exploit.
pub fn patch_firm_writes(code: &mut [u8]) -> Result<bool> {
    let Some(anchor) = find_pattern(code, FIRM_WRITES_ANCHOR, 0) else {
        warn!("FIRM writes: \"exe:\" not found, skipping");
        return Ok(false);
    };

    let window = anchor.saturating_sub(FIRM_WRITES_WINDOW)..anchor;
    let Some(off) = find_pattern_in(code, FIRM_WRITES_PATTERN, window) else {
        warn!("FIRM writes: check not found before 0x{anchor:X}, skipping");
        return Ok(false);
    };

    // movs r0, #0; nop
    patch(code, off, &[0x00, 0x20, 0xC0, 0x46])?;
    debug!("Patched FIRM writes at 0x{off:X}");
    Ok(true)
}

/// Same protection for the 1.x/2.x layout.
pub fn patch_old_firm_writes(code: &mut [u8]) -> Result<bool> {
    apply_set(code, "old FIRM writes", OLD_FIRM_WRITES)
}

/// Reads the alternative payload path for the reboot hook. The file holds an SD path
/// such as `/payloads/boot.bin`, optionally followed by a line break.
pub fn read_custom_path(storage: &mut dyn Storage) -> Option<Vec<u16>> {
    let size = storage.file_size(CUSTOM_PATH_FILE)?;
    if !(6..58).contains(&size) {
        warn!("{CUSTOM_PATH_FILE} has an invalid size ({size} bytes), ignoring");
        return None;
    }

    let raw = storage.read_file(CUSTOM_PATH_FILE, size)?;
    let path = parse_custom_path(&raw);
    if path.is_none() {
        warn!("{CUSTOM_PATH_FILE} does not hold a valid .bin path, ignoring");
    }
    path
}

pub fn parse_custom_path(raw: &[u8]) -> Option<Vec<u16>> {
    let mut path = raw;
    if let Some(rest) = path.strip_suffix(b"\n") {
        path = rest;
    }
    if let Some(rest) = path.strip_suffix(b"\r") {
        path = rest;
    }

    if !(6..56).contains(&path.len()) || !path.starts_with(b"/") || !path.ends_with(b".bin") {
        return None;
    }

    Some(path.iter().map(|&c| u16::from(c)).collect())
}

/// Replaces the firmlaunch routine of Process9 with the reboot hook so the next
/// FIRM is loaded through this boot chain again.
///
/// The hook calls Process9's own `fopen`, whose address is recovered from the
/// `blx` that starts the original routine.
pub fn patch_firmlaunches(code: &mut [u8], mem_addr: u32, reboot: &[u8], custom_path: Option<&[u16]>) -> Result<bool> {
    let Some(off) = find_pattern(code, FIRMLAUNCH_PATTERN, 0).and_then(|pos| pos.checked_sub(FIRMLAUNCH_BACKTRACK))
    else {
        warn!("Firmlaunch routine not found, skipping");
        return Ok(false);
    };

    let blx = read_u32(code, off).ok_or_else(|| Error::out_of_bounds(off as isize, 4, code.len()))?;
    let back = ((blx & 0x00FF_FFFF) << 2).wrapping_neg() & 0x03FF_FFFC;
    let fopen = (off as u32 + 9).wrapping_sub(back).wrapping_add(mem_addr);

    let mut hook = reboot.to_vec();
    let marker = find_pattern(&hook, FOPEN_MARKER, 0).ok_or_else(|| Error::puma("Reboot payload has no OPEN marker"))?;
    write_u32(&mut hook, marker, fopen)?;

    if let Some(path) = custom_path {
        let at = find_pattern(&hook, PATH_MARKER, 0)
            .map(|pos| pos + PATH_MARKER_SKIP)
            .ok_or_else(|| Error::puma("Reboot payload has no payload path"))?;
        let wide: Vec<u8> = path.iter().chain(once(&0)).flat_map(|c| c.to_le_bytes()).collect();
        patch(&mut hook, at, &wide)?;
        info!("Reboot payload path set to {}", String::from_utf16_lossy(path));
    }

    patch(code, off, &hook)?;
    debug!("Firmlaunch hook at 0x{off:X}, fopen at 0x{fopen:08X}");
    Ok(true)
}

/// Restores svcBackdoor when its slot has been emptied.
pub fn reimplement_svc_backdoor(section: &mut [u8], kernel11: &mut Kernel11) -> Result<bool> {
    match kernel11.svc_entry(section, SVC_BACKDOOR) {
        Some(0) => Ok(kernel11.install_svc(section, SVC_BACKDOOR, &SVC_BACKDOOR_CODE)?.is_some()),
        Some(_) => {
            debug!("svcBackdoor is still present");
            Ok(false)
        }
        None => Err(Error::firmware("Kernel11 SVC table is truncated")),
    }
}

/// Installs `svcGetCFWInfo` with `info` embedded at the blob's `LUMA` marker.
pub fn implement_svc_get_cfw_info(
    section: &mut [u8],
    kernel11: &mut Kernel11,
    blob: &[u8],
    info: &CapabilityInfo,
) -> Result<bool> {
    let mut code = blob.to_vec();
    let marker = find_pattern(&code, CAPABILITY_MAGIC, 0)
        .ok_or_else(|| Error::puma("svcGetCFWInfo payload has no LUMA marker"))?;
    patch(&mut code, marker, &info.to_bytes())?;

    Ok(kernel11.install_svc(section, SVC_GET_CFW_INFO, &code)?.is_some())
}
