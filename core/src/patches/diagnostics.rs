/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Developer patches: breakpoints on kernel panics and svcBreak, exception vectors
//! left to the installed handlers, UNITINFO, and the access check removals.

use log::{debug, warn};

use crate::boot::context::BootContext;
use crate::config::{DevOptions, SingleOption};
use crate::error::Result;
use crate::firm::{FirmImage, Kernel11, Process9};
use crate::patches::{apply_set, process9_code};
use crate::utilities::arm::{ARM_BKPT_FFFE, ARM_BKPT_FFFF, ARM_NOP, encode_bl_arm};
use crate::utilities::patching::{Directive, Replacement, find_pattern, patch, read_u32, write_u32};

const UNITINFO_PATTERN: &[u8] = &[0x01, 0x10, 0xA0, 0x13];

const HANDLERS_INSTALL_PATTERN: &[u8] = &[0x03, 0xA0, 0xE3, 0x18];
const HANDLERS_INSTALL_SKIP: usize = 0x13;
/// `mov r1, #0x40` ends the vector setup.
const HANDLERS_INSTALL_END: u32 = 0xE3A0_1040;
const ARM9_VECTORS_BASE: u32 = 0x0800_0000;
const ARM9_IRQ_VECTOR: u32 = 0x0800_0004;
const ARM9_SVC_VECTOR: u32 = 0x0800_0014;

const ARM9_SVC_HANDLER_PATTERN: &[u8] = &[0x00, 0xE0, 0x4F, 0xE1]; // mrs lr, spsr
const SVC_BREAK: usize = 0x3C;

const KERNEL9_PANIC: &[Directive<'static>] =
    &[Directive::new(&[0xFF, 0xEA, 0x04, 0xD0], -0x12, Replacement::Word(ARM_BKPT_FFFE))];
const KERNEL11_PANIC: &[Directive<'static>] =
    &[Directive::new(&[0x02, 0x0B, 0x44, 0xE2], 0, Replacement::Word(ARM_BKPT_FFFE))];
// mov r0, #1; bx lr
const P9_ACCESS_CHECKS: &[Directive<'static>] =
    &[Directive::new(&[0xE0, 0x00, 0x40, 0x39], -14, Replacement::Bytes(&[0x01, 0x20, 0x70, 0x47]))];

const SVC_ACCESS_CHECK: u32 = 0xE11A_0E1B; // tst r10, r11, lsl lr
const SVC_ACCESS_GRANTED: u32 = 0xE3B0_A001; // movs r10, #1
const K11_MODULES_PATTERN: &[u8] = &[0xE5, 0x48, 0x00, 0x9D];
const K11_MODULES_BACKTRACK: usize = 0xB;

/// Forces the UNITINFO value Kernel9 hands to the ARM11 side.
pub fn patch_unit_info_value_set(arm9: &mut [u8], is_dev_unit: bool) -> Result<bool> {
    let Some(off) = find_pattern(arm9, UNITINFO_PATTERN, 0) else {
        warn!("UNITINFO setter not found, skipping");
        return Ok(false);
    };

    patch(arm9, off, &[if is_dev_unit { 0 } else { 1 }])?;
    patch(arm9, off + 3, &[0xE3])?;
    Ok(true)
}

/// Rewrites Kernel9's vector table setup so only the IRQ and SVC vectors are
/// replaced, leaving the others to the exception handlers already installed.
pub fn patch_arm9_exception_handlers_install(arm9: &mut [u8]) -> Result<bool> {
    let Some(start) = find_pattern(arm9, HANDLERS_INSTALL_PATTERN, 0).map(|p| p + HANDLERS_INSTALL_SKIP) else {
        warn!("ARM9 exception vector setup not found, skipping");
        return Ok(false);
    };

    let mut rewrites = Vec::new();
    let mut r0 = ARM9_VECTORS_BASE;
    let mut off = start;

    loop {
        let Some(instr) = read_u32(arm9, off) else {
            warn!("ARM9 exception vector setup has no end, skipping");
            return Ok(false);
        };
        if instr == HANDLERS_INSTALL_END {
            break;
        }

        // str rX, [r0, #imm](!) and its post-indexed form
        if instr & 0xFE5F_0000 == 0xE400_0000 {
            let rd = (instr >> 12) & 0xF;
            let imm = instr & 0xFFF;
            let offset = if (instr >> 23) & 1 == 0 { imm.wrapping_neg() } else { imm };
            let writeback = (instr >> 21) & 1 != 0;
            let pre = (instr >> 24) & 1 != 0;

            let mut addr = r0.wrapping_add(if pre || !writeback { offset } else { 0 });
            let new = if addr & 7 != 0 && addr != ARM9_SVC_VECTOR && addr != ARM9_IRQ_VECTOR {
                ARM_NOP
            } else {
                0xE580_0000 | (rd << 12) | (addr & 0xFFF)
            };
            rewrites.push((off, new));

            if !pre {
                addr = addr.wrapping_add(offset);
            }
            if writeback {
                r0 = addr;
            }
        }

        off += 4;
    }

    for &(at, word) in &rewrites {
        write_u32(arm9, at, word)?;
    }
    debug!("Rewrote {} ARM9 vector stores", rewrites.len());
    Ok(true)
}

/// Replaces the svcBreak handler of Kernel9 with `bkpt 0xFFFF`.
pub fn patch_svc_break9(arm9: &mut [u8], kernel9_address: u32) -> Result<bool> {
    let Some(handler) = find_pattern(arm9, ARM9_SVC_HANDLER_PATTERN, 0) else {
        warn!("Kernel9 SVC handler not found, skipping");
        return Ok(false);
    };

    let Some(table) = (handler..arm9.len()).step_by(4).find(|&off| read_u32(arm9, off) == Some(0)) else {
        warn!("Kernel9 SVC table not found, skipping");
        return Ok(false);
    };

    let Some(target) = read_u32(arm9, table + SVC_BREAK * 4)
        .and_then(|va| va.checked_sub(kernel9_address))
        .map(|off| off as usize)
    else {
        warn!("Kernel9 svcBreak lies outside the ARM9 section, skipping");
        return Ok(false);
    };

    write_u32(arm9, target, ARM_BKPT_FFFF)?;
    Ok(true)
}

pub fn patch_kernel9_panic(arm9: &mut [u8]) -> Result<bool> {
    apply_set(arm9, "Kernel9 panic", KERNEL9_PANIC)
}

/// Replaces svcBreak of Kernel11 with `bkpt 0xFFFF`.
pub fn patch_svc_break11(section: &mut [u8], kernel11: &Kernel11) -> Result<bool> {
    let Some(target) = kernel11.svc_entry(section, SVC_BREAK).and_then(|va| kernel11.offset_of(va)) else {
        warn!("Kernel11 svcBreak not found, skipping");
        return Ok(false);
    };

    write_u32(section, target, ARM_BKPT_FFFF)?;
    Ok(true)
}

pub fn patch_kernel11_panic(section: &mut [u8]) -> Result<bool> {
    apply_set(section, "Kernel11 panic", KERNEL11_PANIC)
}

/// Makes every Process9 access check succeed.
pub fn patch_p9_access_checks(code: &mut [u8]) -> Result<bool> {
    apply_set(code, "Process9 access checks", P9_ACCESS_CHECKS)
}

/// Lets every process call every SVC.
pub fn patch_arm11_svc_access_checks(section: &mut [u8], kernel11: &Kernel11) -> Result<bool> {
    let Some(off) = (kernel11.svc_handler..section.len())
        .step_by(4)
        .find(|&off| read_u32(section, off) == Some(SVC_ACCESS_CHECK))
    else {
        warn!("Kernel11 SVC access check not found, skipping");
        return Ok(false);
    };

    write_u32(section, off, SVC_ACCESS_GRANTED)?;
    Ok(true)
}

/// Detours the decompression of built-in modules through the injected blob so their
/// checks can be removed once they are unpacked.
pub fn patch_k11_module_checks(section: &mut [u8], kernel11: &mut Kernel11, blob: &[u8]) -> Result<bool> {
    let Some(call) = find_pattern(section, K11_MODULES_PATTERN, 0).and_then(|p| p.checked_sub(K11_MODULES_BACKTRACK))
    else {
        warn!("Kernel11 module decompression call not found, skipping");
        return Ok(false);
    };

    let Some(at) = kernel11.free_space.inject(section, blob)? else {
        warn!("Not enough Kernel11 free space for the module checks hook");
        return Ok(false);
    };

    write_u32(section, call, encode_bl_arm(call as u32, at as u32)?)?;
    Ok(true)
}

/// Diagnostic patches for NATIVE_FIRM. The ARM9 section is slot 2.
pub fn patch_native_firm(
    image: &mut FirmImage,
    process9: &Process9,
    mut kernel11: Option<&mut Kernel11>,
    ctx: &BootContext,
    k11_modules: &[u8],
) -> Result<()> {
    let dev = ctx.config.dev_options();
    let kernel9_address = image.section(2).address;

    if dev == DevOptions::UnitInfo {
        patch_unit_info_value_set(image.section_data_mut(2)?, ctx.is_dev_unit)?;
    }

    if ctx.is_a9lh && dev != DevOptions::Off {
        let arm9 = image.section_data_mut(2)?;
        patch_arm9_exception_handlers_install(arm9)?;
        patch_svc_break9(arm9, kernel9_address)?;
        patch_kernel9_panic(arm9)?;

        let section1 = image.section_data_mut(1)?;
        if let Some(kernel11) = kernel11.as_deref_mut() {
            patch_svc_break11(section1, kernel11)?;
        }
        patch_kernel11_panic(section1)?;
    }

    if ctx.option(SingleOption::PatchAccess) {
        if let Some(kernel11) = kernel11.as_deref_mut() {
            let section1 = image.section_data_mut(1)?;
            patch_arm11_svc_access_checks(section1, kernel11)?;
            patch_k11_module_checks(section1, kernel11, k11_modules)?;
        }
        patch_p9_access_checks(process9_code(image, process9)?)?;
    }

    Ok(())
}

/// Diagnostic patches for SAFE_FIRM and 1.x/2.x NATIVE_FIRM.
pub fn patch_safe_firm(image: &mut FirmImage, ctx: &BootContext) -> Result<()> {
    if ctx.config.dev_options() == DevOptions::Off {
        return Ok(());
    }

    let kernel9_address = image.section(2).address;
    let arm9 = image.section_data_mut(2)?;
    patch_arm9_exception_handlers_install(arm9)?;
    patch_svc_break9(arm9, kernel9_address)?;
    Ok(())
}

/// Diagnostic patches for TWL_FIRM and AGB_FIRM, whose ARM9 section is slot 3.
pub fn patch_legacy_firm(image: &mut FirmImage, ctx: &BootContext) -> Result<()> {
    if ctx.config.dev_options() == DevOptions::UnitInfo {
        patch_unit_info_value_set(image.section_data_mut(3)?, ctx.is_dev_unit)?;
    }
    Ok(())
}
