/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

use crate::error::{Error, Result};
use crate::utilities::patching::patch;

pub const ARM_NOP: u32 = 0xE1A0_0000; // mov r0, r0
pub const ARM_BX_LR: u32 = 0xE12F_FF1E;
pub const ARM_MOV_R0_IMM: u32 = 0xE3A0_0000;
pub const ARM_MOVS_R0_0: u32 = 0xE3B0_0000;
pub const ARM_BKPT_FFFF: u32 = 0xE12F_FF7F;
pub const ARM_BKPT_FFFE: u32 = 0xE12F_FF7E;

pub const THUMB_MOVS_R0_0: u16 = 0x2000;
pub const THUMB_MOVS_R0_1: u16 = 0x2001;
pub const THUMB_BX_LR: u16 = 0x4770;
pub const THUMB_NOP: u16 = 0x46C0; // mov r8, r8

/// Top byte of an unconditional ARM `BL`.
pub const OPCODE_BL: u8 = 0xEB;
/// Top byte of an unconditional ARM `B`.
pub const OPCODE_B: u8 = 0xEA;

/// Resolves the destination of an ARM `B`/`BL` located at `address`.
/// The 24-bit immediate is a signed word offset relative to the instruction
/// address plus 8 (prefetch).
pub fn decode_branch_target(address: u32, word: u32) -> u32 {
    let low24 = (word & 0x00FF_FFFF) << 2;
    let sign = (low24 >> 25).wrapping_neg() & 0xFC00_0000;
    let offset = (low24 | sign).wrapping_add(8);

    address.wrapping_add(offset)
}

fn branch_imm24(src: u32, dst: u32) -> Result<u32> {
    let off = dst as i64 - (src as i64 + 8);

    if !(-(1 << 25)..=((1 << 25) - 4)).contains(&off) {
        return Err(Error::puma("Branch target out of range"));
    }
    if off & 3 != 0 {
        return Err(Error::puma("Branch target is not word aligned"));
    }

    Ok((off >> 2) as u32 & 0x00FF_FFFF)
}

pub fn encode_bl_arm(src: u32, dst: u32) -> Result<u32> {
    Ok(0xEB00_0000u32 | branch_imm24(src, dst)?)
}

pub fn encode_b_arm(src: u32, dst: u32) -> Result<u32> {
    Ok(0xEA00_0000u32 | branch_imm24(src, dst)?)
}

/// `mov r0, #imm` for immediates that fit in 8 bits.
pub fn mov_r0_imm(value: u8) -> u32 {
    ARM_MOV_R0_IMM | value as u32
}

/// Overwrites the function at `off` with `mov r0, #value; bx lr`.
pub fn force_return(data: &mut [u8], off: usize, value: u32, thumb_mode: bool) -> Result<()> {
    if thumb_mode {
        let mov_r0 = 0x2000u16 | ((value & 0xFF) as u16);

        let mut stub = [0u8; 4];
        stub[..2].copy_from_slice(&mov_r0.to_le_bytes());
        stub[2..].copy_from_slice(&THUMB_BX_LR.to_le_bytes());
        return patch(data, off, &stub);
    }

    let mov_r0 = ARM_MOV_R0_IMM | (value & 0xFF);

    let mut stub = [0u8; 8];
    stub[..4].copy_from_slice(&mov_r0.to_le_bytes());
    stub[4..].copy_from_slice(&ARM_BX_LR.to_le_bytes());
    patch(data, off, &stub)
}
