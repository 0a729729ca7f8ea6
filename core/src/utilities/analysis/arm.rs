/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::le_u32;
use crate::utilities::arm::{OPCODE_B, OPCODE_BL, decode_branch_target};

/// Backward search window for subroutine prologues.
const PROLOGUE_SEARCH_LIMIT: usize = 0x2000;
/// Upper halfword of `stmfd sp!, {...}`.
const PROLOGUE_MARKER: u32 = 0xE92D;

/// Read-only ARM32 view over a code buffer mapped at `base_addr`.
///
/// Only the handful of encodings needed to follow calls through known firmware
/// layouts are understood. Matches are heuristics and callers should confirm them
/// with a second, independent pattern.
pub struct ArmAnalyzer<'a> {
    data: &'a [u8],
    base_addr: u32,
}

impl<'a> ArmAnalyzer<'a> {
    pub fn new(data: &'a [u8], base_addr: u32) -> Self {
        Self { data, base_addr }
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn base_addr(&self) -> u32 {
        self.base_addr
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        le_u32!(self.data, offset)
    }

    pub fn va_to_offset(&self, va: u32) -> Option<usize> {
        let offset = va.checked_sub(self.base_addr)? as usize;
        if offset >= self.data.len() {
            return None;
        }
        Some(offset)
    }

    pub fn offset_to_va(&self, offset: usize) -> Option<u32> {
        if offset >= self.data.len() {
            return None;
        }
        Some(self.base_addr.wrapping_add(offset as u32))
    }

    fn opcode_at(&self, offset: usize) -> Option<u8> {
        self.read_u32(offset).map(|w| (w >> 24) as u8)
    }

    /// `ldr rd, [pc, #+-imm12]`, returns the destination register and the literal address.
    pub fn decode_ldr_pc(&self, instr: u32, pc: u32) -> Option<(u8, u32)> {
        if (instr & 0x0C5F_0000) != 0x041F_0000 {
            return None;
        }

        let rd = ((instr >> 12) & 0xF) as u8;
        let imm12 = instr & 0xFFF;
        let arm_pc = pc.wrapping_add(8);

        let target = if (instr >> 23) & 1 == 1 {
            arm_pc.wrapping_add(imm12)
        } else {
            arm_pc.wrapping_sub(imm12)
        };

        Some((rd, target))
    }

    /// Value loaded by the `ldr rd, [pc, ...]` located at `offset`.
    pub fn ldr_pc_literal(&self, offset: usize) -> Option<u32> {
        let instr = self.read_u32(offset)?;
        let (_, addr) = self.decode_ldr_pc(instr, self.offset_to_va(offset)?)?;
        self.read_u32(self.va_to_offset(addr)?)
    }

    pub fn is_prologue(&self, instr: u32) -> bool {
        instr >> 16 == PROLOGUE_MARKER
    }

    /// Walks backward from `from_offset` until a `stmfd sp!` is found.
    pub fn find_function_start(&self, from_offset: usize) -> Option<usize> {
        let end = from_offset.saturating_sub(PROLOGUE_SEARCH_LIMIT);
        let mut current = from_offset & !3;

        loop {
            if let Some(instr) = self.read_u32(current)
                && self.is_prologue(instr)
            {
                return Some(current);
            }

            if current < end + 4 {
                return None;
            }
            current -= 4;
        }
    }

    /// Target VA of the `BL` at `offset`, `None` when the word is not an
    /// unconditional `BL`.
    pub fn get_bl_target(&self, offset: usize) -> Option<u32> {
        let instr = self.read_u32(offset)?;
        if (instr >> 24) as u8 != OPCODE_BL {
            return None;
        }
        Some(decode_branch_target(self.offset_to_va(offset)?, instr))
    }

    pub fn get_next_bl_from_off(&self, offset: usize) -> Option<usize> {
        (offset..self.data.len())
            .step_by(4)
            .find(|&off| self.opcode_at(off) == Some(OPCODE_BL))
    }

    /// Follows the `BL` at `call_site` and at most one `B` trampoline after it,
    /// reporting whether control lands inside `[start, end]` (buffer offsets).
    pub fn resolves_into(&self, call_site: usize, start: usize, end: usize) -> bool {
        if self.opcode_at(call_site) != Some(OPCODE_BL) {
            return false;
        }

        let mut current = call_site;
        for _ in 0..2 {
            let Some(instr) = self.read_u32(current) else {
                return false;
            };
            let Some(pc) = self.offset_to_va(current) else {
                return false;
            };
            let Some(target) = self.va_to_offset(decode_branch_target(pc, instr)) else {
                return false;
            };

            if (start..=end).contains(&target) {
                return true;
            }
            if self.opcode_at(target) != Some(OPCODE_B) {
                return false;
            }
            current = target;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::arm::{encode_b_arm, encode_bl_arm};

    const BASE: u32 = 0x0010_0000;

    fn put(data: &mut [u8], off: usize, word: u32) {
        data[off..off + 4].copy_from_slice(&word.to_le_bytes());
    }

    #[test]
    fn finds_prologue_behind_offset() {
        let mut data = vec![0u8; 0x100];
        put(&mut data, 0x20, 0xE92D_4010);
        put(&mut data, 0x80, 0xE92D_4FF0);

        let a = ArmAnalyzer::new(&data, BASE);
        assert_eq!(a.find_function_start(0x60), Some(0x20));
        assert_eq!(a.find_function_start(0x80), Some(0x80));
        assert_eq!(a.find_function_start(0x1C), None);
    }

    #[test]
    fn prologue_search_is_bounded() {
        let mut data = vec![0u8; 0x3000];
        put(&mut data, 0x100, 0xE92D_4010);

        let a = ArmAnalyzer::new(&data, BASE);
        assert_eq!(a.find_function_start(0x2100), Some(0x100));
        assert_eq!(a.find_function_start(0x2104), None);
    }

    #[test]
    fn direct_call_resolves() {
        let mut data = vec![0u8; 0x200];
        put(&mut data, 0x40, encode_bl_arm(BASE + 0x40, BASE + 0x100).unwrap());

        let a = ArmAnalyzer::new(&data, BASE);
        assert_eq!(a.get_bl_target(0x40), Some(BASE + 0x100));
        assert!(a.resolves_into(0x40, 0xF0, 0x110));
        assert!(!a.resolves_into(0x40, 0x104, 0x110));
    }

    #[test]
    fn single_trampoline_is_followed() {
        let mut data = vec![0u8; 0x200];
        put(&mut data, 0x40, encode_bl_arm(BASE + 0x40, BASE + 0x80).unwrap());
        put(&mut data, 0x80, encode_b_arm(BASE + 0x80, BASE + 0x180).unwrap());

        let a = ArmAnalyzer::new(&data, BASE);
        assert!(a.resolves_into(0x40, 0x170, 0x190));
    }

    #[test]
    fn second_trampoline_is_not_followed() {
        let mut data = vec![0u8; 0x200];
        put(&mut data, 0x40, encode_bl_arm(BASE + 0x40, BASE + 0x80).unwrap());
        put(&mut data, 0x80, encode_b_arm(BASE + 0x80, BASE + 0xC0).unwrap());
        put(&mut data, 0xC0, encode_b_arm(BASE + 0xC0, BASE + 0x180).unwrap());

        let a = ArmAnalyzer::new(&data, BASE);
        assert!(!a.resolves_into(0x40, 0x170, 0x190));
        assert!(a.resolves_into(0x40, 0xC0, 0xC0));
    }

    #[test]
    fn non_call_is_rejected() {
        let mut data = vec![0u8; 0x100];
        put(&mut data, 0x10, encode_b_arm(BASE + 0x10, BASE + 0x40).unwrap());

        let a = ArmAnalyzer::new(&data, BASE);
        assert!(!a.resolves_into(0x10, 0, 0xFF));
        assert_eq!(a.get_bl_target(0x10), None);
        assert_eq!(a.get_next_bl_from_off(0), None);
    }

    #[test]
    fn pc_relative_literal() {
        let mut data = vec![0u8; 0x40];
        // ldr r1, [pc, #0x10]
        put(&mut data, 0x08, 0xE59F_1010);
        put(&mut data, 0x20, 0xCAFE_BABE);

        let a = ArmAnalyzer::new(&data, BASE);
        assert_eq!(a.decode_ldr_pc(0xE59F_1010, BASE + 8), Some((1, BASE + 0x20)));
        assert_eq!(a.ldr_pc_literal(0x08), Some(0xCAFE_BABE));
        assert_eq!(a.va_to_offset(BASE - 4), None);
        assert_eq!(a.offset_to_va(0x40), None);
    }
}
