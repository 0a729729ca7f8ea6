/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::ops::Range;

use log::debug;

use crate::le_u32;
use crate::utilities::patching::find_pattern;

/// Process9 sits well past the ARM9 kernel, scanning starts here.
const SEARCH_START: usize = 0x15000;
const NCCH_NAME_MARKER: &[u8] = b"ess9";
const MEDIA_UNIT: u32 = 0x200;

/// Location of the Process9 `.code` inside the ARM9 section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process9 {
    /// Offset of `.code` relative to the start of the ARM9 section.
    pub code_offset: usize,
    pub size: usize,
    /// Address `.code` is mapped at once Process9 runs.
    pub mem_addr: u32,
}

impl Process9 {
    /// Finds the Process9 NCCH by the tail of its `"Process9"` name and derives
    /// the ExeFS `.code` position from the NCCH header fields around it.
    pub fn locate(arm9: &[u8]) -> Option<Self> {
        let marker = find_pattern(arm9, NCCH_NAME_MARKER, SEARCH_START)?;

        let size = le_u32!(arm9, marker.checked_sub(0x60)?)?.checked_mul(MEDIA_UNIT)? as usize;
        let exefs_offset = le_u32!(arm9, marker.checked_sub(0x64)?)?.checked_mul(MEDIA_UNIT)? as usize;
        let mem_addr = le_u32!(arm9, marker + 0xC)?;

        let code_offset = (marker.checked_sub(0x204)? + exefs_offset).checked_add(0x200)?;
        if code_offset.checked_add(size)? > arm9.len() {
            return None;
        }

        debug!("Process9: .code at 0x{code_offset:X}, 0x{size:X} bytes, mapped at 0x{mem_addr:08X}");
        Some(Self { code_offset, size, mem_addr })
    }

    pub fn range(&self) -> Range<usize> {
        self.code_offset..self.code_offset + self.size
    }

    /// Runtime address of the byte at `offset` inside `.code`.
    pub fn va_of(&self, offset: usize) -> u32 {
        self.mem_addr.wrapping_add(offset as u32)
    }
}
