/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Per-title region and language emulation. The title's calls into `cfg:u` are
//! located from the code itself and replaced with the configured values.

use log::{debug, warn};

use crate::error::Result;
use crate::utilities::analysis::ArmAnalyzer;
use crate::utilities::arm::{ARM_MOVS_R0_0, OPCODE_BL, mov_r0_imm};
use crate::utilities::patching::{read_u16, read_u32, write_u32};

pub const REGIONS: [&str; 7] = ["JPN", "USA", "EUR", "AUS", "CHN", "KOR", "TWN"];
pub const LANGUAGES: [&str; 12] = ["JP", "EN", "FR", "DE", "IT", "ES", "ZH", "KO", "NL", "PT", "RU", "TW"];
pub const LOCALE_FILE_SIZE: usize = 6;

/// Error code stored next to the `cfg:u` handle.
const CFG_ERROR_CODE: u32 = 0xD8A1_03F9;
const MAX_HANDLE_CANDIDATES: usize = 24;
const HANDLE_MAX: u32 = 0x1000_0000;
/// `ldmfd sp!, {r4, pc}` followed by the `GetConfigInfoBlk2` command header.
const GET_CONFIG_BLK2_TAIL: [u32; 2] = [0xE8BD_8010, 0x0001_0082];
const LANGUAGE_BLOCK_ID: u32 = 0x000A_0002;
const CALL_SEARCH_RANGE: usize = 0x1000;
const SECURE_INFO_GET_REGION: [u32; 3] = [0xEE1D_4F70, 0xE3A0_0802, 0xE5A4_0080];
const LDR_PC_HIGH: u16 = 0xE59F;

const STRB_R0_SP: u32 = 0xE5CD_0000;
const STRB_R0_R4_8: u32 = 0xE5C4_0008;
const STR_R0_R4_4: u32 = 0xE584_0004;

/// Region and language ids selected by a locale file such as `"EUR IT"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Locale {
    pub region: Option<u8>,
    pub language: Option<u8>,
}

impl Locale {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() != LOCALE_FILE_SIZE {
            return None;
        }

        let region = REGIONS.iter().position(|r| raw[..3] == *r.as_bytes()).map(|i| i as u8);
        let language = LANGUAGES.iter().position(|l| raw[4..6] == *l.as_bytes()).map(|i| i as u8);
        Some(Self { region, language })
    }
}

/// End of the `CFGU_GetConfigInfoBlk2` implementation that uses the title's own
/// `cfg:u` handle, and that handle's address.
pub fn find_cfg_offsets(code: &[u8]) -> Option<(usize, u32)> {
    let mut candidates = Vec::with_capacity(MAX_HANDLE_CANDIDATES);

    let mut pos = 4;
    while candidates.len() < MAX_HANDLE_CANDIDATES && pos + 4 < code.len() {
        if read_u32(code, pos) == Some(CFG_ERROR_CODE) {
            let around = pos.saturating_sub(16)..pos + 16;
            for word in around.step_by(4).filter_map(|off| read_u32(code, off)) {
                if candidates.len() < MAX_HANDLE_CANDIDATES && word <= HANDLE_MAX {
                    candidates.push(word);
                }
            }
        }
        pos += 4;
    }

    let mut end = 0;
    while end + 8 < code.len() {
        if read_u32(code, end) == Some(GET_CONFIG_BLK2_TAIL[0]) && read_u32(code, end + 4) == Some(GET_CONFIG_BLK2_TAIL[1])
        {
            let handle = read_u32(code, end + 8)?;
            if candidates.contains(&handle) {
                debug!("cfg:u handle 0x{handle:08X}, GetConfigInfoBlk2 ends at 0x{end:X}");
                return Some((end, handle));
            }
            end += 4;
        }
        end += 4;
    }

    None
}

/// Replaces the `GetConfigInfoBlk2` call that reads the language block with a
/// store of `language`.
pub fn patch_cfg_get_language(code: &mut [u8], language: u8, blk2_end: usize) -> Result<bool> {
    let analyzer = ArmAnalyzer::new(code, 0);
    let Some(start) = blk2_end.checked_sub(4).and_then(|from| analyzer.find_function_start(from)) else {
        warn!("GetConfigInfoBlk2 has no prologue, skipping language emulation");
        return Ok(false);
    };

    let mut call_site = None;
    'blocks: for block in (0..code.len()).step_by(4) {
        if analyzer.read_u32(block) != Some(LANGUAGE_BLOCK_ID) {
            continue;
        }

        let lowest = block.saturating_sub(CALL_SEARCH_RANGE + 8).max(4);
        let mut instr = match block.checked_sub(8) {
            Some(instr) => instr,
            None => continue,
        };

        while instr >= lowest {
            if code.get(instr + 3) == Some(&OPCODE_BL) && analyzer.resolves_into(instr, start.saturating_sub(4), blk2_end) {
                call_site = Some(instr);
                break 'blocks;
            }
            instr -= 4;
        }
    }

    let Some(instr) = call_site else {
        warn!("No call reading the language block, skipping language emulation");
        return Ok(false);
    };

    write_u32(code, instr - 4, mov_r0_imm(language))?;
    write_u32(code, instr, STRB_R0_SP)?;
    write_u32(code, instr + 4, ARM_MOVS_R0_0)?;
    debug!("Language forced to {} at 0x{instr:X}", language);
    Ok(true)
}

/// Makes `SecureInfoGetRegion` answer `region` without asking the `cfg` service.
pub fn patch_cfg_get_region(code: &mut [u8], region: u8, handle: u32) -> Result<bool> {
    let analyzer = ArmAnalyzer::new(code, 0);

    let found = (0..code.len().saturating_sub(28)).step_by(4).find(|&cmd| {
        SECURE_INFO_GET_REGION.iter().enumerate().all(|(i, &w)| analyzer.read_u32(cmd + i * 4) == Some(w))
            && read_u16(code, cmd + 14) == Some(LDR_PC_HIGH)
            && analyzer.ldr_pc_literal(cmd + 12) == Some(handle)
    });

    let Some(cmd) = found else {
        warn!("SecureInfoGetRegion not found, skipping region emulation");
        return Ok(false);
    };

    for (i, word) in [mov_r0_imm(region), STRB_R0_R4_8, ARM_MOVS_R0_0, STR_R0_R4_4].into_iter().enumerate() {
        write_u32(code, cmd + 16 + i * 4, word)?;
    }
    debug!("Region forced to {} at 0x{cmd:X}", region);
    Ok(true)
}
