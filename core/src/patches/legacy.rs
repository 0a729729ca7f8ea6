/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info};

use crate::error::Result;
use crate::firm::FirmwareType;
use crate::utilities::patching::{ByteScanner, Replacement};

/// Fixed-offset write into a TWL_FIRM or AGB_FIRM image, O3DS offset first.
#[derive(Debug, Clone, Copy)]
pub struct LegacyPatch {
    pub offsets: [usize; 2],
    pub replacement: Replacement<'static>,
}

const fn lp(o3ds: usize, n3ds: usize, replacement: Replacement<'static>) -> LegacyPatch {
    LegacyPatch { offsets: [o3ds, n3ds], replacement }
}

/// `movs r0, #0; add sp, #0x138; pop {r4-r6, pc}`
const RETURN_ZERO: &[u8] = &[0x00, 0x20, 0x4E, 0xB0, 0x70, 0xBD];

// A `Word` writes the halfword followed by a zeroed one.
pub const TWL_PATCHES: &[LegacyPatch] = &[
    lp(0x1650C0, 0x165D64, Replacement::Bytes(RETURN_ZERO)),
    lp(0x173A0E, 0x17474A, Replacement::Halfword(0x2001)),
    lp(0x174802, 0x17553E, Replacement::Word(0x2000)),
    lp(0x174964, 0x1756A0, Replacement::Word(0x2000)),
    lp(0x174D52, 0x175A8E, Replacement::Word(0x2001)),
    lp(0x174D5E, 0x175A9A, Replacement::Word(0x2001)),
    lp(0x174D6A, 0x175AA6, Replacement::Word(0x2001)),
    lp(0x174E56, 0x175B92, Replacement::Halfword(0x2001)),
    lp(0x174E58, 0x175B94, Replacement::Halfword(0x4770)),
];

/// The boot screen patch has to stay last.
pub const AGB_PATCHES: &[LegacyPatch] = &[
    lp(0x9D2A8, 0x9DF64, Replacement::Bytes(RETURN_ZERO)),
    lp(0xD7A12, 0xD8B8A, Replacement::Halfword(0xEF26)),
];

/// Oldest O3DS title versions the tables match.
pub fn min_o3ds_version(firm_type: FirmwareType) -> u32 {
    match firm_type {
        FirmwareType::Twl => 0x16,
        _ => 0xB,
    }
}

/// Applies the table of `firm_type` to the whole FIRM image. The AGB_FIRM boot
/// screen is only shown when `show_gba_boot` is set.
pub fn apply_legacy_firm_patches(
    firm: &mut [u8],
    firm_type: FirmwareType,
    is_n3ds: bool,
    show_gba_boot: bool,
) -> Result<usize> {
    let patches = match firm_type {
        FirmwareType::Twl => TWL_PATCHES,
        FirmwareType::Agb if show_gba_boot => AGB_PATCHES,
        FirmwareType::Agb => &AGB_PATCHES[..AGB_PATCHES.len() - 1],
        _ => return Ok(0),
    };

    let mut scanner = ByteScanner::new(firm);
    for patch in patches {
        let offset = patch.offsets[usize::from(is_n3ds)];
        scanner.write(offset, 0, &patch.replacement)?;
        debug!("{firm_type}: patched 0x{offset:X}");
    }

    info!("Applied {} {firm_type} patches", patches.len());
    Ok(patches.len())
}
