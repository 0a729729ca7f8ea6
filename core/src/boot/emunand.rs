/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info, warn};

use crate::boot::context::{EmuNandLocation, FirmwareSource};
use crate::platform::Storage;

pub const NCSD_MAGIC: &[u8; 4] = b"NCSD";
const NCSD_MAGIC_OFFSET: usize = 0x100;
/// NANDs bigger than this many sectors get 4 GiB slots.
const SMALL_NAND_SECTORS: u32 = 0x20_0000;

/// Distance in sectors between two EmuNAND slots.
pub fn slot_size(nand_sectors: u32) -> u32 {
    if nand_sectors > SMALL_NAND_SECTORS { 0x40_0000 } else { 0x20_0000 }
}

fn has_ncsd(storage: &mut dyn Storage, sector: u32) -> bool {
    storage
        .read_sd_sectors(sector, 1)
        .is_some_and(|data| data.get(NCSD_MAGIC_OFFSET..NCSD_MAGIC_OFFSET + 4) == Some(NCSD_MAGIC.as_slice()))
}

/// Probes a single slot. RedNAND keeps the header right after the slot start,
/// Gateway layouts keep it past the end of the image.
pub fn probe_slot(storage: &mut dyn Storage, slot: u32, nand_sectors: u32) -> Option<EmuNandLocation> {
    let offset = slot.checked_sub(1)?.checked_mul(slot_size(nand_sectors))?;

    if has_ncsd(storage, offset + 1) {
        debug!("RedNAND found in slot {slot}");
        return Some(EmuNandLocation { offset: offset + 1, header: offset + 1 });
    }

    let header = offset.checked_add(nand_sectors)?;
    if has_ncsd(storage, header) {
        debug!("Gateway EmuNAND found in slot {slot}");
        return Some(EmuNandLocation { offset, header });
    }

    None
}

/// Finds the EmuNAND `requested` points to. A missing slot falls back to the
/// first one, then to SysNAND.
pub fn locate_emunand(storage: &mut dyn Storage, requested: FirmwareSource) -> (FirmwareSource, Option<EmuNandLocation>) {
    if !requested.is_emunand() {
        return (requested, None);
    }

    let nand_sectors = storage.nand_sectors();

    if let Some(location) = probe_slot(storage, requested.bits(), nand_sectors) {
        info!("Using {requested} at sector 0x{:X}", location.offset);
        return (requested, Some(location));
    }

    if requested != FirmwareSource::EmuNand1 {
        warn!("{requested} not found, trying the first EmuNAND");
        return locate_emunand(storage, FirmwareSource::EmuNand1);
    }

    warn!("No EmuNAND found, falling back to SysNAND");
    (FirmwareSource::SysNand, None)
}
