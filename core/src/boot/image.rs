/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info, warn};

use crate::boot::context::BootContext;
use crate::config::SingleOption;
use crate::error::{Error, Result};
use crate::firm::{FirmImage, FirmwareType, LoadedFirm, STAGING_SIZE, VERSION_UNKNOWN};
use crate::platform::{Crypto, Storage};

pub const NAND_TITLE_DIR: &str = "1:/title/00040138";

/// Content folders of the FIRM titles, O3DS then N3DS.
const FIRM_FOLDERS: [[&str; 2]; 4] = [
    ["00000002", "20000002"],
    ["00000102", "20000102"],
    ["00000202", "20000202"],
    ["00000003", "20000003"],
];

/// ARM9 section address of a NATIVE_FIRM built for each model.
pub const O3DS_ARM9_ADDRESS: u32 = 0x0800_6800;
pub const N3DS_ARM9_ADDRESS: u32 = 0x0800_6000;

/// Oldest O3DS NATIVE_FIRM with section 0 injection (3.0).
pub const MIN_NATIVE_VERSION: u32 = 0x18;
/// Oldest O3DS NATIVE_FIRM that boots without a replacement (5.0).
pub const MIN_BOOTABLE_NATIVE_VERSION: u32 = 0x25;

pub const OLD_EMUNAND_MSG: &str = "An old unsupported EmuNAND has been detected.\nPuma33DS is unable to boot it";
pub const SAFE_MODE_1X2X_MSG: &str = "SAFE_MODE is not supported on 1.x/2.x FIRM";
pub const OLD_FIRM_MSG: &str = "An old unsupported FIRM has been detected.\nCopy a valid firmware.bin in /puma to boot";
pub const NO_VALID_FIRM_MSG: &str = "No valid FIRM image could be loaded";

pub fn content_dir(firm_type: FirmwareType, is_n3ds: bool) -> String {
    format!("{NAND_TITLE_DIR}/{}/content", FIRM_FOLDERS[firm_type.title_index()][usize::from(is_n3ds)])
}

/// Version encoded in a content file name like `00000049.app`.
pub fn content_version(name: &str) -> Option<u32> {
    if !name.as_bytes().get(9).is_some_and(|c| c.eq_ignore_ascii_case(&b'A')) {
        return None;
    }

    let (stem, _) = name.split_once('.')?;
    u32::from_str_radix(stem, 16).ok()
}

/// Oldest FIRM content installed for `firm_type`, with its version.
pub fn find_firm_content(storage: &mut dyn Storage, firm_type: FirmwareType, is_n3ds: bool) -> Option<(String, u32)> {
    let dir = content_dir(firm_type, is_n3ds);
    let version = storage.list_dir(&dir).iter().filter_map(|name| content_version(name)).min()?;

    Some((format!("{dir}/{version:08X}.app"), version))
}

/// SD replacement for `firm_type`, accepted only when it targets this console
/// and its sections are intact.
pub fn load_sd_firm(storage: &mut dyn Storage, firm_type: FirmwareType, is_n3ds: bool) -> Option<FirmImage> {
    let path = firm_type.sd_path();
    let data = storage.read_file(path, STAGING_SIZE)?;

    let image = match FirmImage::from_bytes(data) {
        Ok(image) => image,
        Err(e) => {
            warn!("{path}: {e}");
            return None;
        }
    };

    let expected = if is_n3ds { N3DS_ARM9_ADDRESS } else { O3DS_ARM9_ADDRESS };
    if image.header().arm9_address() != expected {
        warn!("{path} is not built for this console (ARM9 at 0x{:08X})", image.header().arm9_address());
        return None;
    }
    if !image.verify_hashes() {
        warn!("{path} is corrupted");
        return None;
    }

    info!("Loaded {firm_type} from {path}");
    Some(image)
}

fn load_nand_firm(storage: &mut dyn Storage, crypto: &mut dyn Crypto, path: &str) -> Result<FirmImage> {
    let mut content = storage
        .read_file(path, STAGING_SIZE)
        .ok_or_else(|| Error::io(format!("Unable to read {path}")))?;

    crypto.decrypt_exefs(&mut content)?;
    FirmImage::from_bytes(content)
}

/// Loads the FIRM to boot into the staging buffer. Old O3DS NATIVE_FIRMs are
/// narrowed down to the 1.x/2.x type or replaced from the SD card.
pub fn load_firm(storage: &mut dyn Storage, crypto: &mut dyn Crypto, ctx: &BootContext) -> Result<LoadedFirm> {
    storage.mount_ctrnand(ctx.firm_target())?;

    let content = find_firm_content(storage, ctx.firm_type, ctx.is_n3ds());
    let version = content.as_ref().map_or(VERSION_UNKNOWN, |(_, v)| *v);
    debug!("{} content version 0x{version:X}", ctx.firm_type);

    let mut firm_type = ctx.firm_type;
    let mut sd_required = false;

    if !ctx.is_n3ds() && firm_type == FirmwareType::Native {
        if version < MIN_NATIVE_VERSION {
            if ctx.firm_source.is_emunand() {
                return Err(Error::firmware(OLD_EMUNAND_MSG));
            }
            if ctx.config.safe_mode() {
                return Err(Error::firmware(SAFE_MODE_1X2X_MSG));
            }
            firm_type = FirmwareType::Native1x2x;
        } else if version < MIN_BOOTABLE_NATIVE_VERSION {
            sd_required = true;
        }
    }

    let sd_allowed = sd_required || ctx.option(SingleOption::LoadSdFirmsAndModules);
    if sd_allowed && let Some(image) = load_sd_firm(storage, firm_type, ctx.is_n3ds()) {
        return Ok(LoadedFirm { image, firm_type, version: VERSION_UNKNOWN });
    }
    if sd_required {
        return Err(Error::firmware(OLD_FIRM_MSG));
    }

    let nand = match &content {
        Some((path, _)) => load_nand_firm(storage, crypto, path),
        None => Err(Error::firmware(format!("No {} content found", ctx.firm_type))),
    };

    match nand {
        Ok(image) => {
            info!("Loaded {firm_type} version 0x{version:X} from {}", ctx.firm_source);
            Ok(LoadedFirm { image, firm_type, version })
        }
        Err(e) => {
            warn!("NAND FIRM rejected: {e}");
            if !sd_allowed && let Some(image) = load_sd_firm(storage, firm_type, ctx.is_n3ds()) {
                return Ok(LoadedFirm { image, firm_type, version: VERSION_UNKNOWN });
            }
            Err(Error::firmware(NO_VALID_FIRM_MSG))
        }
    }
}
