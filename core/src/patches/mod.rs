/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod capability;
#[cfg(not(feature = "no_diagnostics"))]
pub mod diagnostics;
pub mod emunand;
pub mod legacy;
pub mod native;

use log::{debug, info, warn};

use crate::boot::context::BootContext;
use crate::config::SingleOption;
use crate::error::{Error, Result};
use crate::firm::{FirmImage, FirmwareType, Kernel11, LoadedFirm, Process9};
use crate::platform::{Crypto, Storage};
use crate::utilities::patching::{Directive, apply_all, find_pattern};

pub use capability::{BuildInfo, CapabilityInfo};

/// ARM9 entry point past the arm9loader once the binary is decrypted.
pub const N3DS_NATIVE_ARM9_ENTRY: u32 = 0x0801_B01C;
pub const N3DS_LEGACY_ARM9_ENTRY: u32 = 0x0801_301C;

/// Prebuilt code blobs injected into the FIRM and its modules.
#[derive(Debug, Clone, Copy)]
pub struct Payloads<'a> {
    /// Replacement for Process9's firmlaunch routine.
    pub reboot: &'a [u8],
    /// NAND read/write redirection.
    pub emunand: &'a [u8],
    pub svc_get_cfw_info: &'a [u8],
    pub k11_modules: &'a [u8],
    /// Replacement for the `loader` sysmodule.
    pub injector: &'a [u8],
}

/// Applies `directives` only when all of their patterns are present, so a layout
/// that matches partially is never half patched.
pub(crate) fn apply_set(data: &mut [u8], name: &str, directives: &[Directive]) -> Result<bool> {
    if let Some(missing) = directives.iter().find(|d| find_pattern(data, d.pattern, 0).is_none()) {
        warn!("{name}: pattern {:02X?} not found, skipping", missing.pattern);
        return Ok(false);
    }

    let writes = apply_all(data, directives)?;
    debug!("{name}: {writes} write(s)");
    Ok(true)
}

/// Process9's `.code` inside the ARM9 section of NATIVE_FIRM.
pub(crate) fn process9_code<'i>(image: &'i mut FirmImage, process9: &Process9) -> Result<&'i mut [u8]> {
    image
        .section_data_mut(2)?
        .get_mut(process9.range())
        .ok_or_else(|| Error::firmware("Process9 lies outside the ARM9 section"))
}

/// Runs the FIRM patch catalog for one boot.
pub struct FirmPatcher<'a> {
    ctx: &'a BootContext,
    payloads: &'a Payloads<'a>,
    build: &'a BuildInfo<'a>,
    storage: &'a mut dyn Storage,
    crypto: &'a mut dyn Crypto,
}

impl<'a> FirmPatcher<'a> {
    pub fn new(
        ctx: &'a BootContext,
        payloads: &'a Payloads<'a>,
        build: &'a BuildInfo<'a>,
        storage: &'a mut dyn Storage,
        crypto: &'a mut dyn Crypto,
    ) -> Self {
        Self { ctx, payloads, build, storage, crypto }
    }

    pub fn patch(&mut self, firm: &mut LoadedFirm) -> Result<()> {
        info!("Patching {} (version 0x{:X})", firm.firm_type, firm.version);

        match firm.firm_type {
            FirmwareType::Native => self.patch_native_firm(&mut firm.image, firm.version),
            FirmwareType::Safe | FirmwareType::Native1x2x if self.ctx.is_a9lh => {
                self.patch_1x2x_native_and_safe_firm(&mut firm.image)
            }
            FirmwareType::Safe | FirmwareType::Native1x2x => {
                info!("Not booted through A9LH, leaving {} unpatched", firm.firm_type);
                Ok(())
            }
            other if self.ctx.is_n3ds() || firm.version >= legacy::min_o3ds_version(other) => {
                self.patch_legacy_firm(&mut firm.image, other)
            }
            other => {
                warn!("Unsupported O3DS {other} version 0x{:X}, leaving it unpatched", firm.version);
                Ok(())
            }
        }
    }

    fn decrypt_n3ds_arm9(&mut self, image: &mut FirmImage, entry: u32) -> Result<()> {
        let index = image.header().arm9_index();
        self.crypto.arm9_loader(image.section_data_mut(index)?)?;
        image.set_arm9_entry(entry);
        Ok(())
    }

    fn patch_native_firm(&mut self, image: &mut FirmImage, version: u32) -> Result<()> {
        let ctx = self.ctx;

        if ctx.is_n3ds() {
            self.decrypt_n3ds_arm9(image, N3DS_NATIVE_ARM9_ENTRY)?;
        } else if !ctx.is_a9lh && version >= 0x29 {
            self.crypto.set_rsa_mod0_keys();
        }

        let process9 = Process9::locate(image.section_data(2)?)
            .ok_or_else(|| Error::firmware("Process9 not found in the ARM9 section"))?;
        let mut kernel11 = match Kernel11::locate(image.section_data(1)?) {
            Ok(kernel11) => Some(kernel11),
            Err(e) => {
                warn!("{e}, skipping Kernel11 patches");
                None
            }
        };

        native::patch_signature_checks(process9_code(image, &process9)?)?;

        if let Some(location) = ctx.nand_redirect() {
            let arm9_address = image.section(2).address;
            emunand::patch_emunand(
                image.section_data_mut(2)?,
                arm9_address,
                &process9,
                location,
                self.payloads.emunand,
            )?;
        } else if ctx.is_a9lh {
            native::patch_firm_writes(process9_code(image, &process9)?)?;
        }

        let custom_path = if ctx.option(SingleOption::UseCustomPath) {
            native::read_custom_path(&mut *self.storage)
        } else {
            None
        };
        native::patch_firmlaunches(
            process9_code(image, &process9)?,
            process9.mem_addr,
            self.payloads.reboot,
            custom_path.as_deref(),
        )?;

        // 11.0 removed svcBackdoor and added the title downgrade check
        let v11_0 = if ctx.is_n3ds() { 0x21 } else { 0x52 };
        if version >= v11_0 {
            native::patch_title_install_min_version_check(process9_code(image, &process9)?)?;
            if let Some(kernel11) = kernel11.as_mut() {
                native::reimplement_svc_backdoor(image.section_data_mut(1)?, kernel11)?;
            }
        }

        if let Some(kernel11) = kernel11.as_mut() {
            let info = CapabilityInfo::new(self.build, ctx.config);
            if !native::implement_svc_get_cfw_info(
                image.section_data_mut(1)?,
                kernel11,
                self.payloads.svc_get_cfw_info,
                &info,
            )? {
                warn!("svcGetCFWInfo could not be installed");
            }
        }

        #[cfg(not(feature = "no_diagnostics"))]
        diagnostics::patch_native_firm(image, &process9, kernel11.as_mut(), ctx, self.payloads.k11_modules)?;

        Ok(())
    }

    fn patch_1x2x_native_and_safe_firm(&mut self, image: &mut FirmImage) -> Result<()> {
        if self.ctx.is_n3ds() {
            self.decrypt_n3ds_arm9(image, N3DS_NATIVE_ARM9_ENTRY)?;
            native::patch_firm_writes(image.section_data_mut(2)?)?;
        } else {
            native::patch_old_firm_writes(image.section_data_mut(2)?)?;
        }

        #[cfg(not(feature = "no_diagnostics"))]
        diagnostics::patch_safe_firm(image, self.ctx)?;

        Ok(())
    }

    fn patch_legacy_firm(&mut self, image: &mut FirmImage, firm_type: FirmwareType) -> Result<()> {
        if self.ctx.is_n3ds() {
            self.decrypt_n3ds_arm9(image, N3DS_LEGACY_ARM9_ENTRY)?;
        }

        legacy::apply_legacy_firm_patches(
            image.data_mut(),
            firm_type,
            self.ctx.is_n3ds(),
            self.ctx.option(SingleOption::ShowGbaBoot),
        )?;

        #[cfg(not(feature = "no_diagnostics"))]
        diagnostics::patch_legacy_firm(image, self.ctx)?;

        Ok(())
    }
}
