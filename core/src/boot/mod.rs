/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod context;
pub mod emunand;
pub mod image;
pub mod launch;
pub mod sources;

use std::fmt;
use std::ops::ControlFlow;

use log::{error, info, warn};

use crate::config::menu::run_config_menu;
use crate::config::pin::{PinCheck, PinHasher, verify_pin};
use crate::config::{
    BOOT_BITS_MASK, Config, ConfigStatus, NO_FORCE_FLAG, SAFE_MODE_FLAG, SplashMode, read_config, write_config,
};
use crate::error::Result;
use crate::firm::FirmwareType;
use crate::patches::{BuildInfo, FirmPatcher, Payloads};
use crate::platform::{Crypto, Interactive, Platform, Storage, buttons};

use context::{BootContext, EmuNandLocation, FirmwareSource, detect_relaunch};

const A9LH_FLAG_SHIFT: u32 = 6;
const FIRM_SOURCE_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Init,
    ResolveContext,
    ConfigMenu,
    ResolveSources,
    LoadImage,
    Patch,
    Relocate,
    Launch,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStage::Init => "INIT",
            BootStage::ResolveContext => "RESOLVE_CONTEXT",
            BootStage::ConfigMenu => "CONFIG_MENU",
            BootStage::ResolveSources => "RESOLVE_SOURCES",
            BootStage::LoadImage => "LOAD_IMAGE",
            BootStage::Patch => "PATCH",
            BootStage::Relocate => "RELOCATE",
            BootStage::Launch => "LAUNCH",
        };
        f.write_str(name)
    }
}

/// How control leaves the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Sections are in place and the ARM11 entry is set.
    Launch { arm9_entry: u32 },
    Chainload(Vec<u8>),
    Reboot,
    PowerOff,
}

/// Boot selection made before the sources are probed.
#[derive(Debug, Clone, Copy)]
struct Selection {
    config: Config,
    status: ConfigStatus,
    /// New boot bits, merged into the record once the sources are final.
    temp: u32,
    nand: FirmwareSource,
    firm: FirmwareSource,
}

pub struct Orchestrator<'a> {
    pub platform: &'a mut dyn Platform,
    pub storage: &'a mut dyn Storage,
    pub crypto: &'a mut dyn Crypto,
    pub ui: &'a mut dyn Interactive,
    pub payloads: Payloads<'a>,
    pub build: BuildInfo<'a>,
    stage: BootStage,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        platform: &'a mut dyn Platform,
        storage: &'a mut dyn Storage,
        crypto: &'a mut dyn Crypto,
        ui: &'a mut dyn Interactive,
        payloads: Payloads<'a>,
        build: BuildInfo<'a>,
    ) -> Self {
        Orchestrator { platform, storage, crypto, ui, payloads, build, stage: BootStage::Init }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    fn enter(&mut self, stage: BootStage) {
        info!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    /// Runs the whole boot and transfers control. Errors end on a full-screen
    /// message until the console is powered off.
    pub fn boot(mut self) -> ! {
        match self.run() {
            Ok(Handoff::Launch { arm9_entry }) => self.platform.jump(arm9_entry),
            Ok(Handoff::Chainload(payload)) => self.platform.chainload(&payload),
            Ok(Handoff::Reboot) => self.platform.reboot(),
            Ok(Handoff::PowerOff) => self.platform.power_off(),
            Err(e) => {
                error!("Boot failed in {}: {e}", self.stage);
                self.platform.halt(&e.to_string())
            }
        }
    }

    /// Every stage up to the final jump.
    pub fn run(&mut self) -> Result<Handoff> {
        info!("Starting boot (revision {})", self.build.revision);
        let relaunch = detect_relaunch(&self.platform.launch_params())?;
        let console_model = self.platform.console_model();
        let is_dev_unit = self.platform.is_dev_unit();
        info!("{console_model:?}{}, relaunch: {relaunch:?}", if is_dev_unit { " (dev unit)" } else { "" });

        self.enter(BootStage::ResolveContext);
        let (stored, status) = read_config(&mut *self.storage);

        let (selection, is_a9lh) = match relaunch {
            Some(_) if status == ConfigStatus::Create => {
                warn!("Relaunched without a configuration, rebooting");
                return Ok(Handoff::Reboot);
            }
            Some(_) => {
                let selection = Selection {
                    config: stored,
                    status: ConfigStatus::DontConfigure,
                    temp: stored.raw(),
                    nand: FirmwareSource::from_bits(stored.nand_source()),
                    firm: FirmwareSource::from_bits(stored.firm_source()),
                };
                (selection, stored.a9lh())
            }
            None => {
                let is_a9lh = self.platform.is_a9lh();
                match self.resolve_cold_boot(stored, status, is_a9lh, console_model.is_n3ds())? {
                    ControlFlow::Continue(selection) => (selection, is_a9lh),
                    ControlFlow::Break(handoff) => return Ok(handoff),
                }
            }
        };

        self.enter(BootStage::ResolveSources);
        let (nand_source, firm_source, emunand) = self.resolve_sources(selection.nand, selection.firm);

        let config = if relaunch.is_none() {
            let temp = selection.temp | nand_source.bits() | (firm_source.bits() << FIRM_SOURCE_SHIFT);
            write_config(&mut *self.storage, selection.config, temp, selection.status)?
        } else {
            selection.config
        };

        let ctx = BootContext {
            console_model,
            is_dev_unit,
            is_a9lh,
            is_relaunch: relaunch.is_some(),
            nand_source,
            firm_source,
            firm_type: relaunch.unwrap_or(FirmwareType::Native),
            config,
            emunand,
        };
        info!("Booting {} from {} with {} FIRM", ctx.firm_type, ctx.nand_source, ctx.firm_source);

        self.enter(BootStage::LoadImage);
        let mut firm = image::load_firm(&mut *self.storage, &mut *self.crypto, &ctx)?;

        self.enter(BootStage::Patch);
        FirmPatcher::new(&ctx, &self.payloads, &self.build, &mut *self.storage, &mut *self.crypto).patch(&mut firm)?;

        self.enter(BootStage::Relocate);
        launch::relocate(
            &mut *self.platform,
            &mut *self.storage,
            &firm.image,
            firm.firm_type,
            &ctx,
            self.payloads.injector,
        )?;

        self.enter(BootStage::Launch);
        let arm9_entry = launch::prepare_launch(&mut *self.platform, &firm.image, ctx.is_relaunch);
        Ok(Handoff::Launch { arm9_entry })
    }

    /// Forced options, PIN, menu, safe mode, splash, payloads and the button
    /// driven NAND choice of a cold boot.
    fn resolve_cold_boot(
        &mut self,
        stored: Config,
        mut status: ConfigStatus,
        is_a9lh: bool,
        is_n3ds: bool,
    ) -> Result<ControlFlow<Handoff, Selection>> {
        let mut pressed = self.platform.held_buttons();
        let boot_env = self.platform.boot_env();
        let mut config = stored;
        let mut temp = (stored.raw() & !BOOT_BITS_MASK) | (u32::from(is_a9lh) << A9LH_FLAG_SHIFT);
        let mut choice = (FirmwareSource::SysNand, FirmwareSource::SysNand);

        if is_a9lh && let Some(forced) = sources::forced_sources(boot_env, pressed, stored, status) {
            info!("Replaying boot options after an MCU reboot");
            choice = forced;
            status = ConfigStatus::DontConfigure;
            if boot_env == sources::BOOTENV_AGB_EXIT {
                temp |= NO_FORCE_FLAG;
            }
        }

        if status != ConfigStatus::DontConfigure {
            let (key, iv) = self.crypto.pin_key_material();
            let hasher = PinHasher::new(key, iv);

            let pin_unlocked = match stored.pin_length() {
                Some(length) => match verify_pin(&mut *self.storage, &mut *self.ui, &hasher, length) {
                    PinCheck::PowerOff => return Ok(ControlFlow::Break(Handoff::PowerOff)),
                    PinCheck::Unlocked => true,
                    PinCheck::NoPin => false,
                },
                None => false,
            };

            let show_menu = sources::wants_config_menu(pressed, status);
            if show_menu {
                self.enter(BootStage::ConfigMenu);
                config = run_config_menu(&mut *self.ui, &mut *self.storage, &hasher, config, is_n3ds, pin_unlocked)?;
                pressed = self.platform.held_buttons();
            }

            if is_a9lh && boot_env == 0 && pressed == buttons::SAFE_MODE {
                info!("Safe mode requested");
                choice = (FirmwareSource::SysNand, FirmwareSource::SysNand);
                temp |= SAFE_MODE_FLAG;

                if pin_unlocked && !show_menu {
                    self.ui.settle();
                }
            } else {
                let splash = config.splash();
                if splash == SplashMode::BeforePayloads && self.ui.show_splash() {
                    pressed = self.platform.held_buttons();
                }

                if sources::wants_payload(pressed)
                    && let Some(payload) = sources::load_payload(&mut *self.storage, pressed)
                {
                    return Ok(ControlFlow::Break(Handoff::Chainload(payload)));
                }

                if splash == SplashMode::AfterPayloads {
                    self.ui.show_splash();
                }

                choice = sources::select_sources(pressed, config, is_a9lh);
            }
        }

        Ok(ControlFlow::Continue(Selection { config, status, temp, nand: choice.0, firm: choice.1 }))
    }

    /// Probes the EmuNAND in use. A NAND falling back to SysNAND takes the FIRM
    /// with it.
    fn resolve_sources(
        &mut self,
        nand: FirmwareSource,
        firm: FirmwareSource,
    ) -> (FirmwareSource, FirmwareSource, Option<EmuNandLocation>) {
        if nand.is_emunand() {
            let (nand, location) = emunand::locate_emunand(&mut *self.storage, nand);
            let firm = if nand.is_emunand() { firm } else { FirmwareSource::SysNand };
            (nand, firm, location)
        } else if firm.is_emunand() {
            let (firm, location) = emunand::locate_emunand(&mut *self.storage, firm);
            (nand, firm, location)
        } else {
            (nand, firm, None)
        }
    }
}
