/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Patches for the system titles the loader knows by program id.

use log::{debug, warn};

use crate::config::{Config, MultiOption, SingleOption};
use crate::error::Result;
use crate::utilities::arm::{ARM_NOP, mov_r0_imm};
use crate::utilities::patching::{Directive, Replacement, apply_all, apply_directive, find_pattern, write_u32};

use super::ProgramId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitlePatch {
    HomeMenu,
    Nim,
    Friends,
    Mset,
    Ns,
    Cfg,
    Ro,
    ErrDisp,
    /// Any regular application: external `.code` and locale emulation.
    Application,
}

pub const TITLES: &[(u64, TitlePatch)] = &[
    (0x0004_0030_0000_8F02, TitlePatch::HomeMenu),
    (0x0004_0030_0000_8202, TitlePatch::HomeMenu),
    (0x0004_0030_0000_9802, TitlePatch::HomeMenu),
    (0x0004_0030_0000_A102, TitlePatch::HomeMenu),
    (0x0004_0030_0000_A902, TitlePatch::HomeMenu),
    (0x0004_0030_0000_B102, TitlePatch::HomeMenu),
    (0x0004_0130_0000_2C02, TitlePatch::Nim),
    (0x0004_0130_0000_3202, TitlePatch::Friends),
    (0x0004_0010_0002_1000, TitlePatch::Mset),
    (0x0004_0010_0002_0000, TitlePatch::Mset),
    (0x0004_0010_0002_2000, TitlePatch::Mset),
    (0x0004_0010_0002_6000, TitlePatch::Mset),
    (0x0004_0010_0002_7000, TitlePatch::Mset),
    (0x0004_0010_0002_8000, TitlePatch::Mset),
    (0x0004_0130_0000_8002, TitlePatch::Ns),
    (0x0004_0130_0000_1702, TitlePatch::Cfg),
    (0x0004_0130_0000_3702, TitlePatch::Ro),
    (0x0004_0030_0000_8A02, TitlePatch::ErrDisp),
];

/// What a title patch may query besides the code it rewrites.
pub trait TitleContext {
    fn config(&mut self) -> Config;
    /// Two letter eShop country override.
    fn country(&mut self) -> Option<[u8; 2]>;
    /// UTF-16LE label shown in System Settings.
    fn version_label(&mut self, config: Config) -> Vec<u8>;
    fn secure_info_c_exists(&mut self) -> bool;
    fn patch_application(&mut self, id: ProgramId, code: &mut [u8]) -> Result<usize>;
}

impl TitlePatch {
    pub fn lookup(id: ProgramId) -> Option<Self> {
        TITLES
            .iter()
            .find(|(title, _)| *title == id.0)
            .map(|(_, patch)| *patch)
            .or_else(|| id.is_application().then_some(TitlePatch::Application))
    }

    /// Runs this entry on `code`. Each entry checks its own options, so a
    /// disabled entry leaves the code untouched.
    pub fn apply(self, id: ProgramId, code: &mut [u8], ctx: &mut dyn TitleContext) -> Result<usize> {
        let config = ctx.config();
        let lang_emu = config.single(SingleOption::UseLangEmuAndCode);

        match self {
            TitlePatch::HomeMenu => patch_home_menu(code, config),
            TitlePatch::Nim => {
                let country = if lang_emu { ctx.country() } else { None };
                patch_nim(code, config, country)
            }
            TitlePatch::Friends => patch_friends(code, config),
            TitlePatch::Mset if config.single(SingleOption::PatchVerString) => {
                let label = ctx.version_label(config);
                patch_mset(code, config, &label)
            }
            TitlePatch::Mset => Ok(0),
            TitlePatch::Ns => patch_ns(code, config),
            TitlePatch::Cfg => {
                let secure_info_c = config.single(SingleOption::SecureInfo) && ctx.secure_info_c_exists();
                patch_cfg(code, config, secure_info_c)
            }
            TitlePatch::Ro => patch_ro(code),
            TitlePatch::ErrDisp => patch_err_disp(code, config),
            TitlePatch::Application if lang_emu => ctx.patch_application(id, code),
            TitlePatch::Application => Ok(0),
        }
    }
}

/// `mov r0, #0; bx lr`
const STUB_RETURN_ZERO: &[u8] = &[0x00, 0x00, 0xA0, 0xE3, 0x1E, 0xFF, 0x2F, 0xE1];

/// `u"Ver."`
pub const VERSION_PATTERN: &[u8] = b"V\0e\0r\0.\0";
const SECURE_INFO_NAME: &[u8] = b"S\0e\0c\0u\0r\0e\0I\0n\0f\0o\0_\0";
const SECURE_INFO_C: &[u8] = b"C\0";

pub const MAX_CUSTOM_VERSION_LEN: usize = 19;

const ESHOP_COUNTRY_PATTERN: &[u8] = &[0x01, 0x20, 0x01, 0x90, 0x22, 0x46, 0x06, 0x9B];
const ESHOP_COUNTRY_PATCH: [u8; 22] = [
    0x06, 0x9A, 0x03, 0x20, 0x90, 0x47, 0x55, 0x21, 0x01, 0x70, 0x53, 0x21, 0x41, 0x70, 0x00, 0x21, 0x81, 0x70,
    0x60, 0x61, 0x00, 0x20,
];

const FRIENDS_VERSION_PATTERN: &[u8] = &[0xE0, 0x1E, 0xFF, 0x2F, 0xE1, 0x01, 0x01];
const FRIENDS_MIN_VERSION: u8 = 7;

const NS_CPU_PATTERN: &[u8] = &[0x00, 0x40, 0xA0, 0xE1, 0x07];

pub fn patch_home_menu(code: &mut [u8], config: Config) -> Result<usize> {
    if !config.single(SingleOption::RegionFree) {
        return Ok(0);
    }

    let region_free = Directive::new(
        &[0x00, 0x00, 0x55, 0xE3, 0x01, 0x10, 0xA0],
        -16,
        Replacement::Bytes(&[0x01, 0x00, 0xA0, 0xE3, 0x1E, 0xFF, 0x2F, 0xE1]),
    );
    apply_directive(code, &region_free)
}

/// NIM handles updates and the eShop country. `country` is the two letter code
/// from `country.txt`.
pub fn patch_nim(code: &mut [u8], config: Config, country: Option<[u8; 2]>) -> Result<usize> {
    let mut writes = 0;

    if config.single(SingleOption::PreventUpdates) {
        let auto_updates = Directive::new(&[0x25, 0x79, 0x0B, 0x99], 0, Replacement::Bytes(&[0xE3, 0xA0]));
        writes += apply_directive(code, &auto_updates)?;

        // Only when NAND and FIRM disagree, which is booting with R
        if (config.nand_source() != 0) != (config.firm_source() != 0) {
            let eshop_check = Directive::new(
                &[0x30, 0xB5, 0xF1, 0xB0],
                0,
                Replacement::Bytes(&[0x00, 0x20, 0x08, 0x60, 0x70, 0x47]),
            );
            writes += apply_directive(code, &eshop_check)?;
        }
    }

    if config.single(SingleOption::UseLangEmuAndCode)
        && let Some([first, second]) = country
    {
        let mut patch = ESHOP_COUNTRY_PATCH;
        patch[6] = first;
        patch[10] = second;
        writes += apply_directive(code, &Directive::new(ESHOP_COUNTRY_PATTERN, 0, Replacement::Bytes(&patch)))?;
    }

    Ok(writes)
}

/// Raises the friends module version so an outdated system still gets online.
pub fn patch_friends(code: &mut [u8], config: Config) -> Result<usize> {
    if !config.single(SingleOption::PreventUpdates) {
        return Ok(0);
    }

    let Some(pos) = find_pattern(code, FRIENDS_VERSION_PATTERN, 0) else {
        warn!("Friends version not found");
        return Ok(0);
    };

    match code.get_mut(pos + 9) {
        Some(version) if *version < FRIENDS_MIN_VERSION => {
            debug!("Friends version {} raised to {FRIENDS_MIN_VERSION}", *version);
            *version = FRIENDS_MIN_VERSION;
            Ok(1)
        }
        _ => Ok(0),
    }
}

/// System Settings version label. `version` is UTF-16LE.
pub fn patch_mset(code: &mut [u8], config: Config, version: &[u8]) -> Result<usize> {
    if !config.single(SingleOption::PatchVerString) || version.is_empty() {
        return Ok(0);
    }

    apply_directive(code, &Directive::new(VERSION_PATTERN, 0, Replacement::Bytes(version)))
}

pub fn patch_ns(code: &mut [u8], config: Config) -> Result<usize> {
    let mut writes = 0;

    if config.single(SingleOption::RegionFree) || config.single(SingleOption::PreventUpdates) {
        let stop_cart_updates = Directive::new(&[0x0C, 0x18, 0xE1, 0xD8], 0, Replacement::Bytes(&[0x0B, 0x18, 0x21, 0xC8])).times(2);
        writes += apply_directive(code, &stop_cart_updates)?;
    }

    if config.single(SingleOption::TestMenu) {
        let test_menu = Directive::new(
            &[0xBC, 0x00, 0x9F, 0xE5, 0x52, 0x45, 0x00, 0xEB],
            0,
            Replacement::Bytes(&[0x09, 0x10, 0xA0, 0xE1, 0x08, 0x00, 0xA0, 0xE1]),
        );
        writes += apply_directive(code, &test_menu)?;
    }

    let cpu = config.multi(MultiOption::NewCpu);
    if cpu != 0
        && let Some(pos) = find_pattern(code, NS_CPU_PATTERN, 0)
    {
        write_u32(code, pos + 4, ARM_NOP)?;
        write_u32(code, pos + 32, mov_r0_imm(cpu as u8))?;
        debug!("N3DS CPU setting {cpu} forced at 0x{pos:X}");
        writes += 2;
    }

    Ok(writes)
}

pub fn patch_cfg(code: &mut [u8], config: Config, secure_info_c: bool) -> Result<usize> {
    if !config.single(SingleOption::SecureInfo) {
        return Ok(0);
    }

    let mut writes = apply_directive(code, &Directive::new(&[0x06, 0x46, 0x10, 0x48], 0, Replacement::Bytes(&[0x00, 0x26])))?;

    if secure_info_c {
        let rename = Directive::new(SECURE_INFO_NAME, SECURE_INFO_NAME.len() as isize, Replacement::Bytes(SECURE_INFO_C)).times(2);
        writes += apply_directive(code, &rename)?;
    }

    Ok(writes)
}

/// CRR signature and CRO/CRR hash checks.
pub fn patch_ro(code: &mut [u8]) -> Result<usize> {
    let stub = Replacement::Bytes(STUB_RETURN_ZERO);
    apply_all(
        code,
        &[
            Directive::new(&[0x30, 0x40, 0x2D, 0xE9, 0x02], 0, stub),
            Directive::new(&[0x30, 0x40, 0x2D, 0xE9, 0x24], 0, stub),
            Directive::new(&[0xF8, 0x4F, 0x2D, 0xE9, 0x01], 0, stub),
        ],
    )
}

/// Shows the full error details on retail units.
#[cfg(not(feature = "no_diagnostics"))]
pub fn patch_err_disp(code: &mut [u8], config: Config) -> Result<usize> {
    use crate::config::DevOptions;

    if config.dev_options() != DevOptions::ErrDisp {
        return Ok(0);
    }

    let mov_r0_0 = Replacement::Bytes(&[0x00, 0x00, 0xA0, 0xE3]);
    apply_all(
        code,
        &[
            Directive::new(&[0x14, 0x00, 0xD0, 0xE5, 0xDB], 0, mov_r0_0),
            Directive::new(&[0x14, 0x00, 0xD0, 0xE5, 0x01], 0, mov_r0_0).times(3),
        ],
    )
}

#[cfg(feature = "no_diagnostics")]
pub fn patch_err_disp(_code: &mut [u8], _config: Config) -> Result<usize> {
    Ok(0)
}

fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Default version label naming the NAND and FIRM in use, as UTF-16LE.
pub fn version_label(nand: u32, firm: u32) -> Vec<u8> {
    let matching = (firm != 0) == (nand != 0);
    let digit = |n: u32| char::from_digit(n, 10).unwrap_or('?');

    let label = match nand {
        0 if matching => " Sys".to_owned(),
        0 if firm == 1 => "SysE".to_owned(),
        0 => format!("SyE{}", digit(firm)),
        1 if matching => " Emu".to_owned(),
        1 => "EmuS".to_owned(),
        n if matching => format!("Emu{}", digit(n)),
        n => format!("Em{}S", digit(n)),
    };
    utf16(&label)
}

/// Widens the bytes of `customversion.txt` to UTF-16LE.
pub fn custom_version_label(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() > MAX_CUSTOM_VERSION_LEN {
        return None;
    }
    Some(raw.iter().flat_map(|&c| [c, 0]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(options: &[SingleOption]) -> Config {
        let mut config = Config::from_raw(0);
        for &option in options {
            config.set_single(option, true);
        }
        config
    }

    fn code_with(at: usize, bytes: &[u8]) -> Vec<u8> {
        let mut code = vec![0u8; 0x200];
        code[at..at + bytes.len()].copy_from_slice(bytes);
        code
    }

    #[test]
    fn lookup_by_program_id() {
        assert_eq!(TitlePatch::lookup(ProgramId(0x0004_0030_0000_9802)), Some(TitlePatch::HomeMenu));
        assert_eq!(TitlePatch::lookup(ProgramId(0x0004_0130_0000_3702)), Some(TitlePatch::Ro));
        assert_eq!(TitlePatch::lookup(ProgramId(0x0004_0000_0012_3400)), Some(TitlePatch::Application));
        assert_eq!(TitlePatch::lookup(ProgramId(0x0004_0130_0000_FF02)), None);
    }

    #[test]
    fn home_menu_region_check_is_gated() {
        let pattern = [0x00, 0x00, 0x55, 0xE3, 0x01, 0x10, 0xA0];
        let mut code = code_with(0x40, &pattern);
        let before = code.clone();

        assert_eq!(patch_home_menu(&mut code, config(&[])).unwrap(), 0);
        assert_eq!(code, before);

        assert_eq!(patch_home_menu(&mut code, config(&[SingleOption::RegionFree])).unwrap(), 1);
        assert_eq!(&code[0x30..0x38], STUB_RETURN_ZERO);
    }

    #[test]
    fn nim_country_override() {
        let mut code = code_with(0x80, ESHOP_COUNTRY_PATTERN);
        let writes = patch_nim(&mut code, config(&[SingleOption::UseLangEmuAndCode]), Some(*b"GB")).unwrap();
        assert_eq!(writes, 1);
        assert_eq!(code[0x86], b'G');
        assert_eq!(code[0x8A], b'B');
        assert_eq!(&code[0x80..0x82], &[0x06, 0x9A]);
    }

    #[test]
    fn friends_version_only_grows() {
        let mut code = code_with(0x10, FRIENDS_VERSION_PATTERN);
        code[0x19] = 5;
        assert_eq!(patch_friends(&mut code, config(&[SingleOption::PreventUpdates])).unwrap(), 1);
        assert_eq!(code[0x19], 7);
        assert_eq!(patch_friends(&mut code, config(&[SingleOption::PreventUpdates])).unwrap(), 0);
    }

    #[test]
    fn ns_cpu_setting() {
        let mut code = code_with(0x20, NS_CPU_PATTERN);
        let mut cfg = config(&[]);
        cfg.set_multi(MultiOption::NewCpu, 2);

        assert_eq!(patch_ns(&mut code, cfg).unwrap(), 2);
        assert_eq!(&code[0x24..0x28], &ARM_NOP.to_le_bytes());
        assert_eq!(&code[0x40..0x44], &0xE3A0_0002u32.to_le_bytes());
    }

    #[test]
    fn cfg_uses_secure_info_c() {
        let mut code = vec![0u8; 0x100];
        code[0x10..0x26].copy_from_slice(SECURE_INFO_NAME);
        code[0x26..0x28].copy_from_slice(b"A\0");
        code[0x60..0x76].copy_from_slice(SECURE_INFO_NAME);
        code[0x76..0x78].copy_from_slice(b"A\0");

        assert_eq!(patch_cfg(&mut code, config(&[SingleOption::SecureInfo]), true).unwrap(), 2);
        assert_eq!(&code[0x26..0x28], b"C\0");
        assert_eq!(&code[0x76..0x78], b"C\0");
    }

    #[test]
    fn ro_stubs_are_unconditional() {
        let mut code = code_with(0x08, &[0x30, 0x40, 0x2D, 0xE9, 0x24]);
        assert_eq!(patch_ro(&mut code).unwrap(), 1);
        assert_eq!(&code[0x08..0x10], STUB_RETURN_ZERO);
    }

    #[test]
    fn version_labels() {
        assert_eq!(version_label(0, 0), utf16(" Sys"));
        assert_eq!(version_label(0, 1), utf16("SysE"));
        assert_eq!(version_label(0, 3), utf16("SyE3"));
        assert_eq!(version_label(1, 1), utf16(" Emu"));
        assert_eq!(version_label(1, 0), utf16("EmuS"));
        assert_eq!(version_label(3, 2), utf16("Emu3"));
        assert_eq!(version_label(4, 0), utf16("Em4S"));
        assert!(version_label(2, 0).len() == 8);
    }

    #[test]
    fn custom_version_is_widened() {
        assert_eq!(custom_version_label(b"Hi"), Some(b"H\0i\0".to_vec()));
        assert_eq!(custom_version_label(&[b'x'; 20]), None);
    }

    #[derive(Default)]
    struct Queries {
        config: Config,
        labels: usize,
        applications: usize,
        secure_info_checks: usize,
    }

    impl TitleContext for Queries {
        fn config(&mut self) -> Config {
            self.config
        }
        fn country(&mut self) -> Option<[u8; 2]> {
            None
        }
        fn version_label(&mut self, _config: Config) -> Vec<u8> {
            self.labels += 1;
            utf16("Test")
        }
        fn secure_info_c_exists(&mut self) -> bool {
            self.secure_info_checks += 1;
            true
        }
        fn patch_application(&mut self, _id: ProgramId, _code: &mut [u8]) -> Result<usize> {
            self.applications += 1;
            Ok(1)
        }
    }

    #[test]
    fn entries_gate_their_own_lookups() {
        let mut ctx = Queries::default();
        let mut code = code_with(0x10, VERSION_PATTERN);
        let before = code.clone();
        let app = ProgramId(0x0004_0000_0012_3400);

        assert_eq!(TitlePatch::Mset.apply(ProgramId(0x0004_0010_0002_1000), &mut code, &mut ctx).unwrap(), 0);
        assert_eq!(TitlePatch::Application.apply(app, &mut code, &mut ctx).unwrap(), 0);
        assert_eq!(TitlePatch::Cfg.apply(ProgramId(0x0004_0130_0000_1702), &mut code, &mut ctx).unwrap(), 0);
        assert_eq!((ctx.labels, ctx.applications, ctx.secure_info_checks), (0, 0, 0));
        assert_eq!(code, before);

        ctx.config = config(&[SingleOption::PatchVerString, SingleOption::UseLangEmuAndCode]);
        assert_eq!(TitlePatch::Mset.apply(ProgramId(0x0004_0010_0002_1000), &mut code, &mut ctx).unwrap(), 1);
        assert_eq!(&code[0x10..0x18], b"T\0e\0s\0t\0");
        assert_eq!(TitlePatch::Application.apply(app, &mut code, &mut ctx).unwrap(), 1);
        assert_eq!((ctx.labels, ctx.applications), (1, 1));
    }
}
