/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod common;

use common::*;
use puma::boot::image::{NO_VALID_FIRM_MSG, OLD_EMUNAND_MSG, OLD_FIRM_MSG};
use puma::boot::launch::{ARM11_ENTRY_COLD, ARM11_ENTRY_RELAUNCH};
use puma::config::{CONFIG_PATH, SAFE_MODE_FLAG, parse_record};
use puma::platform::{ConsoleModel, NandTarget, buttons};
use puma::utilities::arm::encode_b_arm;
use puma::{BootStage, CapabilityInfo, Handoff, Orchestrator, Result};

const O3DS_NATIVE_DIR: &str = "1:/title/00040138/00000002/content";
const O3DS_TWL_DIR: &str = "1:/title/00040138/00000102/content";

fn boot(platform: &mut FakePlatform, storage: &mut FakeStorage, ui: &mut FakeUi) -> (Result<Handoff>, BootStage) {
    let mut crypto = FakeCrypto::default();
    let mut orchestrator = Orchestrator::new(platform, storage, &mut crypto, ui, PAYLOADS, BUILD);
    let result = orchestrator.run();
    (result, orchestrator.stage())
}

fn stored_config(storage: &FakeStorage) -> u32 {
    let record = storage.file(CONFIG_PATH).expect("no configuration written");
    parse_record(record).expect("invalid configuration record").raw()
}

fn simple_firm() -> Vec<u8> {
    build_firm(
        0x1FF8_0000,
        0x0801_B01C,
        &[(0x1FF0_0000, vec![0x11; 0x80]), (0x1FF8_0000, vec![0x22; 0x40]), (0x0800_6800, vec![0x33; 0x60])],
    )
}

const SECTION0_ADDRESS: u32 = 0x1FF0_0000;
const KERNEL11_ADDRESS: u32 = 0x1FF8_0000;
const ARM9_ADDRESS: u32 = 0x0800_6800;

/// Process9 NCCH header and its `.code`, as laid out in the ARM9 section.
const P9_NCCH: usize = 0x15800;
const P9_MARKER: usize = P9_NCCH + 0x204;
const P9_CODE: usize = P9_NCCH + 0x600;
const P9_CODE_UNITS: u32 = 1;

const K11_BASE_VA: u32 = 0xFFF0_0000;
const K11_SVC_TABLE: usize = 0x440;
const K11_FREE: usize = 0x800;
const SVC_GET_CFW_INFO: usize = 0x2E;

/// ARM9 section with a Process9 whose `.code` carries both signature checks.
fn native_arm9() -> Vec<u8> {
    let mut arm9 = vec![0u8; P9_CODE + P9_CODE_UNITS as usize * 0x200 + 0x100];
    arm9[P9_MARKER..P9_MARKER + 4].copy_from_slice(b"ess9");
    arm9[P9_MARKER - 0x64..P9_MARKER - 0x60].copy_from_slice(&2u32.to_le_bytes());
    arm9[P9_MARKER - 0x60..P9_MARKER - 0x5C].copy_from_slice(&P9_CODE_UNITS.to_le_bytes());
    arm9[P9_MARKER + 0xC..P9_MARKER + 0x10].copy_from_slice(&0x0800_0000u32.to_le_bytes());

    arm9[P9_CODE + 0x10..P9_CODE + 0x14].copy_from_slice(&[0xC0, 0x1C, 0x76, 0xE7]);
    arm9[P9_CODE + 0x40..P9_CODE + 0x44].copy_from_slice(&[0xB5, 0x22, 0x4D, 0x0C]);
    arm9
}

/// Kernel11 with its exception page at 0x100, the SVC handler at 0x400 followed by
/// the SVC table, and 0x100 bytes of 0xFF padding at 0x800.
fn native_kernel11() -> Vec<u8> {
    let mut k11 = vec![0x11u8; 0x1000];
    let page = 0x100;
    k11[page + 0x2C..page + 0x30].copy_from_slice(&[0x00, 0xB0, 0x9C, 0xE5]);

    let branch = encode_b_arm(0xFFFF_0008, K11_BASE_VA + 0x200).unwrap();
    k11[page + 8..page + 12].copy_from_slice(&branch.to_le_bytes());
    k11[0x208..0x20C].copy_from_slice(&(K11_BASE_VA + 0x400).to_le_bytes());

    k11[K11_SVC_TABLE..K11_SVC_TABLE + 0x200].fill(0);
    k11[K11_SVC_TABLE + 4..K11_SVC_TABLE + 8].copy_from_slice(&0xFFF0_2000u32.to_le_bytes());
    k11[K11_FREE - 1..K11_FREE + 0x100].fill(0xFF);
    k11
}

/// Section 0 holding only the `loader` sysmodule.
fn native_section0() -> Vec<u8> {
    let mut module = vec![0x77u8; 0x400];
    module[0x104..0x108].copy_from_slice(&2u32.to_le_bytes());
    module[0x200..0x208].copy_from_slice(b"loader\0\0");
    module
}

fn native_firm(kernel11: Vec<u8>, arm9: Vec<u8>) -> Vec<u8> {
    build_firm(
        KERNEL11_ADDRESS,
        0x0801_B01C,
        &[(SECTION0_ADDRESS, native_section0()), (KERNEL11_ADDRESS, kernel11), (ARM9_ADDRESS, arm9)],
    )
}

/// Non-A9LH O3DS with every option off, booting NATIVE_FIRM 0x30 from SysNAND.
fn boot_native(firm: Vec<u8>) -> (Result<Handoff>, BootStage, FakePlatform) {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    platform.a9lh = false;
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_NATIVE_DIR}/00000030.app"), firm);
    let mut ui = FakeUi::default();

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);
    (result, stage, platform)
}

#[test]
fn test_first_boot_saves_menu_choice() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    let mut storage = FakeStorage::new();
    let mut ui = FakeUi::pressing(&[buttons::START]);

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);

    // Nothing to boot, but the record is written before the FIRM is loaded
    assert_eq!(result.unwrap_err().to_string(), NO_VALID_FIRM_MSG);
    assert_eq!(stage, BootStage::LoadImage);
    assert_eq!(ui.menu_draws, 1);

    let record = storage.file(CONFIG_PATH).unwrap();
    assert_eq!(&record[..4], b"CONF");
    assert_eq!(u16::from_le_bytes([record[4], record[5]]), 11);
    assert_eq!(u16::from_le_bytes([record[6], record[7]]), 0);

    // A9LH flag set, no EmuNAND on the card so both sources are SysNAND
    assert_eq!(stored_config(&storage) & 0x1FF, 1 << 6);
}

#[test]
fn test_old_native_firm_requires_sd_copy() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_NATIVE_DIR}/00000020.app"), simple_firm());
    let mut ui = FakeUi::default();

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap_err().to_string(), OLD_FIRM_MSG);
    assert_eq!(stage, BootStage::LoadImage);
    assert_eq!(ui.menu_draws, 0);
}

#[test]
fn test_missing_emunand_boots_sysnand() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    platform.a9lh = false;
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_NATIVE_DIR}/00000010.app"), simple_firm());
    let mut ui = FakeUi::default();

    // Default options autoboot EmuNAND 1, which is not on the card
    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap(), Handoff::Launch { arm9_entry: 0x0801_B01C });
    assert_eq!(stage, BootStage::Launch);
    assert_eq!(storage.mounted, vec![NandTarget::SysNand]);
    assert!(storage.writes.is_empty());
}

#[test]
fn test_cold_launch_copies_sections_then_sets_arm11_entry() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    platform.a9lh = false;
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_NATIVE_DIR}/00000010.app"), simple_firm());
    let mut ui = FakeUi::default();

    let (result, _) = boot(&mut platform, &mut storage, &mut ui);
    assert!(result.is_ok());

    assert_eq!(
        platform.events,
        vec![
            HwEvent::Copy { address: 0x1FF0_0000, len: 0x80 },
            HwEvent::Copy { address: 0x1FF8_0000, len: 0x40 },
            HwEvent::Copy { address: 0x0800_6800, len: 0x60 },
            HwEvent::DeinitScreens,
            HwEvent::Write { address: ARM11_ENTRY_COLD, value: 0x1FF8_0000 },
            HwEvent::FlushCaches,
        ]
    );
}

#[test]
fn test_old_emunand_is_fatal() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds);
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_NATIVE_DIR}/00000010.app"), simple_firm());

    // RedNAND header in the first slot
    let mut sector = vec![0u8; 0x200];
    sector[0x100..0x104].copy_from_slice(b"NCSD");
    storage.sd_sectors.insert(1, sector);

    let mut ui = FakeUi::default();
    let (result, _) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap_err().to_string(), OLD_EMUNAND_MSG);
    assert_eq!(storage.mounted, vec![NandTarget::EmuNand { offset: 1 }]);
    assert_eq!(stored_config(&storage) & 0x3F, 1 | (1 << 3));
}

#[test]
fn test_relaunch_without_config_reboots() {
    let mut platform = FakePlatform::relaunch(ConsoleModel::Old3ds, b'1');
    let mut storage = FakeStorage::new();
    let mut ui = FakeUi::default();

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap(), Handoff::Reboot);
    assert_eq!(stage, BootStage::ResolveContext);
    assert!(platform.events.is_empty());
}

#[test]
fn test_relaunch_keeps_screens_and_config() {
    let mut platform = FakePlatform::relaunch(ConsoleModel::Old3ds, b'1');
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file(&format!("{O3DS_TWL_DIR}/00000010.app"), simple_firm());
    let mut ui = FakeUi::default();

    let (result, _) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap(), Handoff::Launch { arm9_entry: 0x0801_B01C });
    assert!(storage.writes.is_empty());
    assert!(!platform.events.contains(&HwEvent::DeinitScreens));
    assert!(platform.events.contains(&HwEvent::Write { address: ARM11_ENTRY_RELAUNCH, value: 0x1FF8_0000 }));
}

#[test]
fn test_unknown_launch_target_is_an_error() {
    let mut platform = FakePlatform::relaunch(ConsoleModel::New3ds, b'9');
    let mut storage = FakeStorage::new().with_file(CONFIG_PATH, config_record(0));
    let mut ui = FakeUi::default();

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);
    assert!(result.is_err());
    assert_eq!(stage, BootStage::Init);
}

#[test]
fn test_held_button_chainloads_payload() {
    let mut platform = FakePlatform::cold(ConsoleModel::New3ds).holding(buttons::X);
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file("/puma/payloads/x_hello.bin", vec![0x5A; 0x100]);
    let mut ui = FakeUi::default();

    let (result, _) = boot(&mut platform, &mut storage, &mut ui);

    assert_eq!(result.unwrap(), Handoff::Chainload(vec![0x5A; 0x100]));
    assert!(storage.writes.is_empty());
}

#[test]
fn test_empty_payload_is_skipped() {
    let mut platform = FakePlatform::cold(ConsoleModel::New3ds).holding(buttons::X);
    let mut storage = FakeStorage::new()
        .with_file(CONFIG_PATH, config_record(0))
        .with_file("/puma/payloads/x_empty.bin", Vec::new());
    let mut ui = FakeUi::default();

    let (result, stage) = boot(&mut platform, &mut storage, &mut ui);

    assert!(!matches!(result, Ok(Handoff::Chainload(_))));
    assert_eq!(stage, BootStage::LoadImage);
}

#[test]
fn test_safe_mode_combo_is_recorded() {
    let mut platform = FakePlatform::cold(ConsoleModel::Old3ds).holding(buttons::SAFE_MODE);
    let mut storage = FakeStorage::new().with_file(CONFIG_PATH, config_record(0));
    let mut ui = FakeUi::default();

    let _ = boot(&mut platform, &mut storage, &mut ui);

    let config = stored_config(&storage);
    assert_ne!(config & SAFE_MODE_FLAG, 0);
    assert_eq!(config & 0x3F, 0);
}

#[test]
fn test_native_firm_gets_signature_stubs_and_cfw_info() {
    let (result, stage, platform) = boot_native(native_firm(native_kernel11(), native_arm9()));

    assert_eq!(result.unwrap(), Handoff::Launch { arm9_entry: 0x0801_B01C });
    assert_eq!(stage, BootStage::Launch);

    // movs r0, #0 over the first check, movs r0, #0; bx lr one byte before the second
    let mut arm9 = native_arm9();
    arm9[P9_CODE + 0x10..P9_CODE + 0x12].copy_from_slice(&[0x00, 0x20]);
    arm9[P9_CODE + 0x3F..P9_CODE + 0x43].copy_from_slice(&[0x00, 0x20, 0x70, 0x47]);
    assert_eq!(platform.copied(ARM9_ADDRESS), Some(arm9.as_slice()));

    let k11 = platform.copied(KERNEL11_ADDRESS).unwrap();
    let info = CapabilityInfo::from_bytes(&k11[K11_FREE + 4..K11_FREE + 0x14]).unwrap();
    assert_eq!((info.version_major, info.version_minor, info.version_build), (7, 0, 0));
    assert!(info.is_release());
    assert_eq!(info.commit_hash, 0x1234_5678);

    let mut expected = native_kernel11();
    expected[K11_FREE..K11_FREE + 4].fill(0xCC);
    expected[K11_FREE + 4..K11_FREE + 0x14].copy_from_slice(&info.to_bytes());
    let entry = K11_SVC_TABLE + SVC_GET_CFW_INFO * 4;
    expected[entry..entry + 4].copy_from_slice(&(K11_BASE_VA + K11_FREE as u32).to_le_bytes());
    assert_eq!(k11, expected.as_slice());

    // The loader sysmodule is swapped for the injector
    assert_eq!(platform.copied(SECTION0_ADDRESS), Some(PAYLOADS.injector));
}

#[test]
fn test_native_firm_without_process9_is_fatal() {
    let mut arm9 = native_arm9();
    arm9[P9_MARKER..P9_MARKER + 4].fill(0);

    let (result, stage, platform) = boot_native(native_firm(native_kernel11(), arm9));

    assert_eq!(result.unwrap_err().to_string(), "Process9 not found in the ARM9 section");
    assert_eq!(stage, BootStage::Patch);
    assert!(platform.events.is_empty());
}

#[test]
fn test_native_firm_without_kernel11_layout_still_boots() {
    let mut kernel11 = native_kernel11();
    kernel11[0x12C..0x130].fill(0x11);

    let (result, _, platform) = boot_native(native_firm(kernel11.clone(), native_arm9()));

    assert_eq!(result.unwrap(), Handoff::Launch { arm9_entry: 0x0801_B01C });
    assert_eq!(platform.copied(KERNEL11_ADDRESS), Some(kernel11.as_slice()));

    // Process9 patches do not depend on Kernel11
    let arm9 = platform.copied(ARM9_ADDRESS).unwrap();
    assert_eq!(&arm9[P9_CODE + 0x10..P9_CODE + 0x12], &[0x00, 0x20]);
}
