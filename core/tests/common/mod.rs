/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use puma::config::menu::ConfigMenu;
use puma::config::pin::PinPrompt;
use puma::platform::{ConsoleModel, Crypto, Interactive, NandTarget, Platform, Storage};
use puma::{BuildInfo, Payloads, Result};

pub const BUILD: BuildInfo<'static> = BuildInfo { revision: "v7.0", commit_hash: 0x1234_5678 };

pub const PAYLOADS: Payloads<'static> = Payloads {
    reboot: &[0xAA; 0x40],
    emunand: &[0xBB; 0x40],
    svc_get_cfw_info: b"\xCC\xCC\xCC\xCCLUMA\0\0\0\0\0\0\0\0\0\0\0\0",
    k11_modules: &[0xDD; 0x20],
    injector: &[0xEE; 0x200],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEvent {
    Copy { address: u32, len: usize },
    Write { address: u32, value: u32 },
    DeinitScreens,
    FlushCaches,
}

pub struct FakePlatform {
    pub model: ConsoleModel,
    pub a9lh: bool,
    pub boot_env: u32,
    pub launch_params: [u16; 8],
    /// Returned by successive `held_buttons` calls, the last value repeats.
    pub held: VecDeque<u32>,
    pub events: Vec<HwEvent>,
    /// Bytes of every `copy_to_memory`, by destination.
    pub memory: Vec<(u32, Vec<u8>)>,
}

impl FakePlatform {
    pub fn cold(model: ConsoleModel) -> Self {
        Self {
            model,
            a9lh: true,
            boot_env: 0,
            launch_params: [0; 8],
            held: VecDeque::from([0]),
            events: Vec::new(),
            memory: Vec::new(),
        }
    }

    /// Relaunch into the FIRM with launch digit `digit`.
    pub fn relaunch(model: ConsoleModel, digit: u8) -> Self {
        let mut platform = Self::cold(model);
        platform.launch_params[5] = u16::from(digit);
        platform
    }

    pub fn holding(mut self, buttons: u32) -> Self {
        self.held = VecDeque::from([buttons]);
        self
    }

    /// Last data copied to `address`.
    pub fn copied(&self, address: u32) -> Option<&[u8]> {
        self.memory.iter().rev().find(|(at, _)| *at == address).map(|(_, data)| data.as_slice())
    }
}

impl Platform for FakePlatform {
    fn console_model(&self) -> ConsoleModel {
        self.model
    }
    fn is_dev_unit(&self) -> bool {
        false
    }
    fn is_a9lh(&self) -> bool {
        self.a9lh
    }
    fn boot_env(&self) -> u32 {
        self.boot_env
    }
    fn launch_params(&self) -> [u16; 8] {
        self.launch_params
    }
    fn held_buttons(&mut self) -> u32 {
        if self.held.len() > 1 { self.held.pop_front().unwrap_or(0) } else { self.held.front().copied().unwrap_or(0) }
    }
    fn copy_to_memory(&mut self, address: u32, data: &[u8]) {
        self.events.push(HwEvent::Copy { address, len: data.len() });
        self.memory.push((address, data.to_vec()));
    }
    fn write_u32(&mut self, address: u32, value: u32) {
        self.events.push(HwEvent::Write { address, value });
    }
    fn deinit_screens(&mut self) {
        self.events.push(HwEvent::DeinitScreens);
    }
    fn flush_caches(&mut self) {
        self.events.push(HwEvent::FlushCaches);
    }
    fn jump(&mut self, entry: u32) -> ! {
        panic!("jump to 0x{entry:08X}")
    }
    fn chainload(&mut self, payload: &[u8]) -> ! {
        panic!("chainload of {} bytes", payload.len())
    }
    fn halt(&mut self, message: &str) -> ! {
        panic!("halt: {message}")
    }
    fn reboot(&mut self) -> ! {
        panic!("reboot")
    }
    fn power_off(&mut self) -> ! {
        panic!("power off")
    }
}

#[derive(Default)]
pub struct FakeStorage {
    pub files: HashMap<String, Vec<u8>>,
    pub sd_sectors: HashMap<u32, Vec<u8>>,
    pub nand_sectors: u32,
    pub mounted: Vec<NandTarget>,
    pub writes: Vec<String>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self { nand_sectors: 0x1D_7800, ..Default::default() }
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.files.insert(path.to_owned(), data);
        self
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len() && name.starts_with(prefix) && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

impl Storage for FakeStorage {
    fn read_file(&mut self, path: &str, max_size: usize) -> Option<Vec<u8>> {
        let data = self.files.get(path)?;
        (max_size == 0 || data.len() <= max_size).then(|| data.clone())
    }
    fn file_size(&mut self, path: &str) -> Option<usize> {
        self.files.get(path).map(Vec::len)
    }
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.writes.push(path.to_owned());
        self.files.insert(path.to_owned(), data.to_vec());
        Ok(())
    }
    fn delete_file(&mut self, path: &str) {
        self.files.remove(path);
    }
    fn list_dir(&mut self, dir: &str) -> Vec<String> {
        let prefix = format!("{dir}/");
        self.files.keys().filter_map(|path| path.strip_prefix(&prefix)).filter(|n| !n.contains('/')).map(str::to_owned).collect()
    }
    fn find_first(&mut self, dir: &str, pattern: &str) -> Option<String> {
        let mut names = self.list_dir(dir);
        names.sort();
        names.into_iter().find(|name| wildcard_match(pattern, name))
    }
    fn read_sd_sectors(&mut self, sector: u32, _count: u32) -> Option<Vec<u8>> {
        Some(self.sd_sectors.get(&sector).cloned().unwrap_or_else(|| vec![0; 0x200]))
    }
    fn nand_sectors(&mut self) -> u32 {
        self.nand_sectors
    }
    fn mount_ctrnand(&mut self, target: NandTarget) -> Result<()> {
        self.mounted.push(target);
        Ok(())
    }
}

/// NAND contents are stored already decrypted.
#[derive(Default)]
pub struct FakeCrypto {
    pub decrypted: usize,
}

impl Crypto for FakeCrypto {
    fn decrypt_exefs(&mut self, _content: &mut Vec<u8>) -> Result<()> {
        self.decrypted += 1;
        Ok(())
    }
    fn arm9_loader(&mut self, _arm9: &mut [u8]) -> Result<()> {
        Ok(())
    }
    fn set_rsa_mod0_keys(&mut self) {}
    fn pin_key_material(&mut self) -> ([u8; 16], [u8; 16]) {
        ([0x42; 16], [0x24; 16])
    }
}

/// Replays scripted key presses.
#[derive(Default)]
pub struct FakeUi {
    pub inputs: VecDeque<u32>,
    pub menu_draws: usize,
    pub pin_prompts: usize,
    pub splashes: usize,
}

impl FakeUi {
    pub fn pressing(keys: &[u32]) -> Self {
        Self { inputs: keys.iter().copied().collect(), ..Default::default() }
    }
}

impl Interactive for FakeUi {
    fn wait_input(&mut self) -> u32 {
        self.inputs.pop_front().expect("the boot asked for more input than scripted")
    }
    fn draw_config_menu(&mut self, _menu: &ConfigMenu) {
        self.menu_draws += 1;
    }
    fn draw_pin_prompt(&mut self, _prompt: &PinPrompt) {
        self.pin_prompts += 1;
    }
    fn set_brightness(&mut self, _level: u32) {}
    fn show_splash(&mut self) -> bool {
        self.splashes += 1;
        false
    }
    fn settle(&mut self) {}
}

/// FIRM image with `(address, payload)` sections after the header. Hashes are
/// left zeroed, which only matters for SD replacements.
pub fn build_firm(arm11_entry: u32, arm9_entry: u32, sections: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut data = vec![0u8; 0x100];
    data[..4].copy_from_slice(b"FIRM");
    data[0x08..0x0C].copy_from_slice(&arm11_entry.to_le_bytes());
    data[0x0C..0x10].copy_from_slice(&arm9_entry.to_le_bytes());

    for (i, (address, payload)) in sections.iter().enumerate() {
        let offset = data.len() as u32;
        let hdr = 0x40 + i * 0x30;
        data[hdr..hdr + 4].copy_from_slice(&offset.to_le_bytes());
        data[hdr + 4..hdr + 8].copy_from_slice(&address.to_le_bytes());
        data[hdr + 8..hdr + 12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(payload);
    }

    data
}

/// Configuration record as written by a previous boot.
pub fn config_record(config: u32) -> Vec<u8> {
    let mut record = b"CONF".to_vec();
    record.extend_from_slice(&11u16.to_le_bytes());
    record.extend_from_slice(&0u16.to_le_bytes());
    record.extend_from_slice(&config.to_le_bytes());
    record
}
