/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncryptMut, KeyIvInit};
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::le_u16;
use crate::platform::{Interactive, Storage, buttons};

pub const PIN_PATH: &str = "/puma/pin.bin";
pub const PIN_MESSAGE_PATH: &str = "/puma/pinmessage.txt";
pub const PIN_MAGIC: &[u8; 4] = b"PINF";
pub const PIN_VERSION_MAJOR: u16 = 1;
pub const PIN_VERSION_MINOR: u16 = 0;
pub const PIN_RECORD_SIZE: usize = 4 + 2 + 2 + 1 + 0x20 + 0x20;

const MAX_MESSAGE_SIZE: usize = 800;
const KEY_LETTERS: &[u8; 12] = b"AB--RLUD--XY";

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Hashes PIN entries with the console-bound AES key so a record copied to another
/// unit never verifies.
pub struct PinHasher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl PinHasher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    pub fn hash(&self, entry: &[u8; 16]) -> [u8; 0x20] {
        let mut enc = Aes128CbcEnc::new(GenericArray::from_slice(&self.key), GenericArray::from_slice(&self.iv));
        let mut block = GenericArray::clone_from_slice(entry);
        enc.encrypt_block_mut(&mut block);

        Sha256::digest(block).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    pub length: u8,
    pub test_hash: [u8; 0x20],
    pub hash: [u8; 0x20],
}

impl PinRecord {
    pub fn new(length: u8, hasher: &PinHasher, entry: &[u8; 16]) -> Self {
        Self { length, test_hash: hasher.hash(&[0; 16]), hash: hasher.hash(entry) }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PIN_RECORD_SIZE
            || &bytes[..4] != PIN_MAGIC
            || le_u16!(bytes, 4)? != PIN_VERSION_MAJOR
            || le_u16!(bytes, 6)? != PIN_VERSION_MINOR
        {
            return None;
        }

        let mut test_hash = [0u8; 0x20];
        let mut hash = [0u8; 0x20];
        test_hash.copy_from_slice(&bytes[9..0x29]);
        hash.copy_from_slice(&bytes[0x29..0x49]);

        Some(Self { length: bytes[8], test_hash, hash })
    }

    pub fn to_bytes(&self) -> [u8; PIN_RECORD_SIZE] {
        let mut out = [0u8; PIN_RECORD_SIZE];
        out[..4].copy_from_slice(PIN_MAGIC);
        out[4..6].copy_from_slice(&PIN_VERSION_MAJOR.to_le_bytes());
        out[6..8].copy_from_slice(&PIN_VERSION_MINOR.to_le_bytes());
        out[8] = self.length;
        out[9..0x29].copy_from_slice(&self.test_hash);
        out[0x29..0x49].copy_from_slice(&self.hash);
        out
    }

    /// The test hash only matches on the console the record was made on.
    pub fn belongs_to(&self, hasher: &PinHasher) -> bool {
        self.test_hash == hasher.hash(&[0; 16])
    }
}

/// Letter shown for a key press. The highest pressed button wins.
pub fn key_letter(pressed: u32) -> u8 {
    if pressed == 0 {
        return b'-';
    }
    let bit = 31 - pressed.leading_zeros() as usize;
    KEY_LETTERS.get(bit).copied().unwrap_or(b'-')
}

/// Zero padded sequence of entered key letters.
#[derive(Debug, Clone, Default)]
pub struct PinEntry {
    keys: [u8; 16],
    count: usize,
}

impl PinEntry {
    pub fn push(&mut self, pressed: u32) -> u8 {
        let letter = key_letter(pressed);
        if self.count < self.keys.len() {
            self.keys[self.count] = letter;
            self.count += 1;
        }
        letter
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn keys(&self) -> &[u8; 16] {
        &self.keys
    }

    pub fn entered(&self) -> &[u8] {
        &self.keys[..self.count]
    }
}

/// State handed to the screen on every PIN key press.
#[derive(Debug, Clone)]
pub struct PinPrompt<'a> {
    pub title: &'a str,
    pub length: u8,
    pub entered: &'a [u8],
    pub message: Option<&'a str>,
    pub wrong: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    /// No usable record for the selected length, or it belongs to another console.
    NoPin,
    Unlocked,
    /// START was pressed at the prompt.
    PowerOff,
}

fn wait_pin_keys(ui: &mut dyn Interactive) -> u32 {
    loop {
        let pressed = ui.wait_input();
        if pressed & buttons::PIN != 0 {
            return pressed;
        }
    }
}

/// Asks for the PIN until it is entered correctly.
pub fn verify_pin(storage: &mut dyn Storage, ui: &mut dyn Interactive, hasher: &PinHasher, length: u8) -> PinCheck {
    let Some(record) = storage.read_file(PIN_PATH, PIN_RECORD_SIZE).as_deref().and_then(PinRecord::parse) else {
        return PinCheck::NoPin;
    };
    if record.length != length {
        warn!("PIN record length {} does not match the selected {}", record.length, length);
        return PinCheck::NoPin;
    }
    if !record.belongs_to(hasher) {
        warn!("PIN record was created on another console");
        return PinCheck::NoPin;
    }

    let message = storage
        .read_file(PIN_MESSAGE_PATH, MAX_MESSAGE_SIZE - 1)
        .filter(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(&m).into_owned());

    let mut entry = PinEntry::default();
    let mut wrong = false;

    loop {
        ui.draw_pin_prompt(&PinPrompt {
            title: "Press START to shutdown or enter PIN to proceed",
            length,
            entered: entry.entered(),
            message: message.as_deref(),
            wrong,
        });

        let pressed = wait_pin_keys(ui);
        if pressed & buttons::START != 0 {
            return PinCheck::PowerOff;
        }

        entry.push(pressed & buttons::PIN);

        if entry.len() >= length as usize {
            if hasher.hash(entry.keys()) == record.hash {
                info!("PIN accepted");
                return PinCheck::Unlocked;
            }
            entry = PinEntry::default();
            wrong = true;
        }
    }
}

/// Records a new PIN of `length` keys. With `allow_skip`, START keeps the old
/// record and returns `false`.
pub fn new_pin(
    storage: &mut dyn Storage,
    ui: &mut dyn Interactive,
    hasher: &PinHasher,
    length: u8,
    allow_skip: bool,
) -> Result<bool> {
    let title = if allow_skip { "Press START to skip or enter a new PIN" } else { "Enter a new PIN to proceed" };
    let mut entry = PinEntry::default();

    while entry.len() < length as usize {
        ui.draw_pin_prompt(&PinPrompt { title, length, entered: entry.entered(), message: None, wrong: false });

        let mut pressed = wait_pin_keys(ui) & buttons::PIN;
        if !allow_skip {
            pressed &= !buttons::START;
        }
        if pressed & buttons::START != 0 {
            return Ok(false);
        }
        if pressed == 0 {
            continue;
        }

        entry.push(pressed);
    }

    let record = PinRecord::new(length, hasher, entry.keys());
    storage
        .write_file(PIN_PATH, &record.to_bytes())
        .map_err(|_| Error::io("Error writing the PIN file"))?;

    info!("New {length}-key PIN saved");
    Ok(true)
}
