/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info};

use crate::config::pin::{PIN_PATH, PinHasher, new_pin};
use crate::config::{BOOT_BITS_MASK, Config, MultiOption, SingleOption};
use crate::error::Result;
use crate::platform::{Interactive, Storage, buttons};

/// What a key press did to the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuEvent {
    Ignored,
    Moved,
    Toggled,
    /// Brightness changed and should be applied right away.
    Brightness(u32),
    Saved,
}

/// Cursor and pending values of the configuration menu. Drawing is left to the
/// [`Interactive`](crate::platform::Interactive) implementation.
#[derive(Debug, Clone)]
pub struct ConfigMenu {
    multi: Vec<(MultiOption, u32)>,
    single: Vec<(SingleOption, bool)>,
    selected: usize,
    is_n3ds: bool,
    boot_bits: u32,
}

impl ConfigMenu {
    pub fn new(config: Config, is_n3ds: bool) -> Self {
        let multi = MultiOption::ALL.iter().map(|&o| (o, config.multi(o))).collect::<Vec<_>>();
        let single = SingleOption::ALL
            .iter()
            .filter(|o| o.bit().is_some())
            .map(|&o| (o, config.single(o)))
            .collect();

        Self { selected: multi.len(), multi, single, is_n3ds, boot_bits: config.raw() & BOOT_BITS_MASK }
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn multi_options(&self) -> &[(MultiOption, u32)] {
        &self.multi
    }

    pub fn single_options(&self) -> &[(SingleOption, bool)] {
        &self.single
    }

    /// The New 3DS CPU row is hidden on Old 3DS.
    pub fn is_visible(&self, index: usize) -> bool {
        self.is_n3ds || index != MultiOption::NewCpu as usize
    }

    fn last_index(&self) -> usize {
        self.multi.len() + self.single.len() - 1
    }

    pub fn description(&self) -> &'static str {
        match self.multi.get(self.selected) {
            Some((option, _)) => option.label(),
            None => self.single[self.selected - self.multi.len()].0.label(),
        }
    }

    pub fn handle(&mut self, pressed: u32) -> MenuEvent {
        let hidden = MultiOption::NewCpu as usize;

        let next = match pressed {
            buttons::START => return MenuEvent::Saved,
            buttons::A => return self.toggle(),
            buttons::UP if self.selected == 0 => self.last_index(),
            buttons::UP if !self.is_n3ds && self.selected == hidden + 1 => self.selected - 2,
            buttons::UP => self.selected - 1,
            buttons::DOWN if self.selected == self.last_index() => 0,
            buttons::DOWN if !self.is_n3ds && self.selected + 1 == hidden => self.selected + 2,
            buttons::DOWN => self.selected + 1,
            buttons::LEFT => 0,
            buttons::RIGHT => self.last_index(),
            _ => return MenuEvent::Ignored,
        };

        if next == self.selected {
            return MenuEvent::Ignored;
        }
        self.selected = next;
        MenuEvent::Moved
    }

    fn toggle(&mut self) -> MenuEvent {
        if let Some((option, value)) = self.multi.get_mut(self.selected) {
            *value = (*value + 1) % option.choices();
            debug!("{:?} -> {}", option, value);

            return match option {
                MultiOption::Brightness => MenuEvent::Brightness(*value),
                _ => MenuEvent::Toggled,
            };
        }

        let (_, enabled) = &mut self.single[self.selected - self.multi.len()];
        *enabled = !*enabled;
        MenuEvent::Toggled
    }

    /// The new configuration word, keeping the last boot selection bits.
    pub fn finish(&self) -> Config {
        let mut config = Config::from_raw(self.boot_bits);
        for &(option, value) in &self.multi {
            config.set_multi(option, value);
        }
        for &(option, enabled) in &self.single {
            config.set_single(option, enabled);
        }
        config
    }
}

/// Shows the menu until START and returns the new configuration. The PIN record
/// follows the PIN option: enabling it asks for a new PIN (skippable when the old
/// one was just verified and the length did not change), disabling it deletes it.
pub fn run_config_menu(
    ui: &mut dyn Interactive,
    storage: &mut dyn Storage,
    hasher: &PinHasher,
    current: Config,
    is_n3ds: bool,
    pin_unlocked: bool,
) -> Result<Config> {
    let mut menu = ConfigMenu::new(current, is_n3ds);
    ui.draw_config_menu(&menu);

    loop {
        match menu.handle(ui.wait_input() & buttons::MENU) {
            MenuEvent::Saved => break,
            MenuEvent::Ignored => continue,
            MenuEvent::Brightness(level) => ui.set_brightness(level),
            MenuEvent::Moved | MenuEvent::Toggled => {}
        }
        ui.draw_config_menu(&menu);
    }

    let config = menu.finish();
    info!("Configuration set to {config:?}");

    let old_pin = current.multi(MultiOption::Pin);
    match config.pin_length() {
        Some(length) => {
            let allow_skip = pin_unlocked && config.multi(MultiOption::Pin) == old_pin;
            new_pin(storage, ui, hasher, length, allow_skip)?;
        }
        None if pin_unlocked => storage.delete_file(PIN_PATH),
        None => {}
    }

    ui.settle();
    Ok(config)
}
