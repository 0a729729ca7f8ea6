/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::borrow::Cow;

use log::info;

use crate::error::{Error, Result};
use crate::le_u32;

const CONTENT_SIZE_OFFSET: usize = 0x104;
const NAME_OFFSET: usize = 0x200;
const NAME_LEN: usize = 8;
const MEDIA_UNIT: usize = 0x200;

/// One NCCH system module embedded in FIRM section 0.
#[derive(Debug, Clone, Copy)]
pub struct SysModule<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Splits section 0 into its back-to-back NCCH modules.
pub fn modules(section0: &[u8]) -> Result<Vec<SysModule<'_>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos < section0.len() {
        let units = le_u32!(section0, pos + CONTENT_SIZE_OFFSET)
            .ok_or_else(|| Error::firmware(format!("Truncated sysmodule header at 0x{pos:X}")))?;
        let size = usize::try_from(units)
            .ok()
            .and_then(|units| units.checked_mul(MEDIA_UNIT))
            .ok_or_else(|| Error::firmware(format!("Sysmodule at 0x{pos:X} has an invalid size")))?;
        if size == 0 {
            return Err(Error::firmware(format!("Empty sysmodule at 0x{pos:X}")));
        }

        let data = pos
            .checked_add(size)
            .and_then(|end| section0.get(pos..end))
            .ok_or_else(|| Error::firmware(format!("Sysmodule at 0x{pos:X} overruns section 0")))?;

        let raw_name = data.get(NAME_OFFSET..NAME_OFFSET + NAME_LEN).unwrap_or_default();
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = std::str::from_utf8(&raw_name[..end]).unwrap_or_default();

        out.push(SysModule { name, data });
        pos += size;
    }

    Ok(out)
}

/// Builds the section 0 that gets copied to memory. `replace` may return a substitute
/// for any module; modules it declines are copied verbatim.
pub fn rebuild_section0<'a, F>(section0: &'a [u8], mut replace: F) -> Result<Vec<u8>>
where
    F: FnMut(&SysModule<'a>) -> Option<Cow<'a, [u8]>>,
{
    let mut out = Vec::with_capacity(section0.len());

    for module in modules(section0)? {
        match replace(&module) {
            Some(substitute) => {
                info!("Replacing sysmodule {} (0x{:X} -> 0x{:X} bytes)", module.name, module.data.len(), substitute.len());
                out.extend_from_slice(&substitute);
            }
            None => out.extend_from_slice(module.data),
        }
    }

    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn fake_module(name: &str, units: u32, fill: u8) -> Vec<u8> {
        let mut data = vec![fill; units as usize * MEDIA_UNIT];
        data[CONTENT_SIZE_OFFSET..CONTENT_SIZE_OFFSET + 4].copy_from_slice(&units.to_le_bytes());
        data[NAME_OFFSET..NAME_OFFSET + NAME_LEN].fill(0);
        data[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        data
    }

    #[test]
    fn walks_modules_in_order() {
        let section0 = [fake_module("sm", 2, 1), fake_module("loader", 3, 2), fake_module("pxi", 2, 3)].concat();
        let names: Vec<_> = modules(&section0).unwrap().iter().map(|m| m.name).collect();
        assert_eq!(names, ["sm", "loader", "pxi"]);
    }

    #[test]
    fn replaces_only_the_selected_module() {
        let sm = fake_module("sm", 2, 1);
        let pxi = fake_module("pxi", 2, 3);
        let section0 = [sm.clone(), fake_module("loader", 3, 2), pxi.clone()].concat();
        let injector = vec![0xEEu8; 0x300];

        let rebuilt = rebuild_section0(&section0, |m| {
            (m.name == "loader").then(|| Cow::Borrowed(injector.as_slice()))
        })
        .unwrap();

        assert_eq!(rebuilt, [sm, injector.clone(), pxi].concat());
    }

    #[test]
    fn zero_sized_module_is_rejected() {
        let mut section0 = fake_module("sm", 2, 0);
        section0[CONTENT_SIZE_OFFSET..CONTENT_SIZE_OFFSET + 4].fill(0);
        assert!(modules(&section0).is_err());
    }

    #[test]
    fn oversized_module_is_rejected() {
        let mut section0 = fake_module("sm", 2, 0);
        section0[CONTENT_SIZE_OFFSET..CONTENT_SIZE_OFFSET + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(modules(&section0).is_err());
    }
}
