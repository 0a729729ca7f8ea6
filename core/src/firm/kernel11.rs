/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::le_u32;
use crate::utilities::arm::decode_branch_target;
use crate::utilities::patching::{find_pattern, patch, write_u32};

const EXCEPTIONS_PAGE_PATTERN: &[u8] = &[0x00, 0xB0, 0x9C, 0xE5];
const FREE_SPACE_PATTERN: &[u8] = &[0xFF; 5];
/// Virtual address of the SVC vector inside the high exception page.
const SVC_VECTOR_VA: u32 = 0xFFFF_0008;
const SVC_TABLE_SLOTS: usize = 0x80;

/// Cursor over the unused 0xFF padding of Kernel11. Every reservation is checked
/// against the actual bytes so a blob is never written over live code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpace {
    offset: usize,
}

impl FreeSpace {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether `len` bytes of filler are still available at the cursor.
    pub fn fits(&self, section: &[u8], len: usize) -> bool {
        self.offset
            .checked_add(len)
            .and_then(|end| section.get(self.offset..end))
            .is_some_and(|run| run.iter().all(|&b| b == 0xFF))
    }

    /// Copies `blob` at the cursor and advances past it. Returns the offset the blob
    /// was written at, or `None` when the padding is too short.
    pub fn inject(&mut self, section: &mut [u8], blob: &[u8]) -> Result<Option<usize>> {
        if !self.fits(section, blob.len()) {
            return Ok(None);
        }

        let at = self.offset;
        patch(section, at, blob)?;
        self.offset += blob.len();
        Ok(Some(at))
    }
}

/// Kernel11 layout facts discovered from section 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel11 {
    /// Virtual address section 1 is mapped at.
    pub base_va: u32,
    pub exceptions_page: usize,
    pub svc_handler: usize,
    pub svc_table: usize,
    pub free_space: FreeSpace,
}

impl Kernel11 {
    pub fn locate(section: &[u8]) -> Result<Self> {
        let exceptions_page = find_pattern(section, EXCEPTIONS_PAGE_PATTERN, 0)
            .and_then(|off| off.checked_sub(0x2C))
            .ok_or_else(|| Error::firmware("Kernel11 exception page not found"))?;

        let svc_branch = le_u32!(section, exceptions_page + 8)
            .ok_or_else(|| Error::firmware("Kernel11 SVC vector out of range"))?;

        // The SVC vector branches backward into the kernel image.
        let pointed = decode_branch_target(SVC_VECTOR_VA, svc_branch);
        let base_va = pointed & 0xFFFF_0000;

        let svc_handler = le_u32!(section, (pointed - base_va) as usize + 8)
            .and_then(|va| va.checked_sub(base_va))
            .map(|off| off as usize)
            .filter(|&off| off < section.len())
            .ok_or_else(|| Error::firmware("Kernel11 SVC handler not found"))?;

        let svc_table = (svc_handler..section.len().saturating_sub(4))
            .step_by(4)
            .find(|&off| le_u32!(section, off) == Some(0))
            .ok_or_else(|| Error::firmware("Kernel11 SVC table not found"))?;

        let free_space = find_pattern(section, FREE_SPACE_PATTERN, 0)
            .map(|off| FreeSpace::new(off + 1))
            .ok_or_else(|| Error::firmware("No free space in Kernel11"))?;

        debug!(
            "Kernel11: base 0x{base_va:08X}, SVC handler 0x{svc_handler:X}, SVC table 0x{svc_table:X}, free space 0x{:X}",
            free_space.offset()
        );

        Ok(Self { base_va, exceptions_page, svc_handler, svc_table, free_space })
    }

    pub fn va_of(&self, offset: usize) -> u32 {
        self.base_va.wrapping_add(offset as u32)
    }

    pub fn offset_of(&self, va: u32) -> Option<usize> {
        va.checked_sub(self.base_va).map(|off| off as usize)
    }

    pub fn svc_entry(&self, section: &[u8], id: usize) -> Option<u32> {
        if id >= SVC_TABLE_SLOTS {
            return None;
        }
        le_u32!(section, self.svc_table + id * 4)
    }

    pub fn set_svc_entry(&self, section: &mut [u8], id: usize, va: u32) -> Result<()> {
        if id >= SVC_TABLE_SLOTS {
            return Err(Error::puma(format!("SVC 0x{id:X} is outside the table")));
        }
        write_u32(section, self.svc_table + id * 4, va)
    }

    /// Copies `blob` into free space and points SVC `id` at it.
    pub fn install_svc(&mut self, section: &mut [u8], id: usize, blob: &[u8]) -> Result<Option<usize>> {
        let Some(at) = self.free_space.inject(section, blob)? else {
            warn!("Not enough Kernel11 free space for SVC 0x{id:X}");
            return Ok(None);
        };

        self.set_svc_entry(section, id, self.va_of(at))?;
        Ok(Some(at))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utilities::arm::encode_b_arm;

    pub const BASE_VA: u32 = 0xFFF0_0000;
    pub const HANDLER: usize = 0x400;
    pub const TABLE: usize = 0x440;
    pub const FREE: usize = 0x800;

    /// Section 1 with an exception page at 0x100, an SVC handler at 0x400 whose
    /// table starts after the first zero word, and 0x100 bytes of free space at 0x800.
    pub fn kernel11_section() -> Vec<u8> {
        let mut data = vec![0x11u8; 0x1000];
        let page = 0x100;
        data[page + 0x2C..page + 0x30].copy_from_slice(EXCEPTIONS_PAGE_PATTERN);

        // Vector at 0xFFFF0008 branches to BASE_VA + 0x200.
        let pointed = BASE_VA + 0x200;
        let branch = encode_b_arm(SVC_VECTOR_VA, pointed).unwrap();
        data[page + 8..page + 12].copy_from_slice(&branch.to_le_bytes());
        data[0x208..0x20C].copy_from_slice(&(BASE_VA + HANDLER as u32).to_le_bytes());

        data[TABLE..TABLE + SVC_TABLE_SLOTS * 4].fill(0);
        data[TABLE + 4..TABLE + 8].copy_from_slice(&0xFFF0_2000u32.to_le_bytes());
        data[0x7FF..0x900].fill(0xFF);
        data
    }

    #[test]
    fn discovers_layout() {
        let data = kernel11_section();
        let k11 = Kernel11::locate(&data).unwrap();

        assert_eq!(k11.base_va, BASE_VA);
        assert_eq!(k11.exceptions_page, 0x100);
        assert_eq!(k11.svc_handler, HANDLER);
        assert_eq!(k11.svc_table, TABLE);
        assert_eq!(k11.free_space.offset(), FREE);
        assert_eq!(k11.svc_entry(&data, 1), Some(0xFFF0_2000));
        assert_eq!(k11.svc_entry(&data, 0x80), None);
    }

    #[test]
    fn install_svc_consumes_free_space() {
        let mut data = kernel11_section();
        let mut k11 = Kernel11::locate(&data).unwrap();

        let at = k11.install_svc(&mut data, 0x2E, &[0xAA; 0x20]).unwrap();
        assert_eq!(at, Some(FREE));
        assert_eq!(k11.svc_entry(&data, 0x2E), Some(BASE_VA + FREE as u32));
        assert_eq!(k11.free_space.offset(), FREE + 0x20);
        assert_eq!(&data[FREE..FREE + 0x20], &[0xAA; 0x20]);
    }

    #[test]
    fn refuses_blob_larger_than_padding() {
        let mut data = kernel11_section();
        let before = data.clone();
        let mut k11 = Kernel11::locate(&data).unwrap();

        assert_eq!(k11.install_svc(&mut data, 0x7B, &[0; 0x101]).unwrap(), None);
        assert_eq!(data, before);
    }

    #[test]
    fn missing_exception_page_is_an_error() {
        assert!(Kernel11::locate(&[0u8; 0x100]).is_err());
    }
}
