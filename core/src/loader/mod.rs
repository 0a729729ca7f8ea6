/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

//! Runtime patching of title code, run by the injected `loader` sysmodule right
//! before a process is created.

pub mod locale;
pub mod titles;

use std::cell::OnceCell;
use std::fmt;

use log::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::patches::CapabilityInfo;
use crate::patches::capability::CAPABILITY_SIZE;

use locale::{LOCALE_FILE_SIZE, Locale};
use titles::{MAX_CUSTOM_VERSION_LEN, TitleContext, TitlePatch};

pub const CODE_SECTIONS_DIR: &str = "/puma/code_sections";
pub const LOCALES_DIR: &str = "/puma/locales";
pub const COUNTRY_PATH: &str = "/puma/locales/country.txt";
pub const CUSTOM_VERSION_PATH: &str = "/puma/customversion.txt";
/// On the NAND, checked when patching `cfg`.
pub const SECURE_INFO_C_PATH: &str = "/sys/SecureInfo_C";

/// Title id of a process being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

impl ProgramId {
    /// Regular applications have the `00040000` high title id.
    pub fn is_application(self) -> bool {
        self.0 >> 36 == 0x000_4000
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// File and service access available to the loader process.
pub trait TitleFiles {
    /// Raw record returned by `svcGetCFWInfo`.
    fn cfw_info(&mut self) -> [u8; CAPABILITY_SIZE];
    /// Opens the SD archive root, which brings the card up under SAFE_FIRM.
    fn init_sd(&mut self);
    fn sd_file_size(&mut self, path: &str) -> Option<u64>;
    /// Up to `len` bytes from the start of an SD file.
    fn read_sd_file(&mut self, path: &str, len: usize) -> Option<Vec<u8>>;
    fn nand_file_exists(&mut self, path: &str) -> bool;
}

pub struct LoaderSession<F> {
    files: F,
    info: OnceCell<Option<CapabilityInfo>>,
    secure_info_c: bool,
}

impl<F: TitleFiles> LoaderSession<F> {
    pub fn new(files: F) -> Self {
        Self { files, info: OnceCell::new(), secure_info_c: false }
    }

    pub fn files(&self) -> &F {
        &self.files
    }

    /// Settings the FIRM was booted with, fetched once. Without a record every
    /// option reads as disabled.
    pub fn config(&mut self) -> Config {
        let files = &mut self.files;
        let info = self.info.get_or_init(|| {
            let info = CapabilityInfo::from_bytes(&files.cfw_info());
            if let Some(info) = info {
                debug!("Booted with config 0x{:08X}", info.config);
                if Config::from_raw(info.config).safe_mode() {
                    files.init_sd();
                }
            }
            info
        });

        Config::from_raw(info.map_or(0, |info| info.config))
    }

    fn read_exact(&mut self, path: &str, len: usize) -> Option<Vec<u8>> {
        self.files.read_sd_file(path, len).filter(|data| data.len() == len)
    }

    /// Applies every patch that concerns `id` to its `.code`. Returns the number
    /// of writes.
    pub fn patch_code(&mut self, id: ProgramId, code: &mut [u8]) -> Result<usize> {
        let Some(entry) = TitlePatch::lookup(id) else {
            return Ok(0);
        };

        let writes = entry.apply(id, code, self)?;
        if writes > 0 {
            info!("{id}: {writes} patch(es) applied");
        }
        Ok(writes)
    }
}

impl<F: TitleFiles> TitleContext for LoaderSession<F> {
    fn config(&mut self) -> Config {
        LoaderSession::config(self)
    }

    fn country(&mut self) -> Option<[u8; 2]> {
        let raw = self.read_exact(COUNTRY_PATH, 2)?;
        Some([raw[0], raw[1]])
    }

    fn version_label(&mut self, config: Config) -> Vec<u8> {
        let custom = self
            .files
            .sd_file_size(CUSTOM_VERSION_PATH)
            .and_then(|size| usize::try_from(size).ok())
            .filter(|&size| size <= MAX_CUSTOM_VERSION_LEN)
            .and_then(|size| self.read_exact(CUSTOM_VERSION_PATH, size))
            .and_then(|raw| titles::custom_version_label(&raw));

        custom.unwrap_or_else(|| titles::version_label(config.nand_source(), config.firm_source()))
    }

    /// Only a positive answer is remembered; the file may appear later.
    fn secure_info_c_exists(&mut self) -> bool {
        if !self.secure_info_c {
            self.secure_info_c = self.files.nand_file_exists(SECURE_INFO_C_PATH);
        }
        self.secure_info_c
    }

    /// External `.code` replacement plus region and language emulation.
    fn patch_application(&mut self, id: ProgramId, code: &mut [u8]) -> Result<usize> {
        let mut writes = 0;

        let section_path = format!("{CODE_SECTIONS_DIR}/{id}.bin");
        if let Some(size) = self.files.sd_file_size(&section_path)
            && let Ok(size) = usize::try_from(size)
            && size <= code.len()
            && let Some(section) = self.read_exact(&section_path, size)
        {
            code[..size].copy_from_slice(&section);
            info!("{id}: .code replaced by {section_path}");
            writes += 1;
        }

        let locale_path = format!("{LOCALES_DIR}/{id}.txt");
        let Some(locale) = self
            .files
            .sd_file_size(&locale_path)
            .filter(|&size| size == LOCALE_FILE_SIZE as u64)
            .and_then(|_| self.read_exact(&locale_path, LOCALE_FILE_SIZE))
            .and_then(|raw| Locale::parse(&raw))
        else {
            return Ok(writes);
        };

        let Some((blk2_end, handle)) = locale::find_cfg_offsets(code) else {
            debug!("{id}: no cfg:u accessor found");
            return Ok(writes);
        };

        if let Some(language) = locale.language
            && locale::patch_cfg_get_language(code, language, blk2_end)?
        {
            writes += 1;
        }
        if let Some(region) = locale.region
            && locale::patch_cfg_get_region(code, region, handle)?
        {
            writes += 1;
        }

        Ok(writes)
    }
}
