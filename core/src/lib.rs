/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#[macro_use]
mod macros;

pub mod boot;
pub mod config;
pub mod error;
pub mod firm;
pub mod loader;
pub mod patches;
pub mod platform;
pub mod utilities;

pub use boot::{BootStage, Handoff, Orchestrator};
pub use error::{Error, Result};
pub use loader::{LoaderSession, ProgramId, TitleFiles};
pub use patches::{BuildInfo, CapabilityInfo, Payloads};
