// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! An arguments type for the binary interface of this library.

use std::path::PathBuf;

use clap::Parser;

use crate::backend::SocVariant;

#[derive(Parser, Debug, Default)]
#[clap(version, about, long_about = None)]
pub struct VtsArgs {
    /// Load settings from a YAML file. Command line values take precedence.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Firmware image, or a directory holding the SoC's default image.
    #[clap(long)]
    pub firmware: Option<PathBuf>,

    /// SoC variant to drive.
    #[clap(long, value_enum)]
    pub soc: Option<SocVariant>,

    /// Restart the core in place after a firmware fault instead of
    /// escalating to the watchdog.
    #[clap(long)]
    pub silent_reset: bool,

    /// Silent reset attempts before escalating.
    #[clap(long)]
    pub max_recovery: Option<u32>,

    /// Directory receiving firmware logs and dumps.
    #[clap(long)]
    pub log_dir: Option<PathBuf>,

    /// Attach a full SRAM copy to diagnostic dumps.
    #[clap(long)]
    pub full_sram_dump: bool,

    /// Hand the firmware to the verifying loader.
    #[clap(long)]
    pub verified_boot: bool,
}
