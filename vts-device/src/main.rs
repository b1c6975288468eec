// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::process::exit;

use clap::Parser;
use log::error;
use vts_device::{args::VtsArgs, run, VtsConfig};

fn main() {
    env_logger::init();

    let config = match VtsConfig::try_from(VtsArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    if let Err(e) = run(config) {
        error!("{e}");
        exit(1);
    }
}
