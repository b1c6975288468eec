// VTS voice trigger coprocessor runtime control
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![deny(
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore
)]

pub mod args;
pub mod backend;
pub mod clock;
pub mod control;
pub mod device;
pub mod dump;
pub mod ipc;
pub mod irq;
pub mod mic;
pub mod poll;
pub mod power;
pub mod protocol;
pub mod simulator;
pub mod state;
pub mod worker;

use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use clap::Parser;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use log::{error, info, warn};
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::{
    args::VtsArgs,
    backend::{HardwareBackend, MicType, SocProfile, SocVariant},
    clock::SYS_SEL_RATES,
    control::{execute, ControlLine},
    device::{DeviceConfig, VtsDevice},
    protocol::{EVENT_READY, EVENT_RECOVERY, EVENT_STOP_POLLING, EVENT_TRIGGERED, MAX_PHRASE_ID},
    simulator::SimulatedVts,
};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to daemon configuration and start up
pub enum Error {
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(Box<figment::Error>),
    #[error("Invalid setting {0}: {1}")]
    InvalidSetting(&'static str, u32),
    #[error("Could not read firmware {0}: {1}")]
    FirmwareRead(PathBuf, io::Error),
    #[error("Could not create backend: {0}")]
    CouldNotCreateBackend(backend::Error),
    #[error("Could not create device: {0}")]
    CouldNotCreateDevice(device::Error),
    #[error("Could not spawn event thread: {0}")]
    ThreadSpawn(io::Error),
    #[error("Control input failed: {0}")]
    Input(io::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    firmware: Option<PathBuf>,
    soc: Option<SocVariant>,
    silent_reset: Option<bool>,
    max_recovery: Option<u32>,
    log_dir: Option<PathBuf>,
    full_sram_dump: Option<bool>,
    verified_boot: Option<bool>,
    active_phrase: Option<u8>,
    mic: Option<MicType>,
    mic_num: Option<u32>,
    sys_sel: Option<u32>,
    sysclk_div: Option<u32>,
    fw_log: Option<bool>,
}

/// Everything needed to bring up one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VtsConfig {
    pub soc: SocVariant,
    pub firmware: Option<PathBuf>,
    pub device: DeviceConfig,
}

impl VtsConfig {
    /// A directory resolves to the SoC's default image name.
    pub fn firmware_path(&self) -> Option<PathBuf> {
        let path = self.firmware.as_ref()?;
        if path.is_dir() {
            Some(path.join(SocProfile::new(self.soc).firmware_name))
        } else {
            Some(path.clone())
        }
    }
}

impl TryFrom<VtsArgs> for VtsConfig {
    type Error = Error;

    fn try_from(args: VtsArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => Figment::new()
                .merge(Yaml::file(path))
                .extract::<ConfigFile>()
                .map_err(|e| Error::ConfigParse(Box::new(e)))?,
            None => ConfigFile::default(),
        };

        let mut device = DeviceConfig {
            silent_reset: args.silent_reset || file.silent_reset.unwrap_or(false),
            verified_boot: args.verified_boot || file.verified_boot.unwrap_or(false),
            full_sram_dump: args.full_sram_dump || file.full_sram_dump.unwrap_or(false),
            log_dir: args.log_dir.or(file.log_dir),
            ..DeviceConfig::default()
        };
        if let Some(max) = args.max_recovery.or(file.max_recovery) {
            device.max_recovery_attempts = max;
        }

        let settings = &mut device.settings;
        if let Some(phrase) = file.active_phrase {
            if phrase > MAX_PHRASE_ID {
                return Err(Error::InvalidSetting("active_phrase", phrase.into()));
            }
            settings.active_phrase = phrase;
        }
        if let Some(mic) = file.mic {
            settings.mic = mic;
        }
        if let Some(mic_num) = file.mic_num {
            if !(1..=4).contains(&mic_num) {
                return Err(Error::InvalidSetting("mic_num", mic_num));
            }
            settings.mic_num = mic_num;
        }
        if let Some(sys_sel) = file.sys_sel {
            if sys_sel as usize >= SYS_SEL_RATES.len() {
                return Err(Error::InvalidSetting("sys_sel", sys_sel));
            }
            settings.sys_sel = sys_sel;
        }
        if let Some(div) = file.sysclk_div {
            if div == 0 {
                return Err(Error::InvalidSetting("sysclk_div", div));
            }
            settings.sysclk_div = div;
        }
        settings.fw_log = file.fw_log.unwrap_or(false);

        Ok(Self {
            soc: args.soc.or(file.soc).unwrap_or_default(),
            firmware: args.firmware.or(file.firmware),
            device,
        })
    }
}

/// Watch poll events, restarting the core when the fault handler asks
/// for it. Ends on `EVENT_STOP_POLLING` or once the device is gone.
fn spawn_event_watch<B: HardwareBackend>(dev: Weak<VtsDevice<B>>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vts-events".to_string())
        .spawn(move || loop {
            let Some(dev) = dev.upgrade() else {
                break;
            };
            let Some(bits) = dev.wait_poll_event(EVENT_POLL_INTERVAL) else {
                continue;
            };

            info!("poll event {bits:#x}");
            if bits & EVENT_STOP_POLLING != 0 {
                dev.poll_events().clear(EVENT_STOP_POLLING);
                break;
            }
            if bits & EVENT_TRIGGERED != 0 {
                info!("voice trigger, phrase {}", bits & 0xf);
            }
            if bits & EVENT_RECOVERY != 0 {
                dev.poll_events().clear(EVENT_RECOVERY);
                if let Err(e) = dev.recover() {
                    error!("recovery failed: {e}");
                }
            }
        })
}

/// Execute control lines from `input` until EOF, writing replies to
/// `output`.
pub fn serve<B, R, W>(dev: &VtsDevice<B>, input: R, mut output: W) -> Result<()>
where
    B: HardwareBackend,
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line.map_err(Error::Input)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let reply = match ControlLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => match execute(dev, parsed.command) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("{line}: {e}");
                    format!("error: {e}")
                }
            },
            Err(e) => e.render().to_string(),
        };
        if !reply.is_empty() {
            writeln!(output, "{}", reply.trim_end()).map_err(Error::Input)?;
        }
    }
    Ok(())
}

/// Bring up a simulated device and serve control lines from stdin.
pub fn run(config: VtsConfig) -> Result<()> {
    let backend =
        SimulatedVts::new(SocProfile::new(config.soc)).map_err(Error::CouldNotCreateBackend)?;
    let dev = VtsDevice::new(backend, config.device.clone()).map_err(Error::CouldNotCreateDevice)?;

    match config.firmware_path() {
        Some(path) => {
            let image = fs::read(&path).map_err(|e| Error::FirmwareRead(path.clone(), e))?;
            info!("firmware {} loaded", path.display());
            dev.load_firmware(image);
        }
        None => warn!("no firmware configured, resume will fail"),
    }

    let watcher = spawn_event_watch(Arc::downgrade(&dev)).map_err(Error::ThreadSpawn)?;
    let result = serve(&dev, io::stdin().lock(), io::stdout());

    dev.poll_events().post(EVENT_STOP_POLLING | EVENT_READY);
    if watcher.join().is_err() {
        error!("event thread panicked");
    }
    if let Err(e) = dev.suspend() {
        warn!("suspend on exit: {e}");
    }
    result
}

#[cfg(test)]
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
