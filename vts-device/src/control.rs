// VTS control surface
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fmt::Write as _, fs, io, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use thiserror::Error as ThisError;

use crate::{
    backend::{HardwareBackend, MicType},
    device::{self, VtsDevice},
    mic::{validate_phrase, MicConsumer},
    protocol::*,
};

#[derive(Debug, ThisError)]
/// Errors returned by control commands
pub enum Error {
    #[error("{0}")]
    Device(#[from] device::Error),
    #[error("Could not read {0}: {1}")]
    ReadFile(PathBuf, io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(self) -> bool {
        self == Switch::On
    }
}

/// One control line, e.g. `recognition on` or `set-param 8 320 1 0`.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(no_binary_name = true, disable_version_flag = true)]
pub struct ControlLine {
    #[command(subcommand)]
    pub command: ControlCommand,
}

fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}

fn parse_word(s: &str) -> std::result::Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("`{s}` does not fit in 32 bits"))
}

fn parse_offset(s: &str) -> std::result::Result<usize, String> {
    let value = parse_number(s)?;
    usize::try_from(value).map_err(|_| format!("`{s}` is too large"))
}

/// Active phrase selector value meaning no phrase.
pub const PHRASE_NONE: u8 = 0;

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Voice recognition mode for the active phrase.
    Recognition { mode: Switch },
    /// Select the active phrase, 0 for none.
    Phrase {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=MAX_PHRASE_ID as i64))]
        id: u8,
    },
    /// Audio kept ahead of the trigger point, in milliseconds.
    TriggerValue {
        #[arg(value_parser = clap::value_parser!(u32).range(0..=TRIGGER_VALUE_MAX_MS as i64))]
        ms: u32,
    },
    ForceReset,
    /// Make the firmware report a trigger for `phrase`.
    ForceTrigger {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=MAX_PHRASE_ID as i64))]
        phrase: u8,
    },
    /// Make the firmware raise its error interrupt.
    ForceError,
    MicNum {
        #[arg(value_parser = clap::value_parser!(u32).range(1..=4))]
        channels: u32,
    },
    SysclkDiv {
        #[arg(value_parser = clap::value_parser!(u32).range(1..=16))]
        div: u32,
    },
    MicPath { mic: MicType },
    AudioDump { mode: Switch },
    LogDump { mode: Switch },
    /// Stage a sound model, optionally at an SRAM offset.
    LoadModel {
        file: PathBuf,
        #[arg(value_parser = parse_offset)]
        offset: Option<usize>,
    },
    /// Read and clear pending poll events.
    ReadEvent,
    /// Wake up pollers with a stop event.
    ExitPolling,
    /// Send a raw message.
    SetParam {
        #[arg(value_parser = parse_word)]
        msg: u32,
        #[arg(value_parser = parse_word, default_value = "0")]
        w0: u32,
        #[arg(value_parser = parse_word, default_value = "0")]
        w1: u32,
        #[arg(value_parser = parse_word, default_value = "0")]
        w2: u32,
    },
    Version,
    /// Debug command, `TESTFWLOG` prints the SRAM log.
    Cmd { text: String },
    Status,
    VoiceCall { mode: Switch },
    Suspend,
    Resume,
}

impl<B: HardwareBackend> VtsDevice<B> {
    /// Turn recognition of the active phrase on or off. Turning it off
    /// powers the core down once nothing else holds it.
    pub fn set_recognition_mode(&self, on: bool) -> device::Result<()> {
        let phrase = self.settings.lock().unwrap().active_phrase;
        validate_phrase(phrase)?;

        if on {
            if phrase == PHRASE_NONE {
                return Err(device::Error::InvalidPhrase(phrase));
            }
            self.resume()?;
            return self.start_recognition(phrase);
        }

        if phrase != PHRASE_NONE {
            self.stop_recognition(phrase)?;
        }
        let record = self.mic_ready() & MicConsumer::Record.bit() != 0;
        if self.active_phrases() == 0 && !record {
            self.suspend()?;
        }
        Ok(())
    }

    pub fn select_phrase(&self, id: u8) -> device::Result<()> {
        validate_phrase(id)?;
        self.settings.lock().unwrap().active_phrase = id;
        Ok(())
    }

    /// Ask the firmware to keep `ms` of audio ahead of the trigger.
    pub fn set_trigger_value(&self, ms: u32) -> device::Result<()> {
        if ms > TRIGGER_VALUE_MAX_MS {
            return Err(device::Error::InvalidTriggerValue(ms));
        }
        if !self.is_running() {
            return Err(device::Error::NotRunning);
        }

        let target = ms * BYTES_PER_MS;
        let phrase = u32::from(self.settings.lock().unwrap().active_phrase);
        self.transact(MessageId::TargetSize, [target, phrase, 0], true)?;
        self.settings.lock().unwrap().target_size = target;
        Ok(())
    }

    pub fn force_trigger(&self, phrase: u8) -> device::Result<()> {
        validate_phrase(phrase)?;
        self.send_command(Command::ForceTrigger, [u32::from(phrase), 0], false)?;
        Ok(())
    }

    pub fn force_error(&self) -> device::Result<()> {
        self.send_command(Command::ForceError, [0, 0], true)?;
        Ok(())
    }

    pub fn set_audio_dump(&self, on: bool) -> device::Result<()> {
        self.settings.lock().unwrap().audio_dump = on;
        if self.is_running() {
            let cmd = if on {
                Command::EnableAudioDump
            } else {
                Command::DisableAudioDump
            };
            self.send_command(cmd, [0, 0], true)?;
        }
        Ok(())
    }

    pub fn set_log_dump(&self, on: bool) -> device::Result<()> {
        self.settings.lock().unwrap().log_dump = on;
        if self.is_running() {
            let cmd = if on {
                Command::EnableLogDump
            } else {
                Command::DisableLogDump
            };
            self.send_command(cmd, [0, 0], true)?;
        }
        Ok(())
    }

    /// Send a raw message and return the reply words.
    pub fn send_param(&self, msg: u32, words: [u32; PAYLOAD_WORDS]) -> device::Result<[u32; 3]> {
        let id = MessageId::try_from(msg).map_err(device::Error::InvalidMessage)?;
        Ok(self.transact_with_reply(id, words, true)?)
    }

    /// Returns false for unknown commands.
    pub fn debug_command(&self, text: &str) -> bool {
        if !text.trim().starts_with("TESTFWLOG") {
            return false;
        }
        if self.is_running() {
            self.print_sram_log();
        } else {
            info!("TESTFWLOG: no power");
        }
        true
    }

    pub fn status(&self) -> String {
        let settings = self.settings();
        let mut out = String::new();
        let _ = write!(
            out,
            "state {} running {} fw_ready {} abnormal {} recovery {} phrases {:#x} mic {:#x}",
            self.state(),
            self.is_running(),
            self.is_fw_ready(),
            self.is_abnormal(),
            self.recovery_try_cnt(),
            self.active_phrases(),
            self.mic_ready()
        );
        let _ = write!(
            out,
            " active_phrase {} target_size {} mic {:?} mic_num {}",
            settings.active_phrase, settings.target_size, settings.mic, settings.mic_num
        );
        out
    }
}

/// Run one control command, returning the text to show the operator.
pub fn execute<B: HardwareBackend>(dev: &VtsDevice<B>, command: ControlCommand) -> Result<String> {
    use ControlCommand::*;

    let reply = match command {
        Recognition { mode } => {
            dev.set_recognition_mode(mode.is_on())?;
            format!("recognition {mode:?}")
        }
        Phrase { id } => {
            dev.select_phrase(id)?;
            format!("active phrase {id}")
        }
        TriggerValue { ms } => {
            dev.set_trigger_value(ms)?;
            format!("trigger value {ms} ms")
        }
        ForceReset => {
            dev.force_reset()?;
            "reset done".to_string()
        }
        ForceTrigger { phrase } => {
            dev.force_trigger(phrase)?;
            format!("trigger forced for phrase {phrase}")
        }
        ForceError => {
            dev.force_error()?;
            "error forced".to_string()
        }
        MicNum { channels } => {
            dev.update_settings(|s| s.mic_num = channels);
            format!("mic num {channels}")
        }
        SysclkDiv { div } => {
            dev.update_settings(|s| s.sysclk_div = div);
            format!("sysclk div {div}, applied on next resume")
        }
        MicPath { mic } => {
            dev.update_settings(|s| s.mic = mic);
            format!("mic path {mic:?}")
        }
        AudioDump { mode } => {
            dev.set_audio_dump(mode.is_on())?;
            format!("audio dump {mode:?}")
        }
        LogDump { mode } => {
            dev.set_log_dump(mode.is_on())?;
            format!("log dump {mode:?}")
        }
        LoadModel { file, offset } => {
            let data = fs::read(&file).map_err(|e| Error::ReadFile(file.clone(), e))?;
            dev.load_sound_model(&data, offset)?;
            format!("sound model {} loaded, {} bytes", file.display(), data.len())
        }
        ReadEvent => format!("{:#x}", dev.poll_events().take()),
        ExitPolling => {
            dev.poll_events().post(EVENT_STOP_POLLING | EVENT_READY);
            "polling stopped".to_string()
        }
        SetParam { msg, w0, w1, w2 } => {
            let reply = dev.send_param(msg, [w0, w1, w2])?;
            format!("reply {reply:#x?}")
        }
        Version => match dev.versions() {
            Some(v) => format!(
                "firmware {} detect lib {} google {:#x}",
                v.fw_string(),
                v.detect_lib_string(),
                v.google
            ),
            None => "version unknown, resume first".to_string(),
        },
        Cmd { text } => {
            if !dev.debug_command(&text) {
                warn!("unknown debug command {text}");
            }
            String::new()
        }
        Status => dev.status(),
        VoiceCall { mode } => {
            if mode.is_on() {
                dev.enter_voice_call()?;
            } else {
                dev.exit_voice_call()?;
            }
            format!("voice call {mode:?}")
        }
        Suspend => {
            dev.suspend()?;
            "suspended".to_string()
        }
        Resume => {
            dev.resume()?;
            "resumed".to_string()
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use assert_matches::assert_matches;
    use rstest::*;

    use super::*;
    use crate::{
        device::tests::{booted_device, test_device, wait_until},
        state::VtsState,
    };

    fn parse(line: &str) -> std::result::Result<ControlCommand, clap::Error> {
        ControlLine::try_parse_from(line.split_whitespace()).map(|l| l.command)
    }

    #[rstest]
    #[case("recognition on", ControlCommand::Recognition { mode: Switch::On })]
    #[case("phrase 3", ControlCommand::Phrase { id: 3 })]
    #[case("trigger-value 2000", ControlCommand::TriggerValue { ms: 2000 })]
    #[case("mic-path amic", ControlCommand::MicPath { mic: MicType::Amic })]
    #[case("load-model /tmp/m.bin 0x28000", ControlCommand::LoadModel {
        file: PathBuf::from("/tmp/m.bin"),
        offset: Some(0x28000),
    })]
    #[case("set-param 8 0x140", ControlCommand::SetParam { msg: 8, w0: 0x140, w1: 0, w2: 0 })]
    #[case("voice-call off", ControlCommand::VoiceCall { mode: Switch::Off })]
    fn test_parse(#[case] line: &str, #[case] expected: ControlCommand) {
        assert_eq!(parse(line).unwrap(), expected);
    }

    #[rstest]
    #[case("phrase 4")]
    #[case("trigger-value 2001")]
    #[case("recognition maybe")]
    #[case("mic-num 0")]
    #[case("set-param 0x1_0000_0000")]
    #[case("frobnicate")]
    fn test_parse_rejects(#[case] line: &str) {
        assert!(parse(line).is_err());
    }

    #[test]
    fn test_recognition_mode_powers_core() {
        let dev = test_device();
        dev.load_sound_model(&[3; 64], None).unwrap();
        execute(&dev, parse("phrase 2").unwrap()).unwrap();

        execute(&dev, parse("recognition on").unwrap()).unwrap();
        assert!(dev.is_running());
        assert_eq!(dev.active_phrases(), 1 << 2);

        execute(&dev, parse("recognition off").unwrap()).unwrap();
        assert!(!dev.is_running());
        assert_eq!(dev.state(), VtsState::RuntimeSuspended);
    }

    #[test]
    fn test_recognition_mode_without_phrase() {
        let dev = test_device();
        dev.load_sound_model(&[3; 64], None).unwrap();
        execute(&dev, parse("phrase 0").unwrap()).unwrap();

        assert_matches!(
            execute(&dev, parse("recognition on").unwrap()),
            Err(Error::Device(device::Error::InvalidPhrase(0)))
        );
        assert!(!dev.is_running());
        assert_eq!(dev.active_phrases(), 0);

        dev.resume().unwrap();
        execute(&dev, parse("recognition off").unwrap()).unwrap();
        assert!(!dev.is_running());
    }

    #[test]
    fn test_trigger_value() {
        let dev = test_device();
        assert_matches!(
            dev.set_trigger_value(100),
            Err(device::Error::NotRunning)
        );

        dev.resume().unwrap();
        assert_matches!(
            dev.set_trigger_value(2001),
            Err(device::Error::InvalidTriggerValue(2001))
        );
        dev.set_trigger_value(100).unwrap();
        assert_eq!(dev.settings().target_size, 3200);
        assert_eq!(
            dev.backend().last_payload(MessageId::TargetSize),
            [3200, 1, 0]
        );
    }

    #[test]
    fn test_force_trigger_reaches_poll_event() {
        let dev = booted_device();
        dev.load_sound_model(&[3; 64], None).unwrap();
        dev.start_recognition(1).unwrap();

        execute(&dev, parse("force-trigger 1").unwrap()).unwrap();
        let bits = dev.wait_poll_event(Duration::from_secs(2)).unwrap();
        assert_eq!(bits, EVENT_TRIGGERED + 1);

        let events = execute(&dev, parse("read-event").unwrap()).unwrap();
        assert_eq!(events, format!("{:#x}", EVENT_TRIGGERED + 1));
        assert_eq!(dev.poll_events().peek(), EVENT_NONE);
    }

    #[test]
    fn test_force_error_reaches_handler() {
        let dev = booted_device();
        execute(&dev, parse("force-error").unwrap()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || dev
            .backend()
            .watchdog_count()
            == 1));
    }

    #[test]
    fn test_exit_polling() {
        let dev = test_device();
        execute(&dev, parse("exit-polling").unwrap()).unwrap();
        assert_eq!(
            dev.wait_poll_event(Duration::from_millis(100)),
            Some(EVENT_STOP_POLLING)
        );
    }

    #[test]
    fn test_set_param() {
        let dev = booted_device();
        let reply = dev
            .send_param(MessageId::GetVersion as u32, [VERSION_DETECT_LIB, 0, 0])
            .unwrap();
        assert_eq!(reply[2], dev.backend().behavior().detect_lib_version);
        assert_matches!(
            dev.send_param(99, [0; 3]),
            Err(device::Error::InvalidMessage(99))
        );
    }

    #[test]
    fn test_dump_switches() {
        let dev = booted_device();
        execute(&dev, parse("audio-dump on").unwrap()).unwrap();
        assert!(dev.settings().audio_dump);
        assert!(dev.regions.lock().unwrap().audio_dump.is_some());
        execute(&dev, parse("log-dump off").unwrap()).unwrap();
        assert_eq!(
            dev.backend().last_payload(MessageId::Command)[0],
            Command::DisableLogDump as u32
        );
    }

    #[test]
    fn test_load_model_from_file() {
        let dev = test_device();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9; 128]).unwrap();
        let line = format!("load-model {}", file.path().display());
        let reply = execute(&dev, parse(&line).unwrap()).unwrap();
        assert!(reply.ends_with("128 bytes"));

        assert_matches!(
            execute(&dev, parse("load-model /nonexistent/model.bin").unwrap()),
            Err(Error::ReadFile(_, _))
        );
    }

    #[test]
    fn test_version_and_status() {
        let dev = test_device();
        assert!(execute(&dev, ControlCommand::Version)
            .unwrap()
            .contains("unknown"));
        dev.resume().unwrap();
        let version = execute(&dev, ControlCommand::Version).unwrap();
        assert!(version.contains("VTS1"));
        assert!(version.contains("2.1.5"));

        let status = execute(&dev, ControlCommand::Status).unwrap();
        assert!(status.starts_with("state RUNTIME_RESUMED running true"));
        assert!(dev.debug_command("TESTFWLOG"));
        assert!(!dev.debug_command("NOPE"));
    }
}
