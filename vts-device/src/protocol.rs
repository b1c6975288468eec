// VTS mailbox protocol definitions
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Shared register layout, message ids and firmware sub-commands spoken
//! between the host and the voice trigger coprocessor.

use std::fmt;

use vm_memory::ByteValued;

// Mailbox shared register slots

/// First of the three outgoing payload words.
pub const SLOT_PAYLOAD: usize = 0;
pub const PAYLOAD_WORDS: usize = 3;
/// Ack / result word written by the firmware.
pub const SLOT_ACK: usize = 3;
/// Auxiliary return words (offset, size) for log and dump registration.
pub const SLOT_AUX: usize = 4;
pub const AUX_WORDS: usize = 2;
pub const MAILBOX_SLOTS: usize = 16;

// Fault status registers reported with the error interrupt

pub const SLOT_FAULT_CODE: usize = 3;
pub const SLOT_CFSR: usize = 1;
pub const SLOT_HFSR: usize = 2;
pub const SLOT_DFSR: usize = 4;
/// AFSR for hard faults, BFSR for bus faults.
pub const SLOT_AFSR_BFSR: usize = 5;

// Period-elapsed write pointers

pub const SLOT_REC_POINTER: usize = 1;
pub const SLOT_TRI_POINTER: usize = 2;

// Firmware reported error codes

pub const VTS_ERR_HARD_FAULT: u32 = 0x1;
pub const VTS_ERR_BUS_FAULT: u32 = 0x3;

// Poll events reported to the voice HAL

pub const EVENT_NONE: u32 = 0x0;
pub const EVENT_TRIGGERED: u32 = 0x10;
pub const EVENT_RECORD: u32 = 0x20;
pub const EVENT_STOP_POLLING: u32 = 0x40;
pub const EVENT_RESTART: u32 = 0x80;
pub const EVENT_READY: u32 = 0x100;
pub const EVENT_RECOVERY: u32 = 0x200;

/// Mic consumer bit reserved for the record stream.
pub const MICCONF_FOR_RECORD: u8 = 4;
/// Highest phrase id the firmware accepts.
pub const MAX_PHRASE_ID: u8 = 3;

/// Size of the DRAM ring shared by the trigger and record streams.
pub const BUFFER_BYTES_MAX: u32 = 0xa0000;
/// Period and buffer sizes announced with `SetDramBuffer`.
pub const DRAM_PERIOD_BYTES: u32 = 0x140;
pub const DRAM_BUFFER_PERIODS: u32 = 0x800;

/// Largest sound model accepted by the firmware.
pub const SOUND_MODEL_MAX_SIZE: usize = 0x10900;

/// Largest value accepted by the trigger-value control, in milliseconds.
pub const TRIGGER_VALUE_MAX_MS: u32 = 2000;
/// Bytes per millisecond of 16 kHz 16-bit mono audio.
pub const BYTES_PER_MS: u32 = 32;

/// Prefix placed in front of every copied firmware log.
pub const VTS_DUMP_MAGIC: &[u8; 8] = b"VTS-LOG0";

/// Version selectors carried in the first `GetVersion` payload word.
pub const VERSION_DETECT_LIB: u32 = 1;
pub const VERSION_GOOGLE: u32 = 2;

/// Host to coprocessor interrupt lines. The ack for a message is
/// `1 << id`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageId {
    IpcReceived = 0,
    SetDramBuffer = 1,
    StartRecognition = 2,
    StopRecognition = 3,
    StartCopy = 4,
    StopCopy = 5,
    SetMode = 6,
    PowerDown = 7,
    TargetSize = 8,
    SetRecBuffer = 9,
    StartRec = 10,
    StopRec = 11,
    GetVersion = 12,
    RestartRecognition = 13,
    Command = 14,
    TestCommand = 15,
}

impl MessageId {
    pub const fn ack_bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl TryFrom<u32> for MessageId {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        use MessageId::*;
        Ok(match value {
            0 => IpcReceived,
            1 => SetDramBuffer,
            2 => StartRecognition,
            3 => StopRecognition,
            4 => StartCopy,
            5 => StopCopy,
            6 => SetMode,
            7 => PowerDown,
            8 => TargetSize,
            9 => SetRecBuffer,
            10 => StartRec,
            11 => StopRec,
            12 => GetVersion,
            13 => RestartRecognition,
            14 => Command,
            15 => TestCommand,
            other => return Err(other),
        })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

/// Sub-commands carried in the first payload word of `MessageId::Command`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    EnableSramLog = 0x1,
    EnableDebugLog = 0x2,
    DisableDebugLog = 0x3,
    EnableAudioDump = 0x4,
    DisableAudioDump = 0x5,
    EnableLogDump = 0x6,
    DisableLogDump = 0x7,
    ForceTrigger = 0x8,
    KernelTime = 0x9,
    ForceError = 0xa,
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        use Command::*;
        Ok(match value {
            0x1 => EnableSramLog,
            0x2 => EnableDebugLog,
            0x3 => DisableDebugLog,
            0x4 => EnableAudioDump,
            0x5 => DisableAudioDump,
            0x6 => EnableLogDump,
            0x7 => DisableLogDump,
            0x8 => ForceTrigger,
            0x9 => KernelTime,
            0xa => ForceError,
            other => return Err(other),
        })
    }
}

/// Error code reported in `SLOT_FAULT_CODE` with the error interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultCode {
    HardFault,
    BusFault,
    Other(u32),
}

impl From<u32> for FaultCode {
    fn from(code: u32) -> Self {
        match code {
            VTS_ERR_HARD_FAULT => Self::HardFault,
            VTS_ERR_BUS_FAULT => Self::BusFault,
            other => Self::Other(other),
        }
    }
}

impl FaultCode {
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::HardFault | Self::BusFault)
    }
}

/// Decoded voice trigger word.
///
/// ```text
/// 31     28 27          16 15                    0
/// +--------+--------------+----------------------+
/// | phrase |    score     |     frame count      |
/// +--------+--------------+----------------------+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub phrase: u8,
    pub score: u16,
    pub frame_count: u16,
}

impl TriggerInfo {
    pub const fn decode(word: u32) -> Self {
        Self {
            phrase: (word >> 28) as u8,
            score: ((word >> 16) & 0xfff) as u16,
            frame_count: (word & 0xffff) as u16,
        }
    }

    pub const fn encode(&self) -> u32 {
        ((self.phrase as u32 & 0xf) << 28)
            | ((self.score as u32 & 0xfff) << 16)
            | self.frame_count as u32
    }
}

/// Information block the firmware and the host share at a fixed SRAM
/// offset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SharedInfo {
    pub vendor_data: [u32; 3],
    pub kernel_sec: u32,
    pub kernel_msec: u32,
    pub fw_version: u32,
    pub detect_lib_version: u32,
    pub google_version: u32,
    pub hotword_id: [u32; 10],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for SharedInfo {}

impl SharedInfo {
    /// Hotword model UUID as raw bytes.
    pub fn hotword_bytes(&self) -> Vec<u8> {
        self.hotword_id
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }
}
