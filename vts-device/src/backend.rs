// VTS hardware backend
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::{irq::IrqSink, protocol::MessageId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ThisError)]
/// Errors reported by the hardware backend
pub enum Error {
    #[error("Mailbox access out of range: slot {0}, {1} words")]
    MailboxOutOfRange(usize, usize),
    #[error("SRAM access out of range: offset {0:#x}, {1} bytes")]
    SramOutOfRange(usize, usize),
    #[error("Could not allocate SRAM of {0:#x} bytes")]
    SramAllocation(usize),
    #[error("Doorbell for {0} failed")]
    DoorbellFailed(MessageId),
    #[error("Clock {0:?} operation failed")]
    ClockFailed(ClockId),
    #[error("Power domain operation failed")]
    PowerFailed,
    #[error("Firmware image verification failed")]
    VerificationFailed,
    #[cfg(test)]
    #[error("Backend test operation failed {0}")]
    OperationFailed(&'static str),
}

/// Clock sources feeding the coprocessor, in enable order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClockId {
    Src,
    Sys,
    DmicIf,
    DmicSync,
}

impl ClockId {
    pub const ALL: [ClockId; 4] = [
        ClockId::Src,
        ClockId::Sys,
        ClockId::DmicIf,
        ClockId::DmicSync,
    ];
}

/// Microphone front end wired to the coprocessor.
#[derive(ValueEnum, Deserialize, Clone, Copy, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MicType {
    /// Analog mic through the audio codec ADC (APDM path).
    Amic,
    /// Digital PDM mic (DPDM path).
    #[default]
    Dmic,
}

/// Hardware configuration asserted while any mic consumer is active.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MicPath {
    pub mic: MicType,
    pub gain: u32,
    pub sys_sel: u32,
    pub channels: u32,
}

/// Supported SoC variants.
#[derive(ValueEnum, Deserialize, Clone, Copy, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SocVariant {
    #[default]
    Exynos2100,
    S5e9925,
    S5e8825,
}

/// Per SoC parameters the control code is written against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocProfile {
    pub variant: SocVariant,
    pub firmware_name: &'static str,
    pub firmware_name_evt0: &'static str,
    /// IPC ack poll budget is `ipc_poll_iterations * ipc_poll_interval`.
    pub ipc_poll_iterations: u32,
    pub ipc_poll_interval: Duration,
    pub fw_ready_timeout: Duration,
    pub cpu_park_timeout: Duration,
    pub cpu_park_interval: Duration,
    pub sram_size: usize,
    pub shared_info_offset: usize,
    pub sram_log_offset: usize,
    pub sram_log_size: usize,
    pub sound_model_offset: usize,
    /// Number of core registers captured in a dump, the last one is PC.
    pub gpr_count: usize,
    pub sys_clock_max: u64,
}

pub const IPC_ACK_TIMEOUT: Duration = Duration::from_millis(200);
pub const FW_READY_TIMEOUT: Duration = Duration::from_secs(3);
pub const CPU_PARK_TIMEOUT: Duration = Duration::from_millis(1000);

impl SocProfile {
    pub fn new(variant: SocVariant) -> Self {
        let base = Self {
            variant,
            firmware_name: "vts.bin",
            firmware_name_evt0: "vts_evt0.bin",
            ipc_poll_iterations: 200,
            ipc_poll_interval: Duration::from_millis(1),
            fw_ready_timeout: FW_READY_TIMEOUT,
            cpu_park_timeout: CPU_PARK_TIMEOUT,
            cpu_park_interval: Duration::from_millis(1),
            sram_size: 0x4_0000,
            shared_info_offset: 0x3_f000,
            sram_log_offset: 0x3_c000,
            sram_log_size: 0x2000,
            sound_model_offset: 0x2_0000,
            gpr_count: 1,
            sys_clock_max: 393_216_000,
        };

        match variant {
            SocVariant::Exynos2100 => base,
            SocVariant::S5e9925 => Self {
                sram_size: 0x6_0000,
                shared_info_offset: 0x5_f000,
                sram_log_offset: 0x5_c000,
                sound_model_offset: 0x3_0000,
                ..base
            },
            SocVariant::S5e8825 => Self {
                ipc_poll_iterations: 50,
                ipc_poll_interval: Duration::from_millis(4),
                gpr_count: 17,
                sys_clock_max: 196_608_000,
                ..base
            },
        }
    }

    pub fn ipc_timeout(&self) -> Duration {
        self.ipc_poll_interval * self.ipc_poll_iterations
    }
}

impl Default for SocProfile {
    fn default() -> Self {
        Self::new(SocVariant::default())
    }
}

/// Trait that represents the coprocessor hardware.
///
/// One implementation per SoC family; the runtime control code only talks
/// to the hardware through this interface. All methods may be called from
/// caller threads and from the interrupt dispatcher concurrently.
pub trait HardwareBackend: Send + Sync + 'static {
    fn profile(&self) -> &SocProfile;

    /// Route interrupts raised by the coprocessor to `sink`.
    fn connect_irq(&self, sink: IrqSink);
    fn irq_enable(&self, enable: bool);

    fn mailbox_write(&self, slot: usize, values: &[u32]) -> Result<()>;
    fn mailbox_read(&self, slot: usize, values: &mut [u32]) -> Result<()>;
    fn ring_doorbell(&self, id: MessageId) -> Result<()>;

    fn sram_write(&self, offset: usize, data: &[u8]) -> Result<()>;
    fn sram_read(&self, offset: usize, data: &mut [u8]) -> Result<()>;
    /// Hand the firmware image to the signature verifying loader, which
    /// copies it to SRAM and releases the core.
    fn load_verified(&self, image: &[u8]) -> Result<()>;

    fn clk_prepare(&self, clk: ClockId) -> Result<()>;
    fn clk_unprepare(&self, clk: ClockId);
    fn clk_enable(&self, clk: ClockId) -> Result<()>;
    fn clk_disable(&self, clk: ClockId);
    fn clk_rate(&self, clk: ClockId) -> u64;
    fn clk_set_rate(&self, clk: ClockId, rate: u64) -> Result<()>;

    fn cpu_power(&self, on: bool) -> Result<()>;
    fn power_status(&self) -> bool;
    fn cpu_set_enabled(&self, enabled: bool);
    /// True once the core sits in WFI.
    fn cpu_parked(&self) -> bool;
    fn read_gpr(&self, index: usize) -> u32;

    fn set_pads_active(&self, active: bool);
    fn set_pad_retention(&self, retain: bool);
    fn save_registers(&self);
    fn restore_registers(&self);
    /// Assert (`Some`) or revert (`None`) the microphone path.
    fn configure_mic(&self, path: Option<&MicPath>);
    /// Program the bus alias window so the core can reach a DRAM region of
    /// `size` bytes; returns the aliased base address.
    fn map_dram(&self, size: u32) -> u32;

    fn soc_resume(&self) -> Result<()>;
    fn soc_suspend(&self) -> Result<()>;

    /// Unrecoverable fault escalation.
    fn watchdog_expire(&self);
}
