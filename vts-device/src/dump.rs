// VTS diagnostic dumps
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt,
    sync::{atomic::Ordering, Arc, Mutex},
};

use itertools::Itertools;
use log::{debug, error, info, warn};

use crate::{
    backend::HardwareBackend, device::VtsDevice, protocol::VTS_DUMP_MAGIC, worker::Work,
};

/// Why a dump was taken. Each reason owns one slot of the dump table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DumpReason {
    KernelPanic,
    FwNotReady,
    IpcTransFail,
    FwError,
    Itmon,
    RuntimeSuspend,
}

impl DumpReason {
    pub const COUNT: usize = 6;

    const fn index(self) -> usize {
        self as usize
    }

    /// Reasons that only make sense while the firmware runs; taking them
    /// otherwise would touch powered down hardware.
    pub const fn running_only(self) -> bool {
        matches!(self, Self::KernelPanic | Self::Itmon | Self::RuntimeSuspend)
    }
}

impl fmt::Display for DumpReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::KernelPanic => "VTS_KERNEL_PANIC_DUMP",
            Self::FwNotReady => "VTS_FW_NOT_READY",
            Self::IpcTransFail => "VTS_IPC_TRANS_FAIL",
            Self::FwError => "VTS_FW_ERROR",
            Self::Itmon => "VTS_ITMON_ERROR",
            Self::RuntimeSuspend => "RUNTIME_SUSPEND_DUMP",
        };
        write!(f, "{name}")
    }
}

/// Snapshot taken at dump time. Never modified once stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpRecord {
    pub reason: DumpReason,
    /// Nanoseconds since the device was created.
    pub time_ns: u64,
    /// Core registers, program counter last.
    pub gpr: Vec<u32>,
    /// `VTS_DUMP_MAGIC` followed by the SRAM log ring.
    pub sram_log: Vec<u8>,
    pub sram: Option<Vec<u8>>,
}

impl DumpRecord {
    pub fn pc(&self) -> Option<u32> {
        self.gpr.last().copied()
    }
}

#[derive(Debug, Default)]
pub struct DumpTable {
    slots: Mutex<[Option<Arc<DumpRecord>>; DumpReason::COUNT]>,
}

impl DumpTable {
    pub fn store(&self, record: DumpRecord) {
        let index = record.reason.index();
        self.slots.lock().unwrap()[index] = Some(Arc::new(record));
    }

    pub fn get(&self, reason: DumpReason) -> Option<Arc<DumpRecord>> {
        self.slots.lock().unwrap()[reason.index()].clone()
    }

    /// Replace the record for `reason` with one carrying a full SRAM copy.
    pub(crate) fn attach_sram(&self, reason: DumpReason, sram: Vec<u8>) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match &slots[reason.index()] {
            Some(record) => {
                let record = DumpRecord {
                    sram: Some(sram),
                    ..(**record).clone()
                };
                slots[reason.index()] = Some(Arc::new(record));
                true
            }
            None => false,
        }
    }
}

pub(crate) fn hex_lines(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "{:08x}: {}",
                i * 16,
                chunk.iter().map(|b| format!("{b:02x}")).join(" ")
            )
        })
        .collect()
}

impl<B: HardwareBackend> VtsDevice<B> {
    /// Take a dump for `reason`. Returns false when the dump was skipped.
    pub fn dump(&self, reason: DumpReason) -> bool {
        if reason.running_only() && !(self.is_running() && self.is_enabled()) {
            debug!("{reason}: skipped, firmware not running");
            return false;
        }

        // The panic path must not block on the SRAM copy.
        let deferred = reason == DumpReason::KernelPanic;
        let record = self.capture(reason, self.config.full_sram_dump && !deferred);
        info!(
            "{reason}: dumped at {}ns, pc {:#010x}",
            record.time_ns,
            record.pc().unwrap_or_default()
        );
        self.dumps.store(record);

        if deferred && self.config.full_sram_dump {
            self.queue_work(Work::SramDump(reason));
        }
        true
    }

    pub fn dump_record(&self, reason: DumpReason) -> Option<Arc<DumpRecord>> {
        self.dumps.get(reason)
    }

    pub(crate) fn capture(&self, reason: DumpReason, with_sram: bool) -> DumpRecord {
        let profile = self.backend.profile();
        let gpr = (0..profile.gpr_count)
            .map(|i| self.backend.read_gpr(i))
            .collect();

        let mut sram_log = VTS_DUMP_MAGIC.to_vec();
        let mut ring = vec![0u8; profile.sram_log_size];
        match self.backend.sram_read(profile.sram_log_offset, &mut ring) {
            Ok(()) => sram_log.extend_from_slice(&ring),
            Err(e) => warn!("{reason}: could not copy SRAM log: {e}"),
        }

        let sram = if with_sram { self.read_sram() } else { None };

        DumpRecord {
            reason,
            time_ns: self.timestamp_ns(),
            gpr,
            sram_log,
            sram,
        }
    }

    pub(crate) fn read_sram(&self) -> Option<Vec<u8>> {
        let mut sram = vec![0u8; self.backend.profile().sram_size];
        match self.backend.sram_read(0, &mut sram) {
            Ok(()) => Some(sram),
            Err(e) => {
                warn!("could not copy SRAM: {e}");
                None
            }
        }
    }

    /// Host panic notifier. Dumps once per device lifetime.
    pub fn on_host_panic(&self) {
        if self.panic_dumped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dump(DumpReason::KernelPanic);
    }

    /// Bus fault notifier. Returns true when the fault involves the VTS
    /// block, in which case the device is taken out of service.
    pub fn on_bus_fault(&self, master: &str, dest: &str) -> bool {
        let ours = |name: &str| name.to_ascii_uppercase().contains("VTS");
        if !ours(master) && !ours(dest) {
            return false;
        }

        error!("bus fault from {master} to {dest}");
        self.dump(DumpReason::Itmon);
        self.enabled.store(false, Ordering::Release);
        true
    }

    /// Hex dump of the SRAM log ring to the log.
    pub(crate) fn print_sram_log(&self) {
        let profile = self.backend.profile();
        let mut ring = vec![0u8; profile.sram_log_size];
        if let Err(e) = self.backend.sram_read(profile.sram_log_offset, &mut ring) {
            warn!("could not read SRAM log: {e}");
            return;
        }
        for line in hex_lines(&ring) {
            info!("{line}");
        }
    }
}
