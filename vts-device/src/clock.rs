// VTS clock management
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use log::{debug, warn};

use crate::backend::{ClockId, HardwareBackend, Result};

/// DMIC interface rates selectable through `sys_sel`.
pub const SYS_SEL_RATES: [u64; 6] = [
    512_000, 768_000, 384_000, 2_048_000, 3_072_000, 3_072_000,
];

/// Clock path for a sys_sel index: interface clock at twice the
/// synchronizer rate.
pub fn sys_sel_path(sys_sel: u32) -> Option<[(ClockId, u64); 2]> {
    let rate = *SYS_SEL_RATES.get(sys_sel as usize)?;
    Some([(ClockId::DmicIf, rate * 2), (ClockId::DmicSync, rate)])
}

/// Tracks which clocks are prepared and enabled so that every enable done
/// at resume is matched by a disable at suspend.
#[derive(Debug, Default)]
pub struct ClockManager {
    prepared: AtomicBool,
    enabled: Mutex<BTreeSet<ClockId>>,
}

impl ClockManager {
    pub fn prepare<B: HardwareBackend>(&self, backend: &B) -> Result<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }

        for (i, clk) in ClockId::ALL.iter().enumerate() {
            if let Err(e) = backend.clk_prepare(*clk) {
                for done in &ClockId::ALL[..i] {
                    backend.clk_unprepare(*done);
                }
                return Err(e);
            }
        }
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unprepare<B: HardwareBackend>(&self, backend: &B) {
        self.disable_all(backend);
        if self.prepared.swap(false, Ordering::AcqRel) {
            for clk in ClockId::ALL.iter().rev() {
                backend.clk_unprepare(*clk);
            }
        }
    }

    pub fn enable_all<B: HardwareBackend>(&self, backend: &B) -> Result<()> {
        let mut enabled = self.enabled.lock().unwrap();
        for clk in ClockId::ALL {
            if enabled.contains(&clk) {
                continue;
            }
            if let Err(e) = backend.clk_enable(clk) {
                warn!("clock {clk:?} enable failed: {e}");
                for done in enabled.iter().rev() {
                    backend.clk_disable(*done);
                }
                enabled.clear();
                return Err(e);
            }
            enabled.insert(clk);
        }
        Ok(())
    }

    pub fn disable_all<B: HardwareBackend>(&self, backend: &B) {
        let mut enabled = self.enabled.lock().unwrap();
        for clk in enabled.iter().rev() {
            backend.clk_disable(*clk);
        }
        enabled.clear();
    }

    /// Walk `path` setting each rate. Failures are logged and skipped; a
    /// clock seen for the first time is also enabled.
    pub fn set_rate<B: HardwareBackend>(&self, backend: &B, path: &[(ClockId, u64)]) {
        let mut enabled = self.enabled.lock().unwrap();
        for &(clk, rate) in path {
            let current = backend.clk_rate(clk);
            if current == rate {
                debug!("clock {clk:?} already at {rate}");
            } else if let Err(e) = backend.clk_set_rate(clk, rate) {
                warn!("clock {clk:?} rate {current} -> {rate} failed: {e}");
                continue;
            } else {
                debug!("clock {clk:?} rate {current} -> {rate}");
            }

            if !enabled.contains(&clk) {
                match backend.clk_enable(clk) {
                    Ok(()) => {
                        enabled.insert(clk);
                    }
                    Err(e) => warn!("clock {clk:?} enable failed: {e}"),
                }
            }
        }
    }

    pub fn is_enabled(&self, clk: ClockId) -> bool {
        self.enabled.lock().unwrap().contains(&clk)
    }
}
