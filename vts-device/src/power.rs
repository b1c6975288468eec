// VTS core power control
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::atomic::Ordering,
    thread,
    time::Instant,
};

use log::{debug, error, info, warn};

use crate::{
    backend::HardwareBackend,
    device::{Error, Result, VtsDevice},
};

impl<B: HardwareBackend> VtsDevice<B> {
    /// Toggle the core's local power. Failures are only logged, callers
    /// verify the outcome with [`Self::power_check`].
    pub fn power(&self, on: bool) {
        match self.backend.cpu_power(on) {
            Ok(()) => debug!("core power {}", if on { "on" } else { "off" }),
            Err(e) => error!("core power {} failed: {e}", if on { "on" } else { "off" }),
        }
    }

    pub fn power_check(&self) -> bool {
        self.backend.power_status()
    }

    /// Enable or park the core. Parking waits for the core to reach WFI,
    /// bounded by the SoC park budget.
    pub fn cpu_enable(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.backend.cpu_set_enabled(true);
            return Ok(());
        }

        self.backend.cpu_set_enabled(false);
        if self.config.silent_reset && self.abnormal.load(Ordering::Acquire) {
            debug!("core abnormal, not waiting for WFI");
            return Ok(());
        }

        let profile = self.backend.profile();
        let start = Instant::now();
        while !self.backend.cpu_parked() {
            if start.elapsed() >= profile.cpu_park_timeout {
                error!("core did not park within {:?}", profile.cpu_park_timeout);
                return Err(Error::Timeout("core park"));
            }
            thread::sleep(profile.cpu_park_interval);
        }
        debug!("core parked after {:?}", start.elapsed());
        Ok(())
    }

    /// Park, power off and power the core back on.
    pub fn reset(&self) -> Result<()> {
        info!("resetting core");
        if let Err(e) = self.cpu_enable(false) {
            warn!("reset: {e}");
        }
        self.power(false);
        self.power(true);
        if self.power_check() {
            Ok(())
        } else {
            Err(Error::PowerCheckFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::device::tests::{booted_device, test_device, test_device_with};

    #[test]
    fn test_cpu_park() {
        let dev = booted_device();
        dev.cpu_enable(false).unwrap();
        assert!(dev.backend().cpu_parked());
        dev.cpu_enable(true).unwrap();
        assert!(!dev.backend().cpu_parked());
    }

    #[test]
    fn test_cpu_park_timeout_is_bounded() {
        let dev = booted_device();
        dev.backend().update(|b| b.wedged = true);

        let budget = dev.backend().profile().cpu_park_timeout;
        let start = Instant::now();
        assert_matches!(dev.cpu_enable(false), Err(Error::Timeout(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= budget);
        assert!(elapsed < budget + Duration::from_secs(1));
    }

    #[test]
    fn test_cpu_park_short_circuits_when_abnormal() {
        let dev = test_device_with(|cfg| cfg.silent_reset = true);
        dev.backend().update(|b| b.wedged = true);
        dev.abnormal.store(true, Ordering::Release);

        let start = Instant::now();
        dev.cpu_enable(false).unwrap();
        assert!(start.elapsed() < dev.backend().profile().cpu_park_timeout);
    }

    #[test]
    fn test_reset_cycles_power() {
        let dev = test_device();
        let count = dev.backend().power_on_count();
        dev.reset().unwrap();
        assert!(dev.power_check());
        assert_eq!(dev.backend().power_on_count(), count + 1);

        dev.backend().update(|b| b.power_stuck = true);
        dev.power(false);
        assert!(dev.power_check());
    }

    #[test]
    fn test_reset_reports_power_failure() {
        let dev = test_device();
        dev.backend().update(|b| b.power_fails = true);
        assert_matches!(dev.reset(), Err(Error::PowerCheckFailed));
    }
}
