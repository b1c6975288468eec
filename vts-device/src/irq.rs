// VTS interrupt dispatcher
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt, io,
    sync::{
        atomic::Ordering,
        mpsc::{Receiver, Sender},
        Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    backend::HardwareBackend,
    device::{SramRegion, VtsDevice},
    dump::DumpReason,
    protocol::*,
    worker::{DumpKind, Work},
};

/// How long the host stays awake after a voice trigger.
pub const TRIGGER_WAKELOCK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Coprocessor to host interrupt lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IrqLine {
    Error,
    BootCompleted,
    IpcReceived,
    VoiceTriggered,
    TriggerPeriodElapsed,
    RecordPeriodElapsed,
    DebugLogBufZero,
    DebugLogBufOne,
    AudioDump,
    LogDump,
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug)]
pub(crate) enum IrqEvent {
    Line(IrqLine),
    /// Answered once every earlier line has been handled.
    Sync(Sender<()>),
    Exit,
}

/// Handle given to the backend for raising interrupts.
#[derive(Clone, Debug)]
pub struct IrqSink(Sender<IrqEvent>);

impl IrqSink {
    pub(crate) fn new(tx: Sender<IrqEvent>) -> Self {
        Self(tx)
    }

    /// Returns false once the device is gone.
    pub fn raise(&self, line: IrqLine) -> bool {
        self.0.send(IrqEvent::Line(line)).is_ok()
    }
}

/// Audio streams fed from the shared DRAM ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PcmStream {
    Trigger,
    Record,
}

/// Consumer of period-elapsed notifications.
pub trait PeriodListener: Send + Sync {
    /// `offset` is the firmware write pointer relative to the stream base.
    fn period_elapsed(&self, stream: PcmStream, offset: u32);
}

/// Runs handlers one at a time on a dedicated thread. Holds only a weak
/// reference so the device can go away while the thread is parked.
pub(crate) fn spawn_dispatcher<B: HardwareBackend>(
    dev: Weak<VtsDevice<B>>,
    rx: Receiver<IrqEvent>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vts-irq".to_string())
        .spawn(move || {
            loop {
                match rx.recv() {
                    Ok(IrqEvent::Line(line)) => {
                        let Some(dev) = dev.upgrade() else {
                            break;
                        };
                        dev.handle_irq(line);
                    }
                    Ok(IrqEvent::Sync(done)) => {
                        let _ = done.send(());
                    }
                    Ok(IrqEvent::Exit) | Err(_) => break,
                }
            }
            debug!("interrupt dispatcher exiting");
        })
}

impl<B: HardwareBackend> VtsDevice<B> {
    pub(crate) fn handle_irq(&self, line: IrqLine) {
        if !self.irq_enabled.load(Ordering::Acquire) {
            debug!("{line} dropped, interrupts disabled");
            return;
        }

        debug!("{line}");
        match line {
            IrqLine::Error => self.handle_error(),
            IrqLine::BootCompleted => self.handle_boot_completed(),
            IrqLine::IpcReceived => self.handle_ipc_received(),
            IrqLine::VoiceTriggered => self.handle_voice_triggered(),
            IrqLine::TriggerPeriodElapsed => self.handle_trigger_period_elapsed(),
            IrqLine::RecordPeriodElapsed => self.handle_record_period_elapsed(),
            IrqLine::DebugLogBufZero => self.handle_debug_log_full(0),
            IrqLine::DebugLogBufOne => self.handle_debug_log_full(1),
            IrqLine::AudioDump => self.handle_dump_ready(DumpKind::Audio),
            IrqLine::LogDump => self.handle_dump_ready(DumpKind::Log),
        }
    }

    fn read_slot(&self, slot: usize) -> u32 {
        let mut value = [0];
        if let Err(e) = self.backend.mailbox_read(slot, &mut value) {
            warn!("mailbox slot {slot}: {e}");
        }
        value[0]
    }

    fn handle_error(&self) {
        let code = self.read_slot(SLOT_FAULT_CODE);
        let fault = FaultCode::from(code);
        match fault {
            FaultCode::HardFault => error!(
                "firmware hard fault: CFSR {:#010x} HFSR {:#010x} DFSR {:#010x} AFSR {:#010x}",
                self.read_slot(SLOT_CFSR),
                self.read_slot(SLOT_HFSR),
                self.read_slot(SLOT_DFSR),
                self.read_slot(SLOT_AFSR_BFSR)
            ),
            FaultCode::BusFault => error!(
                "firmware bus fault: CFSR {:#010x} HFSR {:#010x} DFSR {:#010x} BFSR {:#010x}",
                self.read_slot(SLOT_CFSR),
                self.read_slot(SLOT_HFSR),
                self.read_slot(SLOT_DFSR),
                self.read_slot(SLOT_AFSR_BFSR)
            ),
            FaultCode::Other(code) => error!("firmware error {code:#x}"),
        }

        self.ipc_ack(1);
        self.dump(DumpReason::FwError);

        if self.config.silent_reset {
            let attempts = self.recovery_try_cnt.fetch_add(1, Ordering::AcqRel) + 1;
            self.abnormal.store(true, Ordering::Release);
            self.fw_ready.clear();
            self.backend.cpu_set_enabled(false);

            if attempts > self.config.max_recovery_attempts {
                error!("recovery attempts exhausted ({attempts}), escalating");
                self.backend.watchdog_expire();
            } else {
                warn!("silent reset pending, attempt {attempts}");
                self.poll.post(EVENT_RECOVERY | EVENT_READY);
            }
        } else if fault.is_fault() {
            self.backend.watchdog_expire();
        } else if let Err(e) = self.reset() {
            error!("reset after firmware error failed: {e}");
        }
    }

    fn handle_boot_completed(&self) {
        info!("firmware boot completed");
        self.fw_ready.set();
        self.ipc_ack(1);
    }

    fn handle_voice_triggered(&self) {
        let word = self.read_slot(SLOT_ACK);
        self.ipc_ack(1);
        let trigger = TriggerInfo::decode(word);

        if self.mic_ready() & (1 << trigger.phrase) == 0 {
            debug!("trigger for unarmed phrase {}", trigger.phrase);
            return;
        }

        info!(
            "voice triggered: phrase {} score {} frame_count {}",
            trigger.phrase, trigger.score, trigger.frame_count
        );
        if let Err(e) = self.state.lock().unwrap().recog_triggered() {
            warn!("trigger: {e}");
        }
        self.wake_lock.acquire(TRIGGER_WAKELOCK_TIMEOUT);
        self.poll
            .post((EVENT_TRIGGERED | EVENT_READY) + u32::from(trigger.phrase));
    }

    fn handle_trigger_period_elapsed(&self) {
        let mic = *self.mic.lock().unwrap();
        if !mic.has_phrase() {
            debug!("trigger period with no phrase armed");
            return;
        }

        let pointer = self.read_slot(SLOT_TRI_POINTER);
        let base = self.dma_base.load(Ordering::Acquire);
        self.ipc_ack(1);
        if pointer != 0 {
            self.notify_period(PcmStream::Trigger, pointer.wrapping_sub(base));
        }
    }

    fn handle_record_period_elapsed(&self) {
        let state = self.state();
        if !state.is_powered() {
            warn!("record period in state {state}");
            return;
        }
        if !self.mic.lock().unwrap().has(crate::mic::MicConsumer::Record) {
            debug!("record period with record stream closed");
            return;
        }

        let pointer = self.read_slot(SLOT_REC_POINTER);
        let base = self
            .dma_base
            .load(Ordering::Acquire)
            .wrapping_add(BUFFER_BYTES_MAX / 2);
        self.ipc_ack(1);
        if pointer != 0 {
            self.notify_period(PcmStream::Record, pointer.wrapping_sub(base));
        }
    }

    fn notify_period(&self, stream: PcmStream, offset: u32) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener.period_elapsed(stream, offset);
        }
    }

    fn handle_debug_log_full(&self, half: usize) {
        if !self.is_running() {
            debug!("log buffer {half} full while stopped");
            return;
        }
        self.queue_work(Work::FlushLog { half });
        self.ipc_ack(1);
    }

    fn handle_dump_ready(&self, kind: DumpKind) {
        let enabled = {
            let settings = self.settings.lock().unwrap();
            match kind {
                DumpKind::Audio => settings.audio_dump,
                DumpKind::Log => settings.log_dump,
            }
        };
        if !(self.is_fw_ready() && enabled) {
            self.ipc_ack(1);
            return;
        }

        let mut region = [0; 2];
        if let Err(e) = self.backend.mailbox_read(SLOT_PAYLOAD, &mut region) {
            warn!("{kind:?} dump: {e}");
            self.ipc_ack(1);
            return;
        }
        info!("{kind:?} dump offset {:#x} size {:#x}", region[0], region[1]);

        let region = SramRegion {
            offset: region[0] as usize,
            size: region[1] as usize,
        };
        {
            let mut regions = self.regions.lock().unwrap();
            match kind {
                DumpKind::Audio => regions.audio_dump = Some(region),
                DumpKind::Log => regions.log_dump = Some(region),
            }
        }
        // Acked by the worker once the region is saved.
        self.queue_work(Work::FlushDump(kind));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        device::tests::{booted_device, test_device, test_device_with, wait_until},
        mic::MicConsumer,
        state::VtsState,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(PcmStream, u32)>>);

    impl PeriodListener for Recorder {
        fn period_elapsed(&self, stream: PcmStream, offset: u32) {
            self.0.lock().unwrap().push((stream, offset));
        }
    }

    #[test]
    fn test_trigger_for_unarmed_phrase_is_ignored() {
        let dev = booted_device();
        dev.backend().raise_voice_trigger(2, 100, 10);
        dev.sync_irq();
        assert_eq!(dev.wait_poll_event(Duration::from_millis(100)), None);
        assert_ne!(dev.state(), VtsState::RecogTriggered);
        assert!(!dev.wake_lock.is_held());
    }

    #[test]
    fn test_trigger_sets_event_and_wake_lock() {
        let dev = booted_device();
        dev.load_sound_model(&[0x5a; 64], None).unwrap();
        dev.start_recognition(2).unwrap();

        dev.backend().raise_voice_trigger(2, 0x123, 77);
        let bits = dev.wait_poll_event(Duration::from_secs(2)).unwrap();
        assert_eq!(bits, EVENT_TRIGGERED + 2);
        assert_eq!(dev.state(), VtsState::RecogTriggered);
        assert!(dev.wake_lock.is_held());
    }

    #[test]
    fn test_trigger_after_stopping_another_phrase() {
        let dev = booted_device();
        dev.load_sound_model(&[0x5a; 64], None).unwrap();
        dev.start_recognition(1).unwrap();
        dev.start_recognition(3).unwrap();
        dev.stop_recognition(1).unwrap();
        assert_eq!(dev.state(), VtsState::RecogStarted);

        dev.backend().raise_voice_trigger(3, 0x40, 12);
        let bits = dev.wait_poll_event(Duration::from_secs(2)).unwrap();
        assert_eq!(bits, EVENT_TRIGGERED + 3);
        assert_eq!(dev.state(), VtsState::RecogTriggered);

        dev.stop_recognition(3).unwrap();
        assert_eq!(dev.state(), VtsState::RecogStopped);
    }

    #[test]
    fn test_period_elapsed_offsets() {
        let dev = booted_device();
        let recorder = Arc::new(Recorder::default());
        dev.register_period_listener(recorder.clone());
        let base = dev.dma_base();

        // No consumer armed: stale interrupts are dropped.
        dev.backend()
            .raise_period_elapsed(PcmStream::Trigger, base + 0x280);
        dev.backend()
            .raise_period_elapsed(PcmStream::Record, base + BUFFER_BYTES_MAX / 2 + 0x140);
        dev.sync_irq();
        assert!(recorder.0.lock().unwrap().is_empty());

        dev.set_mic(MicConsumer::Phrase(1), true).unwrap();
        dev.set_mic(MicConsumer::Record, true).unwrap();
        dev.backend()
            .raise_period_elapsed(PcmStream::Trigger, base + 0x280);
        dev.backend()
            .raise_period_elapsed(PcmStream::Record, base + BUFFER_BYTES_MAX / 2 + 0x140);

        assert!(wait_until(Duration::from_secs(2), || recorder
            .0
            .lock()
            .unwrap()
            .len()
            == 2));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(PcmStream::Trigger, 0x280), (PcmStream::Record, 0x140)]
        );
    }

    #[test]
    fn test_record_offset_wraps_high_dma_base() {
        let dev = test_device();
        dev.backend().update(|b| b.dram_base = 0xffff_f000);
        dev.resume().unwrap();
        let recorder = Arc::new(Recorder::default());
        dev.register_period_listener(recorder.clone());
        let base = dev.dma_base();
        assert_eq!(base, 0xffff_f000);

        dev.set_mic(MicConsumer::Record, true).unwrap();
        dev.backend().raise_period_elapsed(
            PcmStream::Record,
            base.wrapping_add(BUFFER_BYTES_MAX / 2 + 0x40),
        );
        assert!(wait_until(Duration::from_secs(2), || !recorder
            .0
            .lock()
            .unwrap()
            .is_empty()));
        assert_eq!(*recorder.0.lock().unwrap(), vec![(PcmStream::Record, 0x40)]);
    }

    #[test]
    fn test_hard_fault_without_silent_reset_escalates() {
        let dev = booted_device();
        dev.backend().raise_fault(VTS_ERR_HARD_FAULT);
        assert!(wait_until(Duration::from_secs(2), || dev
            .backend()
            .watchdog_count()
            == 1));
        assert!(!dev.is_abnormal());
        assert!(dev.dump_record(DumpReason::FwError).is_some());
    }

    #[test]
    fn test_other_error_resets_core() {
        let dev = booted_device();
        let count = dev.backend().power_on_count();
        dev.backend().raise_fault(0x42);
        assert!(wait_until(Duration::from_secs(2), || dev
            .backend()
            .power_on_count()
            == count + 1));
        assert_eq!(dev.backend().watchdog_count(), 0);
    }

    #[test]
    fn test_fault_with_silent_reset_posts_recovery() {
        let dev = test_device_with(|cfg| cfg.silent_reset = true);
        dev.resume().unwrap();
        assert!(dev.is_running());
        assert_eq!(dev.recovery_try_cnt(), 0);

        dev.backend().raise_fault(VTS_ERR_HARD_FAULT);
        let bits = dev.wait_poll_event(Duration::from_secs(2)).unwrap();
        assert_eq!(bits & EVENT_RECOVERY, EVENT_RECOVERY);
        assert!(dev.is_abnormal());
        assert_eq!(dev.recovery_try_cnt(), 1);
        assert!(!dev.is_fw_ready());
        assert_eq!(dev.backend().watchdog_count(), 0);

        let record = dev.dump_record(DumpReason::FwError).unwrap();
        assert_eq!(record.gpr.len(), dev.backend().profile().gpr_count);
    }

    #[test]
    fn test_interrupts_dropped_when_disabled() {
        let dev = test_device_with(|_| {});
        dev.backend().raise_fault(VTS_ERR_HARD_FAULT);
        dev.sync_irq();
        assert_eq!(dev.backend().watchdog_count(), 0);
        assert!(dev.dump_record(DumpReason::FwError).is_none());
    }
}
