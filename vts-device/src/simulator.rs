// Simulated VTS coprocessor
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{collections::HashMap, sync::Mutex};

use log::{debug, error, info, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::{
    backend::{ClockId, Error, HardwareBackend, MicPath, Result, SocProfile},
    irq::{IrqLine, IrqSink, PcmStream},
    protocol::*,
    worker::DumpKind,
};

/// Ack word the simulated firmware writes when it rejects a message.
pub const FW_NACK: u32 = 0xffff_ffff;
/// Bus address the DRAM ring is aliased to.
pub const DRAM_ALIAS_BASE: u32 = 0x6000_0000;

const TRACE_LIMIT: usize = 4096;

/// What the firmware does once the core is powered with an image loaded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootBehavior {
    Complete,
    /// Never raises boot completed.
    Silent,
    /// Raises the error interrupt with this fault code instead of booting.
    Fault(u32),
}

/// How the firmware answers host messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckPolicy {
    All,
    Nothing,
    Ignore(MessageId),
    Reject(MessageId),
}

/// Knobs for fault injection.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub boot: BootBehavior,
    pub ack: AckPolicy,
    /// Core never reaches WFI.
    pub wedged: bool,
    /// Power domain ignores power off requests.
    pub power_stuck: bool,
    pub power_fails: bool,
    pub verify_fails: bool,
    pub fw_version: u32,
    pub detect_lib_version: u32,
    pub google_version: u32,
    /// Reported in the aux slots for [`Command::EnableDebugLog`].
    pub log_region: (u32, u32),
    /// Reported in the aux slots for the dump enable commands.
    pub dump_region: (u32, u32),
    /// Address returned by `map_dram`.
    pub dram_base: u32,
    pub doorbell_error: Option<Error>,
    pub failing_clock: Option<ClockId>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            boot: BootBehavior::Complete,
            ack: AckPolicy::All,
            wedged: false,
            power_stuck: false,
            power_fails: false,
            verify_fails: false,
            fw_version: u32::from_be_bytes(*b"VTS1"),
            detect_lib_version: 0x0002_0105,
            google_version: 3,
            log_region: (0x3_8000, 0x2000),
            dump_region: (0x3_a000, 0x1000),
            dram_base: DRAM_ALIAS_BASE,
            doorbell_error: None,
            failing_clock: None,
        }
    }
}

/// Mailbox accesses recorded for inspection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MailboxOp {
    Payload,
    AckClear,
    Doorbell(MessageId),
}

/// Firmware initiated interrupt with the mailbox words it carries.
#[derive(Debug)]
struct Injection {
    writes: Vec<(usize, u32)>,
    line: IrqLine,
}

#[derive(Debug, Default, Copy, Clone)]
struct ClockState {
    prepared: bool,
    enabled: bool,
    rate: u64,
}

#[derive(Debug, Default)]
struct SimState {
    behavior: SimBehavior,
    mailbox: [u32; MAILBOX_SLOTS],
    sink: Option<IrqSink>,
    irq_enabled: bool,
    powered: bool,
    fw_loaded: bool,
    booted: bool,
    cpu_enabled: bool,
    /// A message was rung and its ack slot is not cleared yet.
    in_flight: bool,
    pending: Vec<Injection>,
    clocks: HashMap<ClockId, ClockState>,
    mic: Option<MicPath>,
    pads_active: bool,
    pad_retention: bool,
    soc_suspended: bool,
    dram_base: u32,
    doorbells: HashMap<MessageId, u32>,
    last_payload: HashMap<MessageId, [u32; PAYLOAD_WORDS]>,
    trace: Vec<MailboxOp>,
    power_on_count: u32,
    watchdog_count: u32,
    verified_loads: u32,
}

impl SimState {
    fn record(&mut self, op: MailboxOp) {
        if self.trace.len() < TRACE_LIMIT {
            self.trace.push(op);
        }
    }

    fn apply(&mut self, injection: &Injection) {
        for &(slot, value) in &injection.writes {
            self.mailbox[slot] = value;
        }
    }
}

/// Software model of the coprocessor: mailbox, SRAM, power, clocks and a
/// firmware that answers the host protocol.
#[derive(Debug)]
pub struct SimulatedVts {
    profile: SocProfile,
    sram: GuestMemoryMmap<()>,
    state: Mutex<SimState>,
}

impl SimulatedVts {
    pub fn new(profile: SocProfile) -> Result<Self> {
        let sram = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), profile.sram_size)])
            .map_err(|_| Error::SramAllocation(profile.sram_size))?;

        Ok(Self {
            profile,
            sram,
            state: Mutex::new(SimState::default()),
        })
    }

    fn check_sram(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.profile.sram_size => Ok(()),
            _ => Err(Error::SramOutOfRange(offset, len)),
        }
    }

    fn raise(sink: Option<IrqSink>, lines: &[IrqLine]) {
        let Some(sink) = sink else {
            debug!("no interrupt sink, dropping {lines:?}");
            return;
        };
        for line in lines {
            sink.raise(*line);
        }
    }

    /// Deliver now, or once the host clears the ack slot if a message is
    /// in flight.
    fn inject(&self, injection: Injection) {
        let mut state = self.state.lock().unwrap();
        if state.in_flight {
            state.pending.push(injection);
            return;
        }
        state.apply(&injection);
        let sink = state.sink.clone();
        drop(state);
        Self::raise(sink, &[injection.line]);
    }

    fn trigger_injection(phrase: u8, score: u16, frame_count: u16) -> Injection {
        let word = TriggerInfo {
            phrase,
            score,
            frame_count,
        }
        .encode();
        Injection {
            writes: vec![(SLOT_ACK, word)],
            line: IrqLine::VoiceTriggered,
        }
    }

    fn fault_injection(code: u32) -> Injection {
        Injection {
            writes: vec![
                (SLOT_FAULT_CODE, code),
                (SLOT_CFSR, 0x0000_8200),
                (SLOT_HFSR, 0x4000_0000),
                (SLOT_DFSR, 0),
                (SLOT_AFSR_BFSR, 0x82),
            ],
            line: IrqLine::Error,
        }
    }

    /// Firmware side of a message it accepted.
    fn process(&self, state: &mut SimState, id: MessageId, payload: [u32; PAYLOAD_WORDS]) {
        match id {
            MessageId::GetVersion => {
                state.mailbox[2] = match payload[0] {
                    VERSION_GOOGLE => state.behavior.google_version,
                    VERSION_DETECT_LIB => state.behavior.detect_lib_version,
                    _ => state.behavior.fw_version,
                };
            }
            MessageId::SetDramBuffer => {
                debug!(
                    "fw: DRAM ring at {:#x}, {} periods of {:#x}",
                    payload[0], payload[2], payload[1]
                );
            }
            MessageId::Command => match Command::try_from(payload[0]) {
                Ok(Command::EnableDebugLog) => {
                    let (offset, size) = state.behavior.log_region;
                    state.mailbox[SLOT_AUX] = offset;
                    state.mailbox[SLOT_AUX + 1] = size;
                }
                Ok(Command::EnableAudioDump) | Ok(Command::EnableLogDump) => {
                    let (offset, size) = state.behavior.dump_region;
                    state.mailbox[SLOT_AUX] = offset;
                    state.mailbox[SLOT_AUX + 1] = size;
                }
                Ok(Command::ForceTrigger) => {
                    let phrase = u8::try_from(payload[1]).unwrap_or(MAX_PHRASE_ID);
                    state
                        .pending
                        .push(Self::trigger_injection(phrase, 0xfff, 0));
                }
                Ok(Command::ForceError) => {
                    let code = if payload[1] == 0 {
                        VTS_ERR_HARD_FAULT
                    } else {
                        payload[1]
                    };
                    state.pending.push(Self::fault_injection(code));
                }
                Ok(cmd) => debug!("fw: {cmd:?}"),
                Err(raw) => warn!("fw: unknown command {raw:#x}"),
            },
            _ => {}
        }
    }

    /// Run the firmware from the reset vector.
    fn boot(&self, state: &mut SimState) -> Option<Injection> {
        match state.behavior.boot {
            BootBehavior::Complete => {
                let shared = SharedInfo {
                    fw_version: state.behavior.fw_version,
                    detect_lib_version: state.behavior.detect_lib_version,
                    google_version: state.behavior.google_version,
                    hotword_id: [0x5654_5331; 10],
                    ..SharedInfo::default()
                };
                if let Err(e) = self.sram.write_obj(
                    shared,
                    GuestAddress(self.profile.shared_info_offset as u64),
                ) {
                    warn!("fw: shared info: {e}");
                }
                state.booted = true;
                info!("fw: boot completed");
                Some(Injection {
                    writes: Vec::new(),
                    line: IrqLine::BootCompleted,
                })
            }
            BootBehavior::Silent => None,
            BootBehavior::Fault(code) => Some(Self::fault_injection(code)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SimBehavior)) {
        f(&mut self.state.lock().unwrap().behavior);
    }

    pub fn behavior(&self) -> SimBehavior {
        self.state.lock().unwrap().behavior.clone()
    }

    pub fn doorbell_count(&self, id: MessageId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .doorbells
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    /// Payload the last `id` message was rung with.
    pub fn last_payload(&self, id: MessageId) -> [u32; PAYLOAD_WORDS] {
        self.state
            .lock()
            .unwrap()
            .last_payload
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn trace(&self) -> Vec<MailboxOp> {
        self.state.lock().unwrap().trace.clone()
    }

    pub fn clear_trace(&self) {
        self.state.lock().unwrap().trace.clear();
    }

    pub fn mailbox_word(&self, slot: usize) -> u32 {
        self.state.lock().unwrap().mailbox[slot]
    }

    pub fn power_on_count(&self) -> u32 {
        self.state.lock().unwrap().power_on_count
    }

    pub fn watchdog_count(&self) -> u32 {
        self.state.lock().unwrap().watchdog_count
    }

    pub fn verified_loads(&self) -> u32 {
        self.state.lock().unwrap().verified_loads
    }

    /// Currently asserted mic configuration.
    pub fn mic_path(&self) -> Option<MicPath> {
        self.state.lock().unwrap().mic
    }

    pub fn clock_enabled(&self, clk: ClockId) -> bool {
        self.state
            .lock()
            .unwrap()
            .clocks
            .get(&clk)
            .is_some_and(|c| c.enabled)
    }

    pub fn clock_rate(&self, clk: ClockId) -> u64 {
        self.state
            .lock()
            .unwrap()
            .clocks
            .get(&clk)
            .map_or(0, |c| c.rate)
    }

    pub fn write_sram(&self, offset: usize, data: &[u8]) {
        if let Err(e) = self.sram_write(offset, data) {
            warn!("sim: {e}");
        }
    }

    pub fn read_sram_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        if let Err(e) = self.sram_read(offset, &mut data) {
            warn!("sim: {e}");
        }
        data
    }

    pub fn shared_info(&self) -> SharedInfo {
        self.sram
            .read_obj(GuestAddress(self.profile.shared_info_offset as u64))
            .unwrap_or_default()
    }

    pub fn raise_voice_trigger(&self, phrase: u8, score: u16, frame_count: u16) {
        self.inject(Self::trigger_injection(phrase, score, frame_count));
    }

    /// `pointer` is the absolute bus address the firmware wrote up to.
    pub fn raise_period_elapsed(&self, stream: PcmStream, pointer: u32) {
        let (slot, line) = match stream {
            PcmStream::Trigger => (SLOT_TRI_POINTER, IrqLine::TriggerPeriodElapsed),
            PcmStream::Record => (SLOT_REC_POINTER, IrqLine::RecordPeriodElapsed),
        };
        self.inject(Injection {
            writes: vec![(slot, pointer)],
            line,
        });
    }

    pub fn raise_fault(&self, code: u32) {
        self.inject(Self::fault_injection(code));
    }

    pub fn raise_log_buffer_full(&self, half: usize) {
        let line = if half == 0 {
            IrqLine::DebugLogBufZero
        } else {
            IrqLine::DebugLogBufOne
        };
        self.inject(Injection {
            writes: Vec::new(),
            line,
        });
    }

    pub fn raise_dump_ready(&self, kind: DumpKind, offset: u32, size: u32) {
        let line = match kind {
            DumpKind::Audio => IrqLine::AudioDump,
            DumpKind::Log => IrqLine::LogDump,
        };
        self.inject(Injection {
            writes: vec![(SLOT_PAYLOAD, offset), (SLOT_PAYLOAD + 1, size)],
            line,
        });
    }
}

impl HardwareBackend for SimulatedVts {
    fn profile(&self) -> &SocProfile {
        &self.profile
    }

    fn connect_irq(&self, sink: IrqSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    fn irq_enable(&self, enable: bool) {
        self.state.lock().unwrap().irq_enabled = enable;
    }

    fn mailbox_write(&self, slot: usize, values: &[u32]) -> Result<()> {
        if slot + values.len() > MAILBOX_SLOTS {
            return Err(Error::MailboxOutOfRange(slot, values.len()));
        }

        let mut state = self.state.lock().unwrap();
        state.mailbox[slot..slot + values.len()].copy_from_slice(values);

        if slot == SLOT_PAYLOAD && values.len() == PAYLOAD_WORDS {
            state.record(MailboxOp::Payload);
        } else if slot == SLOT_ACK && values == [0] {
            state.record(MailboxOp::AckClear);
            state.in_flight = false;

            let pending = std::mem::take(&mut state.pending);
            if !pending.is_empty() {
                for injection in &pending {
                    state.apply(injection);
                }
                let sink = state.sink.clone();
                drop(state);
                let lines: Vec<_> = pending.iter().map(|i| i.line).collect();
                Self::raise(sink, &lines);
            }
        }
        Ok(())
    }

    fn mailbox_read(&self, slot: usize, values: &mut [u32]) -> Result<()> {
        if slot + values.len() > MAILBOX_SLOTS {
            return Err(Error::MailboxOutOfRange(slot, values.len()));
        }
        let state = self.state.lock().unwrap();
        values.copy_from_slice(&state.mailbox[slot..slot + values.len()]);
        Ok(())
    }

    fn ring_doorbell(&self, id: MessageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.behavior.doorbell_error {
            return Err(e);
        }
        *state.doorbells.entry(id).or_default() += 1;

        // Host acknowledging a firmware interrupt.
        if id == MessageId::IpcReceived {
            if !state.in_flight {
                state.mailbox[SLOT_ACK] = 0;
            }
            return Ok(());
        }

        state.record(MailboxOp::Doorbell(id));
        let payload = [state.mailbox[0], state.mailbox[1], state.mailbox[2]];
        state.last_payload.insert(id, payload);
        state.in_flight = true;

        if !(state.powered && state.booted) {
            debug!("fw: {id} rung while firmware down");
            return Ok(());
        }

        let ack = match state.behavior.ack {
            AckPolicy::All => id.ack_bit(),
            AckPolicy::Nothing => return Ok(()),
            AckPolicy::Ignore(ignored) if ignored == id => return Ok(()),
            AckPolicy::Reject(rejected) if rejected == id => FW_NACK,
            _ => id.ack_bit(),
        };
        if ack == id.ack_bit() {
            self.process(&mut state, id, payload);
        }
        state.mailbox[SLOT_ACK] = ack;

        let sink = state.sink.clone();
        drop(state);
        Self::raise(sink, &[IrqLine::IpcReceived]);
        Ok(())
    }

    fn sram_write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_sram(offset, data.len())?;
        self.sram
            .write_slice(data, GuestAddress(offset as u64))
            .map_err(|_| Error::SramOutOfRange(offset, data.len()))?;

        // Anything written at the reset vector is taken as a firmware image.
        if offset == 0 && !data.is_empty() {
            self.state.lock().unwrap().fw_loaded = true;
        }
        Ok(())
    }

    fn sram_read(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        self.check_sram(offset, data.len())?;
        self.sram
            .read_slice(data, GuestAddress(offset as u64))
            .map_err(|_| Error::SramOutOfRange(offset, data.len()))
    }

    fn load_verified(&self, image: &[u8]) -> Result<()> {
        if self.state.lock().unwrap().behavior.verify_fails {
            return Err(Error::VerificationFailed);
        }
        self.sram_write(0, image)?;
        self.state.lock().unwrap().verified_loads += 1;
        Ok(())
    }

    fn clk_prepare(&self, clk: ClockId) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .clocks
            .entry(clk)
            .or_default()
            .prepared = true;
        Ok(())
    }

    fn clk_unprepare(&self, clk: ClockId) {
        if let Some(c) = self.state.lock().unwrap().clocks.get_mut(&clk) {
            c.prepared = false;
        }
    }

    fn clk_enable(&self, clk: ClockId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.behavior.failing_clock == Some(clk) {
            return Err(Error::ClockFailed(clk));
        }
        let c = state.clocks.entry(clk).or_default();
        if !c.prepared {
            error!("sim: clock {clk:?} enabled while unprepared");
            return Err(Error::ClockFailed(clk));
        }
        c.enabled = true;
        Ok(())
    }

    fn clk_disable(&self, clk: ClockId) {
        if let Some(c) = self.state.lock().unwrap().clocks.get_mut(&clk) {
            c.enabled = false;
        }
    }

    fn clk_rate(&self, clk: ClockId) -> u64 {
        self.clock_rate(clk)
    }

    fn clk_set_rate(&self, clk: ClockId, rate: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.behavior.failing_clock == Some(clk) {
            return Err(Error::ClockFailed(clk));
        }
        state.clocks.entry(clk).or_default().rate = rate;
        Ok(())
    }

    fn cpu_power(&self, on: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.behavior.power_fails {
            return Err(Error::PowerFailed);
        }

        if !on {
            if !state.behavior.power_stuck {
                state.powered = false;
                state.booted = false;
                state.fw_loaded = false;
            }
            return Ok(());
        }

        if !state.powered {
            state.powered = true;
            state.power_on_count += 1;
        }
        if !(state.fw_loaded && state.cpu_enabled && !state.booted) {
            return Ok(());
        }

        let Some(injection) = self.boot(&mut state) else {
            return Ok(());
        };
        state.apply(&injection);
        let sink = state.sink.clone();
        drop(state);
        Self::raise(sink, &[injection.line]);
        Ok(())
    }

    fn power_status(&self) -> bool {
        self.state.lock().unwrap().powered
    }

    fn cpu_set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().cpu_enabled = enabled;
    }

    fn cpu_parked(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.cpu_enabled && !state.behavior.wedged
    }

    fn read_gpr(&self, index: usize) -> u32 {
        if self.state.lock().unwrap().booted {
            0x0000_1000 + 4 * index as u32
        } else {
            0
        }
    }

    fn set_pads_active(&self, active: bool) {
        self.state.lock().unwrap().pads_active = active;
    }

    fn set_pad_retention(&self, retain: bool) {
        self.state.lock().unwrap().pad_retention = retain;
    }

    fn save_registers(&self) {
        debug!("sim: registers saved");
    }

    fn restore_registers(&self) {
        debug!("sim: registers restored");
    }

    fn configure_mic(&self, path: Option<&MicPath>) {
        self.state.lock().unwrap().mic = path.copied();
    }

    fn map_dram(&self, size: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.dram_base = state.behavior.dram_base;
        debug!("sim: DRAM alias {:#x} size {size:#x}", state.dram_base);
        state.dram_base
    }

    fn soc_resume(&self) -> Result<()> {
        self.state.lock().unwrap().soc_suspended = false;
        Ok(())
    }

    fn soc_suspend(&self) -> Result<()> {
        self.state.lock().unwrap().soc_suspended = true;
        Ok(())
    }

    fn watchdog_expire(&self) {
        error!("sim: watchdog expired");
        self.state.lock().unwrap().watchdog_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::irq::IrqEvent;

    fn sim() -> (SimulatedVts, mpsc::Receiver<IrqEvent>) {
        let sim = SimulatedVts::new(SocProfile::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        sim.connect_irq(IrqSink::new(tx));
        (sim, rx)
    }

    fn next_line(rx: &mpsc::Receiver<IrqEvent>) -> Option<IrqLine> {
        match rx.try_recv() {
            Ok(IrqEvent::Line(line)) => Some(line),
            _ => None,
        }
    }

    fn boot(sim: &SimulatedVts, rx: &mpsc::Receiver<IrqEvent>) {
        sim.sram_write(0, b"image").unwrap();
        sim.cpu_set_enabled(true);
        sim.cpu_power(true).unwrap();
        assert_eq!(next_line(rx), Some(IrqLine::BootCompleted));
    }

    #[test]
    fn test_sram_bounds() {
        let (sim, _rx) = sim();
        let size = sim.profile().sram_size;
        sim.sram_write(size - 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(sim.read_sram_vec(size - 4, 4), vec![1, 2, 3, 4]);
        assert_matches!(
            sim.sram_write(size - 2, &[0; 4]),
            Err(Error::SramOutOfRange(_, 4))
        );
        assert_matches!(
            sim.mailbox_read(MAILBOX_SLOTS - 1, &mut [0; 2]),
            Err(Error::MailboxOutOfRange(_, 2))
        );
    }

    #[test]
    fn test_boot_needs_image_and_enabled_core() {
        let (sim, rx) = sim();
        sim.cpu_power(true).unwrap();
        assert_eq!(next_line(&rx), None);
        sim.cpu_power(false).unwrap();

        boot(&sim, &rx);
        assert_eq!(sim.power_on_count(), 2);
        assert_eq!(sim.shared_info().fw_version, sim.behavior().fw_version);

        // Power off loses the image.
        sim.cpu_power(false).unwrap();
        sim.cpu_power(true).unwrap();
        assert_eq!(next_line(&rx), None);
    }

    #[test]
    fn test_firmware_answers_messages() {
        let (sim, rx) = sim();
        boot(&sim, &rx);

        sim.mailbox_write(SLOT_PAYLOAD, &[VERSION_DETECT_LIB, 0, 0])
            .unwrap();
        sim.ring_doorbell(MessageId::GetVersion).unwrap();
        assert_eq!(next_line(&rx), Some(IrqLine::IpcReceived));
        assert_eq!(sim.mailbox_word(SLOT_ACK), MessageId::GetVersion.ack_bit());
        assert_eq!(sim.mailbox_word(2), sim.behavior().detect_lib_version);

        sim.update(|b| b.ack = AckPolicy::Reject(MessageId::StartRec));
        sim.ring_doorbell(MessageId::StartRec).unwrap();
        assert_eq!(sim.mailbox_word(SLOT_ACK), FW_NACK);
    }

    #[test]
    fn test_injection_waits_for_ack_clear() {
        let (sim, rx) = sim();
        boot(&sim, &rx);

        sim.mailbox_write(SLOT_PAYLOAD, &[Command::ForceTrigger as u32, 2, 0])
            .unwrap();
        sim.ring_doorbell(MessageId::Command).unwrap();
        assert_eq!(next_line(&rx), Some(IrqLine::IpcReceived));
        sim.raise_fault(VTS_ERR_BUS_FAULT);
        assert_eq!(next_line(&rx), None);

        sim.mailbox_write(SLOT_ACK, &[0]).unwrap();
        assert_eq!(next_line(&rx), Some(IrqLine::VoiceTriggered));
        assert_eq!(next_line(&rx), Some(IrqLine::Error));
        assert_eq!(sim.mailbox_word(SLOT_FAULT_CODE), VTS_ERR_BUS_FAULT);
        assert_eq!(
            sim.trace(),
            vec![
                MailboxOp::Payload,
                MailboxOp::Doorbell(MessageId::Command),
                MailboxOp::AckClear
            ]
        );
    }

    #[test]
    fn test_clock_needs_prepare() {
        let (sim, _rx) = sim();
        assert_matches!(sim.clk_enable(ClockId::Src), Err(Error::ClockFailed(_)));
        sim.clk_prepare(ClockId::Src).unwrap();
        sim.clk_enable(ClockId::Src).unwrap();
        assert!(sim.clock_enabled(ClockId::Src));
    }
}
