// VTS device context and runtime power sequencing
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc::{self, Sender},
        Arc, Condvar, Mutex, RwLock,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, error, info, warn};
use thiserror::Error as ThisError;
use vm_memory::ByteValued;

use crate::{
    backend::{self, HardwareBackend, MicType},
    clock::{sys_sel_path, ClockManager},
    dump::{DumpReason, DumpTable},
    ipc::{self, IpcChannel},
    irq::{spawn_dispatcher, IrqEvent, IrqSink, PcmStream, PeriodListener},
    mic::{validate_phrase, MicConsumer, MicResources},
    poll::{PollEvents, WakeLock},
    protocol::*,
    state::{self, VtsState},
    worker::{spawn_worker, Work},
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, ThisError)]
/// Errors returned by the runtime control operations
pub enum Error {
    #[error("IPC failed: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("Hardware backend failed: {0}")]
    Backend(#[from] backend::Error),
    #[error("{0}")]
    State(#[from] state::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Firmware is not running")]
    NotRunning,
    #[error("Firmware not ready")]
    NotReady,
    #[error("Firmware image not loaded")]
    FirmwareNotLoaded,
    #[error("Sound model not loaded")]
    SoundModelNotLoaded,
    #[error("Sound model of {0} bytes at offset {1:#x} does not fit")]
    SoundModelTooLarge(usize, usize),
    #[error("Invalid phrase id {0}")]
    InvalidPhrase(u8),
    #[error("Invalid message id {0}")]
    InvalidMessage(u32),
    #[error("Invalid trigger value {0} ms")]
    InvalidTriggerValue(u32),
    #[error("Core power check failed")]
    PowerCheckFailed,
    #[error("Recovery attempts exhausted after {0} tries")]
    RecoveryExhausted(u32),
    #[error("Could not spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, std::io::Error),
    #[error("Could not create event notifier: {0}")]
    EventFd(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runtime tunables, changed through the control surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub active_phrase: u8,
    /// Bytes of audio preceding the trigger kept by the firmware.
    pub target_size: u32,
    pub mic: MicType,
    pub amic_gain: u32,
    pub dmic_gain: u32,
    pub sys_sel: u32,
    pub mic_num: u32,
    pub sysclk_div: u32,
    pub fw_log: bool,
    pub audio_dump: bool,
    pub log_dump: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_phrase: 1,
            target_size: 0,
            mic: MicType::Dmic,
            amic_gain: 4,
            dmic_gain: 2,
            sys_sel: 1,
            mic_num: 1,
            sysclk_div: 1,
            fw_log: false,
            audio_dump: false,
            log_dump: false,
        }
    }
}

/// Fixed at device creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub silent_reset: bool,
    pub max_recovery_attempts: u32,
    pub verified_boot: bool,
    pub full_sram_dump: bool,
    pub log_dir: Option<PathBuf>,
    pub settings: Settings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            silent_reset: false,
            max_recovery_attempts: 3,
            verified_boot: false,
            full_sram_dump: false,
            log_dir: None,
            settings: Settings::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SramRegion {
    pub offset: usize,
    pub size: usize,
}

/// SRAM regions the firmware announced in IPC replies.
#[derive(Debug, Default)]
pub(crate) struct FwRegions {
    pub(crate) log: Option<SramRegion>,
    pub(crate) audio_dump: Option<SramRegion>,
    pub(crate) log_dump: Option<SramRegion>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub fw: u32,
    pub detect_lib: u32,
    pub google: u32,
    pub hotword_id: [u32; 10],
}

impl VersionInfo {
    /// Firmware version as four ASCII characters.
    pub fn fw_string(&self) -> String {
        self.fw
            .to_be_bytes()
            .iter()
            .map(|b| char::from(*b))
            .collect()
    }

    pub fn detect_lib_string(&self) -> String {
        let [_, major, minor, patch] = self.detect_lib.to_be_bytes();
        format!("{major}.{minor}.{patch}")
    }
}

/// Boolean with a waitable rising edge.
#[derive(Debug, Default)]
pub(crate) struct ReadyFlag {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadyFlag {
    pub(crate) fn set(&self) {
        *self.ready.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub(crate) fn clear(&self) {
        *self.ready.lock().unwrap() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.ready.lock().unwrap()
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let guard = self.ready.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |ready| !*ready)
            .unwrap();
        *guard
    }
}

#[derive(Debug, Default)]
struct SoundModel {
    data: Vec<u8>,
    offset: usize,
    /// Staged but not yet copied to SRAM.
    pending: bool,
    /// Present in SRAM for the current power cycle.
    uploaded: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Recognition {
    active: u32,
    model: SoundModel,
}

/// Runtime state of one voice trigger coprocessor.
pub struct VtsDevice<B: HardwareBackend> {
    pub(crate) backend: B,
    pub(crate) config: DeviceConfig,
    pub(crate) settings: Mutex<Settings>,
    pub(crate) state: Mutex<VtsState>,
    pub(crate) ipc: IpcChannel,
    pub(crate) fw_ready: ReadyFlag,
    pub(crate) running: AtomicBool,
    pub(crate) enabled: AtomicBool,
    pub(crate) irq_enabled: AtomicBool,
    pub(crate) abnormal: AtomicBool,
    pub(crate) recovery_try_cnt: AtomicU32,
    pub(crate) clocks: ClockManager,
    pub(crate) mic: Mutex<MicResources>,
    pub(crate) recognition: Mutex<Recognition>,
    pub(crate) poll: PollEvents,
    pub(crate) wake_lock: WakeLock,
    pub(crate) dumps: DumpTable,
    pub(crate) panic_dumped: AtomicBool,
    pub(crate) versions: Mutex<Option<VersionInfo>>,
    pub(crate) regions: Mutex<FwRegions>,
    pub(crate) dma_base: AtomicU32,
    pub(crate) listeners: Mutex<Vec<Arc<dyn PeriodListener>>>,
    firmware: RwLock<Option<Vec<u8>>>,
    // Serializes resume and suspend.
    pm_lock: Mutex<()>,
    irq_tx: Sender<IrqEvent>,
    pub(crate) work_tx: Sender<Work>,
    epoch: Instant,
}

impl<B: HardwareBackend> VtsDevice<B> {
    pub fn new(backend: B, config: DeviceConfig) -> Result<Arc<Self>> {
        let (irq_tx, irq_rx) = mpsc::channel();
        let (work_tx, work_rx) = mpsc::channel();

        let clocks = ClockManager::default();
        clocks.prepare(&backend)?;
        backend.connect_irq(IrqSink::new(irq_tx.clone()));

        let dev = Arc::new(Self {
            settings: Mutex::new(config.settings.clone()),
            config,
            state: Mutex::new(VtsState::new()),
            ipc: IpcChannel::default(),
            fw_ready: ReadyFlag::default(),
            running: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            irq_enabled: AtomicBool::new(false),
            abnormal: AtomicBool::new(false),
            recovery_try_cnt: AtomicU32::new(0),
            clocks,
            mic: Mutex::new(MicResources::default()),
            recognition: Mutex::new(Recognition::default()),
            poll: PollEvents::new().map_err(Error::EventFd)?,
            wake_lock: WakeLock::default(),
            dumps: DumpTable::default(),
            panic_dumped: AtomicBool::new(false),
            versions: Mutex::new(None),
            regions: Mutex::new(FwRegions::default()),
            dma_base: AtomicU32::new(0),
            listeners: Mutex::new(Vec::new()),
            firmware: RwLock::new(None),
            pm_lock: Mutex::new(()),
            irq_tx,
            work_tx,
            epoch: Instant::now(),
            backend,
        });

        spawn_dispatcher(Arc::downgrade(&dev), irq_rx)
            .map_err(|e| Error::ThreadSpawn("interrupt", e))?;
        spawn_worker(Arc::downgrade(&dev), work_rx).map_err(|e| Error::ThreadSpawn("worker", e))?;
        Ok(dev)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> VtsState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_fw_ready(&self) -> bool {
        self.fw_ready.is_set()
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal.load(Ordering::Acquire)
    }

    pub fn recovery_try_cnt(&self) -> u32 {
        self.recovery_try_cnt.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.lock().unwrap());
    }

    pub fn dma_base(&self) -> u32 {
        self.dma_base.load(Ordering::Acquire)
    }

    pub fn active_phrases(&self) -> u32 {
        self.recognition.lock().unwrap().active
    }

    pub fn versions(&self) -> Option<VersionInfo> {
        *self.versions.lock().unwrap()
    }

    pub(crate) fn timestamp_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    pub fn poll_events(&self) -> &PollEvents {
        &self.poll
    }

    pub fn wait_poll_event(&self, timeout: Duration) -> Option<u32> {
        self.poll.wait_ready(timeout)
    }

    pub fn register_period_listener(&self, listener: Arc<dyn PeriodListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Block until every interrupt raised so far has been handled.
    pub fn sync_irq(&self) {
        let (tx, rx) = mpsc::channel();
        if self.irq_tx.send(IrqEvent::Sync(tx)).is_err() || rx.recv_timeout(SYNC_TIMEOUT).is_err()
        {
            warn!("interrupt sync timed out");
        }
    }

    /// Stage the firmware image copied to SRAM on every resume.
    pub fn load_firmware(&self, image: Vec<u8>) {
        info!("firmware image of {} bytes staged", image.len());
        *self.firmware.write().unwrap() = Some(image);
    }

    /// Power the core up and bring the firmware to a running state.
    /// Returns immediately when already running, unless a fault left the
    /// core abnormal, in which case it is torn down and booted again.
    pub fn resume(&self) -> Result<()> {
        let _pm = self.pm_lock.lock().unwrap();
        if self.is_running() {
            if !self.is_abnormal() {
                debug!("resume: already running");
                return Ok(());
            }
            warn!("resume: core abnormal, tearing down before reboot");
            if let Err(e) = self.teardown() {
                warn!("resume teardown: {e}");
            }
        }

        self.state.lock().unwrap().resuming()?;
        info!("resume");

        if let Err(e) = self.boot() {
            error!("resume failed: {e}");
            self.rollback_resume();
            return Err(e);
        }

        self.running.store(true, Ordering::Release);
        self.state.lock().unwrap().resumed()?;
        if self.abnormal.swap(false, Ordering::AcqRel) {
            info!("recovered from abnormal state");
        }
        Ok(())
    }

    fn boot(&self) -> Result<()> {
        self.enabled.store(true, Ordering::Release);
        self.backend.soc_resume()?;
        self.clocks.enable_all(&self.backend)?;
        self.backend.restore_registers();
        self.backend.set_pad_retention(false);
        self.backend.set_pads_active(true);
        self.irq_enabled.store(true, Ordering::Release);
        self.backend.irq_enable(true);

        if self.is_abnormal() {
            warn!("core abnormal, resetting before boot");
            if let Err(e) = self.reset() {
                warn!("reset: {e}");
            }
        }

        self.download_firmware()?;
        self.cpu_enable(true)?;
        self.power(true);
        if !self.power_check() {
            return Err(Error::PowerCheckFailed);
        }
        self.wait_for_fw_ready()?;

        self.update_sysclk();
        if let Err(e) = self.check_version() {
            warn!("version query failed: {e}");
        }

        let sys_sel = self.settings.lock().unwrap().sys_sel;
        match sys_sel_path(sys_sel) {
            Some(path) => self.clocks.set_rate(&self.backend, &path),
            None => warn!("invalid sys_sel {sys_sel}"),
        }

        let base = self.backend.map_dram(BUFFER_BYTES_MAX);
        self.dma_base.store(base, Ordering::Release);
        self.transact(
            MessageId::SetDramBuffer,
            [base, DRAM_PERIOD_BYTES, DRAM_BUFFER_PERIODS],
            true,
        )?;
        self.send_command(Command::EnableSramLog, [0, 0], true)?;

        let settings = self.settings();
        if settings.fw_log {
            self.send_command(Command::EnableDebugLog, [0, 0], true)?;
        }
        if settings.audio_dump {
            self.send_command(Command::EnableAudioDump, [0, 0], true)?;
        }
        if settings.log_dump {
            self.send_command(Command::EnableLogDump, [0, 0], true)?;
        }

        if let Err(e) = self.update_kernel_time() {
            warn!("kernel time update failed: {e}");
        }
        Ok(())
    }

    fn rollback_resume(&self) {
        self.power(false);
        self.irq_enabled.store(false, Ordering::Release);
        self.backend.irq_enable(false);
        self.clocks.disable_all(&self.backend);
        if let Err(e) = self.backend.soc_suspend() {
            warn!("soc suspend: {e}");
        }
        self.backend.set_pads_active(false);
        self.fw_ready.clear();
        self.running.store(false, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        if let Err(e) = self.state.lock().unwrap().suspended() {
            warn!("resume rollback: {e}");
        }
    }

    fn download_firmware(&self) -> Result<()> {
        let firmware = self.firmware.read().unwrap();
        let Some(image) = firmware.as_deref() else {
            error!("firmware image not loaded");
            return Err(Error::FirmwareNotLoaded);
        };

        if self.config.verified_boot {
            self.backend.load_verified(image)?;
        } else {
            self.backend.sram_write(0, image)?;
        }
        debug!("firmware downloaded, {} bytes", image.len());
        Ok(())
    }

    /// Wait for the boot-completed interrupt, bounded by the SoC budget.
    pub fn wait_for_fw_ready(&self) -> Result<()> {
        let timeout = self.backend.profile().fw_ready_timeout;
        if self.fw_ready.wait(timeout) {
            return Ok(());
        }

        error!("firmware not ready after {timeout:?}");
        self.dump(DumpReason::FwNotReady);
        Err(Error::Timeout("firmware ready"))
    }

    fn update_sysclk(&self) {
        let div = self.settings.lock().unwrap().sysclk_div.max(1);
        let rate = self.backend.profile().sys_clock_max / u64::from(div);
        self.clocks
            .set_rate(&self.backend, &[(backend::ClockId::Sys, rate)]);
    }

    /// Query firmware and detection library versions. Cached after the
    /// first success.
    pub fn check_version(&self) -> Result<VersionInfo> {
        if let Some(versions) = self.versions() {
            return Ok(versions);
        }

        let google =
            self.transact_with_reply(MessageId::GetVersion, [VERSION_GOOGLE, 0, 0], true)?[2];
        let detect_lib =
            self.transact_with_reply(MessageId::GetVersion, [VERSION_DETECT_LIB, 0, 0], true)?[2];

        let mut shared = SharedInfo::default();
        self.backend
            .sram_read(self.backend.profile().shared_info_offset, shared.as_mut_slice())?;

        let versions = VersionInfo {
            fw: shared.fw_version,
            detect_lib,
            google,
            hotword_id: shared.hotword_id,
        };
        info!(
            "firmware version {} detect lib {} google {:#x}",
            versions.fw_string(),
            versions.detect_lib_string(),
            versions.google
        );
        *self.versions.lock().unwrap() = Some(versions);
        Ok(versions)
    }

    fn update_kernel_time(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let sec = u32::try_from(now.as_secs()).unwrap_or(u32::MAX);
        let msec = now.subsec_millis();

        let offset = self.backend.profile().shared_info_offset;
        let mut shared = SharedInfo::default();
        self.backend.sram_read(offset, shared.as_mut_slice())?;
        shared.kernel_sec = sec;
        shared.kernel_msec = msec;
        self.backend.sram_write(offset, shared.as_slice())?;

        self.send_command(Command::KernelTime, [sec, msec], true)?;
        Ok(())
    }

    /// Bring the core down. Secondary IPC failures are logged and skipped;
    /// a failed power down is reported after the teardown completes.
    pub fn suspend(&self) -> Result<()> {
        let _pm = self.pm_lock.lock().unwrap();
        self.teardown()
    }

    /// Suspend body; the caller holds `pm_lock`.
    fn teardown(&self) -> Result<()> {
        let current = self.state();
        if matches!(
            current,
            VtsState::None | VtsState::RuntimeSuspended | VtsState::VoiceCall
        ) {
            debug!("suspend: nothing to do in {current}");
            return Ok(());
        }

        info!("suspend from {current}");
        let running = self.is_running();
        let mut result = Ok(());

        if running {
            if current == VtsState::RecogTriggered {
                self.restart_recognition();
            }
            self.disable_fw_logging();
        }

        self.state.lock().unwrap().suspending()?;
        self.backend.save_registers();

        if running {
            if !(self.config.silent_reset && self.is_abnormal()) {
                result = self.power_down();
            }
            self.dump(DumpReason::RuntimeSuspend);
            if let Err(e) = self.cpu_enable(false) {
                warn!("suspend: {e}");
            }
            self.irq_enabled.store(false, Ordering::Release);
            self.backend.irq_enable(false);
            self.clocks.disable_all(&self.backend);
            if let Err(e) = self.backend.soc_suspend() {
                warn!("soc suspend: {e}");
            }
            self.flush_log(0);
            self.flush_log(1);
        }

        self.state.lock().unwrap().suspended()?;

        if running {
            self.power(false);
            self.running.store(false, Ordering::Release);
        }

        self.backend.set_pads_active(false);
        self.backend.set_pad_retention(true);
        self.enabled.store(false, Ordering::Release);
        self.release_mics();
        {
            let mut recognition = self.recognition.lock().unwrap();
            recognition.active = 0;
            let model = &mut recognition.model;
            model.uploaded = false;
            model.pending = !model.data.is_empty();
        }
        self.settings.lock().unwrap().target_size = 0;
        *self.regions.lock().unwrap() = FwRegions::default();
        self.fw_ready.clear();
        result
    }

    fn power_down(&self) -> Result<()> {
        if let Err(e) = self.transact(MessageId::PowerDown, [0; PAYLOAD_WORDS], true) {
            warn!("power down failed, retrying: {e}");
            if let Err(e) = self.transact(MessageId::PowerDown, [0; PAYLOAD_WORDS], true) {
                error!("power down failed: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn disable_fw_logging(&self) {
        let settings = self.settings();
        let debug_log = self.regions.lock().unwrap().log.is_some();

        for (enabled, cmd) in [
            (settings.audio_dump, Command::DisableAudioDump),
            (settings.log_dump, Command::DisableLogDump),
            (debug_log, Command::DisableDebugLog),
        ] {
            if enabled {
                if let Err(e) = self.send_command(cmd, [0, 0], true) {
                    warn!("{cmd:?}: {e}");
                }
            }
        }
    }

    /// Re-arm detection after a trigger that was not consumed.
    fn restart_recognition(&self) {
        let phrase = u32::from(self.settings.lock().unwrap().active_phrase);
        match self.transact(MessageId::RestartRecognition, [phrase, 0, 0], true) {
            Ok(()) => {
                if let Err(e) = self.state.lock().unwrap().recog_started() {
                    warn!("restart recognition: {e}");
                }
            }
            Err(e) => warn!("restart recognition failed: {e}"),
        }
    }

    /// Stage a sound model; it is copied to SRAM when recognition starts.
    pub fn load_sound_model(&self, data: &[u8], offset: Option<usize>) -> Result<()> {
        let profile = self.backend.profile();
        let offset = offset.unwrap_or(profile.sound_model_offset);
        let fits = offset
            .checked_add(data.len())
            .is_some_and(|end| end <= profile.sram_size);
        if data.len() > SOUND_MODEL_MAX_SIZE || !fits {
            return Err(Error::SoundModelTooLarge(data.len(), offset));
        }

        let mut recognition = self.recognition.lock().unwrap();
        recognition.model = SoundModel {
            data: data.to_vec(),
            offset,
            pending: true,
            uploaded: false,
        };
        info!("sound model staged: {} bytes at {offset:#x}", data.len());
        Ok(())
    }

    fn upload_sound_model(&self, model: &mut SoundModel) -> Result<()> {
        if model.pending {
            self.backend.sram_write(model.offset, &model.data)?;
            model.pending = false;
            model.uploaded = true;
            debug!("sound model uploaded");
        }
        if !model.uploaded {
            return Err(Error::SoundModelNotLoaded);
        }
        Ok(())
    }

    /// Arm keyword detection for `phrase`. Already armed phrases are left
    /// alone.
    pub fn start_recognition(&self, phrase: u8) -> Result<()> {
        validate_phrase(phrase)?;
        let mut recognition = self.recognition.lock().unwrap();
        let bit = MicConsumer::Phrase(phrase).bit();
        if recognition.active & bit != 0 {
            debug!("phrase {phrase} already started");
            return Ok(());
        }
        if !self.is_running() {
            return Err(Error::NotRunning);
        }

        self.upload_sound_model(&mut recognition.model)?;
        self.set_mic(MicConsumer::Phrase(phrase), true)?;

        let mic_num = self.settings.lock().unwrap().mic_num;
        let ret = self
            .transact(MessageId::SetMode, [u32::from(phrase), mic_num, 0], true)
            .and_then(|_| {
                self.transact(MessageId::StartRecognition, [u32::from(phrase), 0, 0], true)
            });
        if let Err(e) = ret {
            error!("start recognition {phrase}: {e}");
            if let Err(e) = self.set_mic(MicConsumer::Phrase(phrase), false) {
                warn!("mic rollback: {e}");
            }
            return Err(e.into());
        }

        recognition.active |= bit;
        self.state.lock().unwrap().recog_started()?;
        self.poll.reset();
        info!("recognition started for phrase {phrase}");
        Ok(())
    }

    /// Disarm `phrase` and release its mic resource.
    pub fn stop_recognition(&self, phrase: u8) -> Result<()> {
        validate_phrase(phrase)?;
        let mut recognition = self.recognition.lock().unwrap();
        let bit = MicConsumer::Phrase(phrase).bit();
        if recognition.active & bit == 0 {
            debug!("phrase {phrase} not started");
            return Ok(());
        }

        if let Err(e) = self.transact(MessageId::StopRecognition, [u32::from(phrase), 0, 0], true)
        {
            warn!("stop recognition {phrase}: {e}");
        }
        recognition.active &= !bit;
        if recognition.active == 0 {
            if let Err(e) = self.state.lock().unwrap().recog_stopped() {
                debug!("stop recognition: {e}");
            }
        }
        self.set_mic(MicConsumer::Phrase(phrase), false)?;
        info!("recognition stopped for phrase {phrase}");
        Ok(())
    }

    /// Start streaming audio out of the shared DRAM ring.
    pub fn start_capture(&self, stream: PcmStream) -> Result<()> {
        match stream {
            PcmStream::Trigger => self.transact(MessageId::StartCopy, [0; PAYLOAD_WORDS], true)?,
            PcmStream::Record => {
                self.set_mic(MicConsumer::Record, true)?;
                if let Err(e) = self.transact(MessageId::StartRec, [0; PAYLOAD_WORDS], true) {
                    if let Err(e) = self.set_mic(MicConsumer::Record, false) {
                        warn!("mic rollback: {e}");
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    pub fn stop_capture(&self, stream: PcmStream) -> Result<()> {
        let id = match stream {
            PcmStream::Trigger => MessageId::StopCopy,
            PcmStream::Record => MessageId::StopRec,
        };
        if let Err(e) = self.transact(id, [0; PAYLOAD_WORDS], true) {
            warn!("{id}: {e}");
        }
        if stream == PcmStream::Record {
            self.set_mic(MicConsumer::Record, false)?;
        }
        Ok(())
    }

    /// The voice call path owns the microphones; the core stays down
    /// until [`Self::exit_voice_call`].
    pub fn enter_voice_call(&self) -> Result<()> {
        let _pm = self.pm_lock.lock().unwrap();
        self.state.lock().unwrap().voice_call()?;
        info!("voice call started");
        Ok(())
    }

    pub fn exit_voice_call(&self) -> Result<()> {
        let _pm = self.pm_lock.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if *state == VtsState::VoiceCall {
            state.suspended()?;
            info!("voice call ended");
        }
        Ok(())
    }

    /// Restart a core flagged abnormal by the fault handler.
    pub fn recover(&self) -> Result<()> {
        if !self.is_abnormal() {
            return Ok(());
        }

        let attempts = self.recovery_try_cnt();
        if attempts > self.config.max_recovery_attempts {
            error!("not recovering, {attempts} attempts made");
            return Err(Error::RecoveryExhausted(attempts));
        }
        warn!("recovering, attempt {attempts}");
        self.restart()
    }

    /// Reset the core and restore the armed phrases, regardless of faults.
    pub fn force_reset(&self) -> Result<()> {
        warn!("forced reset");
        self.abnormal.store(true, Ordering::Release);
        self.restart()
    }

    fn restart(&self) -> Result<()> {
        let phrases = self.active_phrases();
        if let Err(e) = self.suspend() {
            warn!("restart teardown: {e}");
        }
        self.resume()?;

        for phrase in 0..=MAX_PHRASE_ID {
            if phrases & MicConsumer::Phrase(phrase).bit() != 0 {
                if let Err(e) = self.start_recognition(phrase) {
                    warn!("restart: phrase {phrase}: {e}");
                }
            }
        }
        Ok(())
    }
}

impl<B: HardwareBackend> Drop for VtsDevice<B> {
    fn drop(&mut self) {
        let _ = self.irq_tx.send(IrqEvent::Exit);
        let _ = self.work_tx.send(Work::Exit);
        if self.is_running() {
            self.power(false);
        }
        self.clocks.unprepare(&self.backend);
    }
}
