// VTS IPC transaction engine
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error as ThisError;

use crate::{
    backend::{self, HardwareBackend},
    device::{SramRegion, VtsDevice},
    dump::DumpReason,
    protocol::*,
    state::VtsState,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ThisError)]
/// Errors returned by a mailbox transaction
pub enum Error {
    #[error("IPC {0} rejected in state {1}")]
    WrongState(MessageId, VtsState),
    #[error("Firmware not ready")]
    NotReady,
    #[error("IPC {0} timed out")]
    Timeout(MessageId),
    #[error("IPC {0} failed, firmware answered {1:#x}")]
    Failed(MessageId, u32),
    #[error("Mailbox access failed: {0}")]
    Mailbox(backend::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Host side view of the transaction in flight.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum IpcState {
    #[default]
    Idle,
    SendMsg,
    SendMsgOk,
    SendMsgFail,
}

#[derive(Debug, Default)]
struct Progress {
    state: IpcState,
    running: Option<MessageId>,
}

/// Serializes transactions and tracks the completion reported by the
/// IPC-received interrupt.
#[derive(Debug, Default)]
pub struct IpcChannel {
    lock: Mutex<()>,
    progress: Mutex<Progress>,
    completion: Condvar,
}

impl IpcChannel {
    fn begin(&self, id: MessageId) {
        let mut progress = self.progress.lock().unwrap();
        progress.state = IpcState::SendMsg;
        progress.running = Some(id);
    }

    fn finish(&self) {
        let mut progress = self.progress.lock().unwrap();
        progress.state = IpcState::Idle;
        progress.running = None;
    }

    /// Record the ack word delivered with the IPC-received interrupt.
    pub(crate) fn complete(&self, ack: u32) {
        let mut progress = self.progress.lock().unwrap();
        // A zero ack word is a late interrupt for an already cleared slot.
        if progress.state != IpcState::SendMsg || ack == 0 {
            debug!("IPC received with nothing in flight: {ack:#x}");
            return;
        }

        progress.state = match progress.running {
            Some(id) if ack == id.ack_bit() => IpcState::SendMsgOk,
            _ => IpcState::SendMsgFail,
        };
        self.completion.notify_all();
    }

    fn wait_completion(&self, timeout: Duration) -> IpcState {
        let progress = self.progress.lock().unwrap();
        let (progress, _) = self
            .completion
            .wait_timeout_while(progress, timeout, |p| p.state == IpcState::SendMsg)
            .unwrap();
        progress.state
    }

    pub fn running(&self) -> Option<MessageId> {
        self.progress.lock().unwrap().running
    }

    pub fn state(&self) -> IpcState {
        self.progress.lock().unwrap().state
    }
}

impl<B: HardwareBackend> VtsDevice<B> {
    /// Send one message to the firmware. With `sync` set, block until the
    /// firmware acks it or the per-SoC budget runs out.
    pub fn transact(&self, id: MessageId, payload: [u32; PAYLOAD_WORDS], sync: bool) -> Result<()> {
        self.transact_with_reply(id, payload, sync).map(|_| ())
    }

    /// Like [`Self::transact`] but also returns the payload slots as left
    /// by the firmware, read while the channel is still held.
    pub fn transact_with_reply(
        &self,
        id: MessageId,
        payload: [u32; PAYLOAD_WORDS],
        sync: bool,
    ) -> Result<[u32; PAYLOAD_WORDS]> {
        {
            let state = self.state.lock().unwrap();
            if !state.permits(id) {
                warn!("IPC {id} rejected in state {state}");
                return Err(Error::WrongState(id, *state));
            }
        }

        if !self.is_enabled() || !self.is_fw_ready() {
            warn!("IPC {id} rejected, firmware not ready");
            return Err(Error::NotReady);
        }

        let _guard = self.ipc.lock.lock().unwrap();
        debug!("IPC {id} {payload:#x?} sync {sync}");
        self.ipc.begin(id);

        let result = self.exchange(id, &payload, sync);

        if let Err(e) = self.backend.mailbox_write(SLOT_ACK, &[0]) {
            warn!("IPC {id}: could not clear ack: {e}");
        }
        self.ipc.finish();
        result
    }

    fn exchange(
        &self,
        id: MessageId,
        payload: &[u32; PAYLOAD_WORDS],
        sync: bool,
    ) -> Result<[u32; PAYLOAD_WORDS]> {
        self.backend
            .mailbox_write(SLOT_PAYLOAD, payload)
            .map_err(Error::Mailbox)?;
        self.backend.ring_doorbell(id).map_err(Error::Mailbox)?;

        if !sync {
            return Ok([0; PAYLOAD_WORDS]);
        }

        let ack = self.wait_ack(id)?;
        if ack != id.ack_bit() {
            error!("IPC {id} failed: ack {ack:#x}");
            return Err(Error::Failed(id, ack));
        }

        let mut reply = [0; PAYLOAD_WORDS];
        self.backend
            .mailbox_read(SLOT_PAYLOAD, &mut reply)
            .map_err(Error::Mailbox)?;
        self.post_process(id, payload, &reply)?;
        Ok(reply)
    }

    fn read_ack(&self) -> Result<u32> {
        let mut ack = [0];
        self.backend
            .mailbox_read(SLOT_ACK, &mut ack)
            .map_err(Error::Mailbox)?;
        Ok(ack[0])
    }

    fn wait_ack(&self, id: MessageId) -> Result<u32> {
        let profile = self.backend.profile();
        for _ in 0..profile.ipc_poll_iterations {
            let ack = self.read_ack()?;
            if ack == id.ack_bit() {
                return Ok(ack);
            }

            match self.ipc.wait_completion(profile.ipc_poll_interval) {
                IpcState::SendMsgOk => return Ok(id.ack_bit()),
                IpcState::SendMsgFail => return self.read_ack(),
                _ => {}
            }
        }

        error!("IPC {id} timed out after {:?}", profile.ipc_timeout());
        self.dump(DumpReason::IpcTransFail);
        Err(Error::Timeout(id))
    }

    fn post_process(
        &self,
        id: MessageId,
        payload: &[u32; PAYLOAD_WORDS],
        reply: &[u32; PAYLOAD_WORDS],
    ) -> Result<()> {
        match id {
            MessageId::GetVersion => {
                debug!("firmware version word {:#x}", reply[2]);
            }
            MessageId::Command => {
                let Ok(cmd) = Command::try_from(payload[0]) else {
                    return Ok(());
                };
                if !matches!(
                    cmd,
                    Command::EnableDebugLog | Command::EnableAudioDump | Command::EnableLogDump
                ) {
                    return Ok(());
                }

                let mut aux = [0; AUX_WORDS];
                self.backend
                    .mailbox_read(SLOT_AUX, &mut aux)
                    .map_err(Error::Mailbox)?;
                let region = SramRegion {
                    offset: aux[0] as usize,
                    size: aux[1] as usize,
                };
                info!("{cmd:?}: region {:#x}+{:#x}", region.offset, region.size);

                let mut regions = self.regions.lock().unwrap();
                match cmd {
                    Command::EnableDebugLog => regions.log = Some(region),
                    Command::EnableAudioDump => regions.audio_dump = Some(region),
                    _ => regions.log_dump = Some(region),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Acknowledge a firmware initiated interrupt.
    pub fn ipc_ack(&self, result: u32) {
        if !self.is_fw_ready() {
            debug!("ack {result} dropped, firmware not ready");
            return;
        }

        let ret = self
            .backend
            .mailbox_write(SLOT_PAYLOAD, &[result])
            .and_then(|_| self.backend.ring_doorbell(MessageId::IpcReceived));
        if let Err(e) = ret {
            warn!("ack {result} failed: {e}");
        }
    }

    pub(crate) fn handle_ipc_received(&self) {
        match self.read_ack() {
            Ok(ack) => self.ipc.complete(ack),
            Err(e) => warn!("IPC received: {e}"),
        }
    }

    pub(crate) fn send_command(&self, cmd: Command, args: [u32; 2], sync: bool) -> Result<()> {
        self.transact(MessageId::Command, [cmd as u32, args[0], args[1]], sync)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        device::tests::{booted_device, test_device},
        simulator::{AckPolicy, MailboxOp},
    };

    #[test]
    fn test_channel_completion() {
        let channel = IpcChannel::default();
        channel.complete(1);
        assert_eq!(channel.state(), IpcState::Idle);

        channel.begin(MessageId::StartRecognition);
        assert_eq!(channel.running(), Some(MessageId::StartRecognition));
        channel.complete(MessageId::StartRecognition.ack_bit());
        assert_eq!(channel.state(), IpcState::SendMsgOk);

        channel.begin(MessageId::StopRecognition);
        channel.complete(MessageId::StartRecognition.ack_bit());
        assert_eq!(channel.state(), IpcState::SendMsgFail);

        channel.finish();
        assert_eq!(channel.running(), None);
        assert_eq!(
            channel.wait_completion(Duration::from_millis(1)),
            IpcState::Idle
        );
    }

    #[test]
    fn test_transact_rejected_before_resume() {
        let dev = test_device();
        assert_matches!(
            dev.transact(MessageId::StartRecognition, [1, 0, 0], true),
            Err(Error::WrongState(MessageId::StartRecognition, VtsState::None))
        );
        assert_eq!(dev.backend().doorbell_count(MessageId::StartRecognition), 0);
        assert!(dev.backend().trace().is_empty());
    }

    #[test]
    fn test_transact_not_ready() {
        let dev = booted_device();
        dev.fw_ready.clear();
        let before = dev.backend().trace().len();
        assert_matches!(
            dev.transact(MessageId::TargetSize, [0, 1, 0], true),
            Err(Error::NotReady)
        );
        assert_eq!(dev.backend().trace().len(), before);
    }

    #[test]
    fn test_transact_timeout_dumps_and_recovers() {
        let dev = booted_device();
        dev.backend()
            .update(|b| b.ack = AckPolicy::Ignore(MessageId::TargetSize));

        let start = Instant::now();
        assert_matches!(
            dev.transact(MessageId::TargetSize, [0x100, 1, 0], true),
            Err(Error::Timeout(MessageId::TargetSize))
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

        let record = dev.dump_record(DumpReason::IpcTransFail).unwrap();
        assert!(record.time_ns > 0);
        assert!(record.sram_log.starts_with(VTS_DUMP_MAGIC));

        // Channel is free again and the ack slot was cleared.
        assert_eq!(dev.ipc.running(), None);
        assert_eq!(dev.backend().mailbox_word(SLOT_ACK), 0);
        dev.transact(MessageId::StartCopy, [0; 3], true).unwrap();
    }

    #[test]
    fn test_transact_nack() {
        let dev = booted_device();
        dev.backend()
            .update(|b| b.ack = AckPolicy::Reject(MessageId::StopCopy));
        assert_matches!(
            dev.transact(MessageId::StopCopy, [0; 3], true),
            Err(Error::Failed(MessageId::StopCopy, _))
        );
        assert_eq!(dev.ipc.state(), IpcState::Idle);
    }

    #[test]
    fn test_async_transact_does_not_wait() {
        let dev = booted_device();
        dev.backend().update(|b| b.ack = AckPolicy::Nothing);
        let before = dev.backend().doorbell_count(MessageId::Command);
        let start = Instant::now();
        dev.send_command(Command::ForceTrigger, [1, 0], false)
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(dev.backend().doorbell_count(MessageId::Command), before + 1);
    }

    #[test]
    fn test_debug_log_registration() {
        let dev = booted_device();
        dev.backend().update(|b| b.log_region = (0x3c000, 0x1000));
        dev.send_command(Command::EnableDebugLog, [0, 0], true)
            .unwrap();
        let regions = dev.regions.lock().unwrap();
        assert_eq!(
            regions.log,
            Some(SramRegion {
                offset: 0x3c000,
                size: 0x1000
            })
        );
    }

    #[test]
    fn test_mailbox_failure() {
        let dev = booted_device();
        dev.backend().update(|b| {
            b.doorbell_error = Some(backend::Error::DoorbellFailed(MessageId::StartRec))
        });
        assert_matches!(
            dev.transact(MessageId::StartRec, [0; 3], true),
            Err(Error::Mailbox(backend::Error::DoorbellFailed(_)))
        );
        assert_eq!(dev.ipc.running(), None);
    }

    #[test]
    fn test_one_transaction_in_flight() {
        let dev = booted_device();
        dev.backend().clear_trace();

        let ids = [
            MessageId::StartCopy,
            MessageId::StopCopy,
            MessageId::TargetSize,
            MessageId::SetMode,
        ];
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let dev = Arc::clone(&dev);
                thread::spawn(move || {
                    for i in 0..10 {
                        dev.transact(id, [i, 0, 0], true).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let trace = dev.backend().trace();
        let mut in_flight = false;
        let mut payloads = 0;
        for op in trace {
            match op {
                MailboxOp::Payload => {
                    assert!(!in_flight, "payload written during a transaction");
                    in_flight = true;
                    payloads += 1;
                }
                MailboxOp::AckClear => in_flight = false,
                MailboxOp::Doorbell(_) => assert!(in_flight),
            }
        }
        assert_eq!(payloads, 40);
    }
}
