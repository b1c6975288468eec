// VTS background work
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::OpenOptions,
    io::{self, Write},
    sync::{
        mpsc::{self, Receiver, Sender},
        Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{backend::HardwareBackend, device::VtsDevice, dump::DumpReason};

const FW_LOG_FILE: &str = "vts-fwlog.txt";
const AUDIO_DUMP_FILE: &str = "vts-audio.dump";
const LOG_DUMP_FILE: &str = "vts-log.dump";

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DumpKind {
    Audio,
    Log,
}

#[derive(Debug)]
pub(crate) enum Work {
    /// Save one half of the firmware log ring.
    FlushLog { half: usize },
    /// Save a firmware dump region, then ack the firmware.
    FlushDump(DumpKind),
    /// Attach a full SRAM copy to an already stored dump.
    SramDump(DumpReason),
    Sync(Sender<()>),
    Exit,
}

pub(crate) fn spawn_worker<B: HardwareBackend>(
    dev: Weak<VtsDevice<B>>,
    rx: Receiver<Work>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vts-worker".to_string())
        .spawn(move || {
            loop {
                match rx.recv() {
                    Ok(Work::Sync(done)) => {
                        let _ = done.send(());
                    }
                    Ok(Work::Exit) | Err(_) => break,
                    Ok(work) => {
                        let Some(dev) = dev.upgrade() else {
                            break;
                        };
                        dev.run_work(work);
                    }
                }
            }
            debug!("worker exiting");
        })
}

impl<B: HardwareBackend> VtsDevice<B> {
    pub(crate) fn queue_work(&self, work: Work) {
        if let Err(e) = self.work_tx.send(work) {
            warn!("worker gone, dropping {:?}", e.0);
        }
    }

    /// Block until all previously queued work has run.
    pub fn sync_worker(&self) {
        let (tx, rx) = mpsc::channel();
        self.queue_work(Work::Sync(tx));
        if rx.recv_timeout(SYNC_TIMEOUT).is_err() {
            warn!("worker sync timed out");
        }
    }

    fn run_work(&self, work: Work) {
        match work {
            Work::FlushLog { half } => self.flush_log(half),
            Work::FlushDump(kind) => {
                self.flush_dump(kind);
                self.ipc_ack(1);
            }
            Work::SramDump(reason) => {
                if let Some(sram) = self.read_sram() {
                    if self.dumps.attach_sram(reason, sram) {
                        info!("{reason}: SRAM copy attached");
                    }
                }
            }
            Work::Sync(_) | Work::Exit => {}
        }
    }

    /// Save one half of the registered firmware log ring.
    pub(crate) fn flush_log(&self, half: usize) {
        let Some(region) = self.regions.lock().unwrap().log else {
            debug!("no firmware log ring registered");
            return;
        };

        let len = region.size / 2;
        let mut data = vec![0u8; len];
        if let Err(e) = self.backend.sram_read(region.offset + half * len, &mut data) {
            warn!("log ring half {half}: {e}");
            return;
        }

        let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        data.truncate(end);
        if data.is_empty() {
            return;
        }

        match &self.config.log_dir {
            Some(_) => self.save(FW_LOG_FILE, &data),
            None => {
                for line in String::from_utf8_lossy(&data).lines() {
                    info!("fw: {line}");
                }
            }
        }
    }

    fn flush_dump(&self, kind: DumpKind) {
        let region = {
            let regions = self.regions.lock().unwrap();
            match kind {
                DumpKind::Audio => regions.audio_dump,
                DumpKind::Log => regions.log_dump,
            }
        };
        let Some(region) = region else {
            return;
        };

        let mut data = vec![0u8; region.size];
        if let Err(e) = self.backend.sram_read(region.offset, &mut data) {
            warn!("{kind:?} dump: {e}");
            return;
        }

        let name = match kind {
            DumpKind::Audio => AUDIO_DUMP_FILE,
            DumpKind::Log => LOG_DUMP_FILE,
        };
        if self.config.log_dir.is_some() {
            self.save(name, &data);
        } else {
            debug!("{kind:?} dump of {} bytes discarded, no log directory", data.len());
        }
    }

    fn save(&self, name: &str, data: &[u8]) {
        let Some(dir) = &self.config.log_dir else {
            return;
        };
        let path = dir.join(name);
        let ret = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(data));
        if let Err(e) = ret {
            warn!("could not write {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        device::tests::{test_device_with, wait_until},
        dump::DumpReason,
        protocol::VTS_DUMP_MAGIC,
    };

    #[test]
    fn test_log_buffer_flush_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let dev = test_device_with(move |cfg| {
            cfg.log_dir = Some(path);
            cfg.settings.fw_log = true;
        });
        let (offset, size) = dev.backend().behavior().log_region;
        dev.backend()
            .write_sram(offset as usize + size as usize / 2, b"second half\n\0\0");
        dev.resume().unwrap();

        dev.backend().raise_log_buffer_full(1);
        dev.sync_irq();
        dev.sync_worker();

        let text = fs::read_to_string(dir.path().join(FW_LOG_FILE)).unwrap();
        assert_eq!(text, "second half\n");
    }

    #[test]
    fn test_audio_dump_flush_acks_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let dev = test_device_with(move |cfg| {
            cfg.log_dir = Some(path);
            cfg.settings.audio_dump = true;
        });
        dev.resume().unwrap();
        dev.backend().write_sram(0x1000, &[0xab; 32]);

        let acks = dev.backend().doorbell_count(crate::protocol::MessageId::IpcReceived);
        dev.backend().raise_dump_ready(DumpKind::Audio, 0x1000, 32);
        dev.sync_irq();
        dev.sync_worker();

        let data = fs::read(dir.path().join(AUDIO_DUMP_FILE)).unwrap();
        assert_eq!(data, vec![0xab; 32]);
        assert!(wait_until(Duration::from_secs(1), || dev
            .backend()
            .doorbell_count(crate::protocol::MessageId::IpcReceived)
            == acks + 1));
    }

    #[test]
    fn test_panic_dump_defers_sram_copy() {
        let dev = test_device_with(|cfg| cfg.full_sram_dump = true);
        dev.resume().unwrap();

        dev.on_host_panic();
        dev.sync_worker();
        let record = dev.dump_record(DumpReason::KernelPanic).unwrap();
        assert!(record.sram_log.starts_with(VTS_DUMP_MAGIC));
        assert_eq!(
            record.sram.as_ref().map(Vec::len),
            Some(dev.backend().profile().sram_size)
        );

        // Only the first panic is recorded.
        let first = record.time_ns;
        dev.on_host_panic();
        dev.sync_worker();
        assert_eq!(
            dev.dump_record(DumpReason::KernelPanic).unwrap().time_ns,
            first
        );
    }
}
