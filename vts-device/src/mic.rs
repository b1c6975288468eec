// VTS microphone resource bookkeeping
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::{debug, info};

use crate::{
    backend::{HardwareBackend, MicPath, MicType},
    device::{Error, Result, VtsDevice},
    protocol::{MAX_PHRASE_ID, MICCONF_FOR_RECORD},
};

/// Logical user of the microphone path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MicConsumer {
    Phrase(u8),
    Record,
}

impl MicConsumer {
    pub fn bit(self) -> u32 {
        match self {
            Self::Phrase(id) => 1 << id,
            Self::Record => 1 << MICCONF_FOR_RECORD,
        }
    }
}

/// What the hardware has to do after a bookkeeping update.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MicAction {
    Assert,
    Revert,
    Keep,
}

/// Reference count of mic consumers. `count` always equals the popcount
/// of `ready`, and the hardware path is asserted iff `count > 0`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MicResources {
    ready: u32,
    count: u32,
}

impl MicResources {
    pub fn enable(&mut self, consumer: MicConsumer) -> MicAction {
        let action = if self.count == 0 {
            MicAction::Assert
        } else {
            MicAction::Keep
        };

        if self.ready & consumer.bit() == 0 {
            self.ready |= consumer.bit();
            self.count += 1;
        }
        action
    }

    pub fn disable(&mut self, consumer: MicConsumer) -> MicAction {
        if self.ready & consumer.bit() == 0 {
            return MicAction::Keep;
        }

        self.ready &= !consumer.bit();
        self.count -= 1;
        if self.count == 0 {
            MicAction::Revert
        } else {
            MicAction::Keep
        }
    }

    /// Drop every consumer at once.
    pub fn reset(&mut self) -> MicAction {
        let asserted = self.is_asserted();
        *self = Self::default();
        if asserted {
            MicAction::Revert
        } else {
            MicAction::Keep
        }
    }

    pub fn ready(&self) -> u32 {
        self.ready
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_asserted(&self) -> bool {
        self.count > 0
    }

    pub fn has_phrase(&self) -> bool {
        self.ready & !MicConsumer::Record.bit() != 0
    }

    pub fn has(&self, consumer: MicConsumer) -> bool {
        self.ready & consumer.bit() != 0
    }
}

pub(crate) fn validate_phrase(id: u8) -> Result<()> {
    if id > MAX_PHRASE_ID {
        return Err(Error::InvalidPhrase(id));
    }
    Ok(())
}

impl<B: HardwareBackend> VtsDevice<B> {
    pub(crate) fn mic_path(&self) -> MicPath {
        let settings = self.settings.lock().unwrap();
        MicPath {
            mic: settings.mic,
            gain: match settings.mic {
                MicType::Amic => settings.amic_gain,
                MicType::Dmic => settings.dmic_gain,
            },
            sys_sel: settings.sys_sel,
            channels: settings.mic_num,
        }
    }

    /// Enable or disable the mic path on behalf of `consumer`.
    pub fn set_mic(&self, consumer: MicConsumer, enable: bool) -> Result<()> {
        if enable && !self.is_fw_ready() {
            return Err(Error::NotReady);
        }

        // Computed before taking the mic lock; mic_path takes the settings lock.
        let path = self.mic_path();
        let mut mic = self.mic.lock().unwrap();
        let action = if enable {
            mic.enable(consumer)
        } else {
            mic.disable(consumer)
        };

        match action {
            MicAction::Assert => {
                info!("mic path asserted for {consumer:?}: {path:?}");
                self.backend.configure_mic(Some(&path));
            }
            MicAction::Revert => {
                info!("mic path released by {consumer:?}");
                self.backend.configure_mic(None);
            }
            MicAction::Keep => {}
        }
        debug!("mic ready {:#x} count {}", mic.ready(), mic.count());
        Ok(())
    }

    pub(crate) fn release_mics(&self) {
        let mut mic = self.mic.lock().unwrap();
        if mic.reset() == MicAction::Revert {
            self.backend.configure_mic(None);
        }
    }

    pub fn mic_ready(&self) -> u32 {
        self.mic.lock().unwrap().ready()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn check_invariant(mic: &MicResources) {
        assert_eq!(mic.count(), mic.ready().count_ones());
        assert_eq!(mic.is_asserted(), mic.ready().count_ones() > 0);
    }

    #[test]
    fn test_first_enable_last_disable() {
        let mut mic = MicResources::default();
        assert_eq!(mic.enable(MicConsumer::Phrase(1)), MicAction::Assert);
        assert_eq!(mic.enable(MicConsumer::Record), MicAction::Keep);
        assert_eq!(mic.enable(MicConsumer::Phrase(1)), MicAction::Keep);
        assert_eq!(mic.count(), 2);
        assert!(mic.has_phrase());

        assert_eq!(mic.disable(MicConsumer::Phrase(1)), MicAction::Keep);
        assert!(!mic.has_phrase());
        assert!(mic.has(MicConsumer::Record));
        assert_eq!(mic.disable(MicConsumer::Record), MicAction::Revert);
        assert_eq!(mic.disable(MicConsumer::Record), MicAction::Keep);
        check_invariant(&mic);
    }

    #[test]
    fn test_invariant_over_sequence() {
        let consumers = [
            MicConsumer::Phrase(0),
            MicConsumer::Phrase(1),
            MicConsumer::Phrase(3),
            MicConsumer::Record,
        ];
        let mut mic = MicResources::default();
        let mut asserted = false;

        // Deterministic pseudo random walk over enable/disable calls.
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let consumer = consumers[(seed % 4) as usize];
            let action = if seed & 0x100 != 0 {
                mic.enable(consumer)
            } else {
                mic.disable(consumer)
            };
            match action {
                MicAction::Assert => {
                    assert!(!asserted);
                    asserted = true;
                }
                MicAction::Revert => {
                    assert!(asserted);
                    asserted = false;
                }
                MicAction::Keep => {}
            }
            check_invariant(&mic);
            assert_eq!(asserted, mic.is_asserted());
        }
    }

    #[test]
    fn test_reset() {
        let mut mic = MicResources::default();
        assert_eq!(mic.reset(), MicAction::Keep);
        mic.enable(MicConsumer::Phrase(2));
        assert_eq!(mic.reset(), MicAction::Revert);
        assert_eq!(mic.ready(), 0);
        check_invariant(&mic);
    }

    #[test]
    fn test_validate_phrase() {
        assert!(validate_phrase(MAX_PHRASE_ID).is_ok());
        assert_matches!(validate_phrase(9), Err(Error::InvalidPhrase(9)));
    }
}
