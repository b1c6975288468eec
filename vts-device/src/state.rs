// VTS runtime state machine
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use thiserror::Error as ThisError;

use crate::protocol::MessageId;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid state transition from {0} to {1}")]
    InvalidStateTransition(VtsState, VtsState),
}

type Result<T> = std::result::Result<T, Error>;

/// Coprocessor runtime state.
///
/// ```text
///  None -> RuntimeResuming -> RuntimeResumed -> RecogStarted <-> RecogTriggered
///                                                    |               |
///                                                    v               v
///                                               RecogStopped <-------+
///                                                    |
///  RuntimeSuspended <- RuntimeSuspending <-----------+ (from any powered state)
///         |  ^
///         v  |
///       VoiceCall
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum VtsState {
    #[default]
    None,
    RuntimeResuming,
    RuntimeResumed,
    RecogStarted,
    RecogTriggered,
    RecogStopped,
    RuntimeSuspending,
    RuntimeSuspended,
    VoiceCall,
}

macro_rules! set_new_state {
    ($new_state_fn:ident, $new_state:expr, $($valid_source_states:tt)*) => {
        pub fn $new_state_fn(&mut self) -> Result<()> {
            if !matches!(self, $($valid_source_states)*) {
                return Err(Error::InvalidStateTransition(*self, $new_state));
            }
            *self = $new_state;
            Ok(())
        }
    };
}

impl VtsState {
    pub fn new() -> Self {
        Self::default()
    }

    set_new_state!(
        resuming,
        Self::RuntimeResuming,
        Self::None | Self::RuntimeSuspended
    );

    set_new_state!(resumed, Self::RuntimeResumed, Self::RuntimeResuming);

    set_new_state!(
        recog_started,
        Self::RecogStarted,
        Self::RuntimeResumed | Self::RecogStarted | Self::RecogTriggered | Self::RecogStopped
    );

    set_new_state!(
        recog_triggered,
        Self::RecogTriggered,
        Self::RecogStarted | Self::RecogTriggered
    );

    set_new_state!(
        recog_stopped,
        Self::RecogStopped,
        Self::RecogStarted | Self::RecogTriggered | Self::RecogStopped
    );

    set_new_state!(
        suspending,
        Self::RuntimeSuspending,
        Self::RuntimeResuming
            | Self::RuntimeResumed
            | Self::RecogStarted
            | Self::RecogTriggered
            | Self::RecogStopped
    );

    set_new_state!(
        suspended,
        Self::RuntimeSuspended,
        Self::RuntimeSuspending | Self::RuntimeResuming | Self::VoiceCall
    );

    set_new_state!(
        voice_call,
        Self::VoiceCall,
        Self::None | Self::RuntimeSuspended
    );

    /// Whether the firmware is powered according to this state.
    pub fn is_powered(&self) -> bool {
        !matches!(
            self,
            Self::None | Self::RuntimeSuspending | Self::RuntimeSuspended | Self::VoiceCall
        )
    }

    /// Whether a transaction carrying `id` may be sent in this state.
    pub fn permits(&self, id: MessageId) -> bool {
        match self {
            Self::RuntimeSuspending => id == MessageId::PowerDown,
            Self::RuntimeSuspended | Self::VoiceCall | Self::None => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for VtsState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        use VtsState::*;
        let name = match *self {
            None => "NONE",
            RuntimeResuming => "RUNTIME_RESUMING",
            RuntimeResumed => "RUNTIME_RESUMED",
            RecogStarted => "RECOG_STARTED",
            RecogTriggered => "RECOG_TRIGGERED",
            RecogStopped => "RECOG_STOPPED",
            RuntimeSuspending => "RUNTIME_SUSPENDING",
            RuntimeSuspended => "RUNTIME_SUSPENDED",
            VoiceCall => "VOICECALL",
        };
        write!(fmt, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_state_lifecycle() {
        let mut state = VtsState::new();
        assert_eq!(state, VtsState::None);
        state.resuming().unwrap();
        state.resumed().unwrap();
        state.recog_started().unwrap();
        state.recog_triggered().unwrap();
        state.recog_started().unwrap();
        state.recog_triggered().unwrap();
        state.recog_stopped().unwrap();
        state.suspending().unwrap();
        state.suspended().unwrap();
        state.voice_call().unwrap();
        state.suspended().unwrap();
        state.resuming().unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = VtsState::new();
        assert_eq!(
            state.recog_started(),
            Err(Error::InvalidStateTransition(
                VtsState::None,
                VtsState::RecogStarted
            ))
        );
        assert!(state.suspending().is_err());

        state.resuming().unwrap();
        state.resumed().unwrap();
        assert!(state.voice_call().is_err());
        assert!(state.recog_triggered().is_err());
        // A failed transition leaves the state untouched.
        assert_eq!(state, VtsState::RuntimeResumed);
        assert_eq!(state.to_string(), "RUNTIME_RESUMED");
    }

    #[rstest]
    #[case::suspending(VtsState::RuntimeSuspending)]
    #[case::suspended(VtsState::RuntimeSuspended)]
    #[case::voice_call(VtsState::VoiceCall)]
    #[case::none(VtsState::None)]
    fn test_ipc_rejected_when_down(#[case] state: VtsState) {
        for raw in 0..16 {
            let id = MessageId::try_from(raw).unwrap();
            let expected = state == VtsState::RuntimeSuspending && id == MessageId::PowerDown;
            assert_eq!(state.permits(id), expected, "{state} {id}");
        }
        assert!(!state.is_powered());
    }

    #[rstest]
    #[case(VtsState::RuntimeResuming)]
    #[case(VtsState::RuntimeResumed)]
    #[case(VtsState::RecogStarted)]
    #[case(VtsState::RecogTriggered)]
    #[case(VtsState::RecogStopped)]
    fn test_ipc_allowed_when_up(#[case] state: VtsState) {
        assert!(state.permits(MessageId::StartRecognition));
        assert!(state.permits(MessageId::PowerDown));
        assert!(state.is_powered());
    }
}
