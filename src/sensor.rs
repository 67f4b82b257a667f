//! In-process presence sensor.
//!
//! Stands in for fingerprint hardware: touches are either scripted ahead of
//! time or delivered while a challenge is listening. Matches are turned into
//! tokens by the same [`TokenAuthority`] the keystore trusts.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::auth::{AuthEvent, AuthEventSender, ChallengeRequest, PresenceSensor};
use crate::error::{AuthFailure, CancelReason};
use crate::keystore::{AuthenticatorClass, OperationChallenge, TokenAuthority};

/// Consecutive mismatches before the sensor locks itself out.
pub const DEFAULT_LOCKOUT_AFTER: u32 = 5;

/// One thing the user can do at the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touch {
    Match,
    Mismatch,
    Cancel(CancelReason),
    /// Hardware-level error, reported as is.
    Fail(AuthFailure),
}

struct Listening {
    challenge: OperationChallenge,
    events: AuthEventSender,
}

#[derive(Default)]
struct SensorState {
    script: VecDeque<Touch>,
    listening: Option<Listening>,
    consecutive_mismatches: u32,
    locked_out: bool,
    started: usize,
}

pub struct SimulatedSensor {
    authority: TokenAuthority,
    authenticator: AuthenticatorClass,
    lockout_after: u32,
    state: Mutex<SensorState>,
}

impl SimulatedSensor {
    pub fn new(authority: TokenAuthority) -> Self {
        Self {
            authority,
            authenticator: AuthenticatorClass::BiometricStrong,
            lockout_after: DEFAULT_LOCKOUT_AFTER,
            state: Mutex::new(SensorState::default()),
        }
    }

    pub fn with_lockout_after(mut self, mismatches: u32) -> Self {
        self.lockout_after = mismatches.max(1);
        self
    }

    /// Class stamped on minted tokens.
    pub fn with_authenticator(mut self, authenticator: AuthenticatorClass) -> Self {
        self.authenticator = authenticator;
        self
    }

    fn state(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues touches for upcoming challenges. They are consumed as soon as
    /// a challenge is listening.
    pub fn script(&self, touches: impl IntoIterator<Item = Touch>) {
        let mut state = self.state();
        state.script.extend(touches);
        self.drain(&mut state);
    }

    /// Delivers a touch to the listening challenge. Returns false if none is.
    pub fn touch(&self, touch: Touch) -> bool {
        let mut state = self.state();
        if state.listening.is_none() {
            return false;
        }
        self.deliver(&mut state, touch);
        true
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening.is_some()
    }

    pub fn is_locked_out(&self) -> bool {
        self.state().locked_out
    }

    /// Clears a lockout, as a successful device-credential unlock would.
    pub fn reset_lockout(&self) {
        let mut state = self.state();
        state.locked_out = false;
        state.consecutive_mismatches = 0;
    }

    /// How many challenges reached the sensor.
    pub fn challenges_started(&self) -> usize {
        self.state().started
    }

    fn drain(&self, state: &mut SensorState) {
        while state.listening.is_some() {
            let Some(touch) = state.script.pop_front() else {
                break;
            };
            self.deliver(state, touch);
        }
    }

    fn deliver(&self, state: &mut SensorState, touch: Touch) {
        let Some(listening) = state.listening.take() else {
            return;
        };
        let challenge = listening.challenge;
        let event = match touch {
            Touch::Match => {
                state.consecutive_mismatches = 0;
                match self.authority.mint(challenge, self.authenticator) {
                    Ok(token) => AuthEvent::Succeeded(token),
                    Err(e) => {
                        warn!(%challenge, "Could not mint token: {e}");
                        AuthEvent::Error(AuthFailure::HardwareUnavailable)
                    }
                }
            }
            Touch::Mismatch => {
                state.consecutive_mismatches += 1;
                if state.consecutive_mismatches >= self.lockout_after {
                    state.locked_out = true;
                    warn!(%challenge, "Sensor locked out");
                    AuthEvent::Error(AuthFailure::Lockout)
                } else {
                    send(&listening, AuthEvent::Failed);
                    state.listening = Some(listening);
                    return;
                }
            }
            Touch::Cancel(reason) => AuthEvent::Canceled(reason),
            Touch::Fail(reason) => AuthEvent::Error(reason),
        };
        send(&listening, event);
    }
}

fn send(listening: &Listening, event: AuthEvent) {
    if listening.events.send(event).is_err() {
        debug!(challenge = %listening.challenge, "Nobody is waiting for this challenge anymore");
    }
}

impl PresenceSensor for SimulatedSensor {
    fn start(&self, request: ChallengeRequest, events: AuthEventSender) {
        let mut state = self.state();
        state.started += 1;
        let listening = Listening {
            challenge: request.challenge,
            events,
        };

        if state.locked_out {
            send(&listening, AuthEvent::Error(AuthFailure::Lockout));
            return;
        }
        if !self.authority.has_enrollments() {
            send(&listening, AuthEvent::Error(AuthFailure::NoBiometricsEnrolled));
            return;
        }
        if let Some(previous) = state.listening.take() {
            send(&previous, AuthEvent::Canceled(CancelReason::System));
        }

        info!(challenge = %request.challenge, title = %request.prompt.title, "Sensor listening");
        state.listening = Some(listening);
        self.drain(&mut state);
    }

    fn cancel(&self, challenge: OperationChallenge) {
        let mut state = self.state();
        let matches = state
            .listening
            .as_ref()
            .is_some_and(|l| l.challenge == challenge);
        if !matches {
            return;
        }
        if let Some(listening) = state.listening.take() {
            debug!(%challenge, "Sensor stopped");
            send(&listening, AuthEvent::Canceled(CancelReason::System));
        }
    }
}
