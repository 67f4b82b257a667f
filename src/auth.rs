//! Presence challenges and their binding to cipher sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::cipher::CipherSession;
use crate::error::{AuthFailure, CancelReason, Error, Result};
use crate::keystore::{AuthenticatorClass, HardwareAuthToken, OperationChallenge};

/// What the user sees while the sensor is listening.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub title: String,
    pub subtitle: Option<String>,
    pub negative_button_text: String,
    pub allowed_authenticators: AuthenticatorClass,
    /// Extra "confirm" tap after a passive biometric match.
    pub confirmation_required: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            title: "Biometric Authentication".into(),
            subtitle: Some("Log in using your biometric credential".into()),
            negative_button_text: "Cancel".into(),
            allowed_authenticators: AuthenticatorClass::BiometricStrong,
            confirmation_required: false,
        }
    }
}

impl PromptConfig {
    pub fn validate(&self) -> std::result::Result<(), AuthFailure> {
        if self.title.trim().is_empty() {
            return Err(AuthFailure::InvalidPrompt("title must not be empty".into()));
        }
        if self.negative_button_text.trim().is_empty() {
            return Err(AuthFailure::InvalidPrompt(
                "negative button text must not be empty".into(),
            ));
        }
        if self.allowed_authenticators != AuthenticatorClass::BiometricStrong {
            return Err(AuthFailure::InvalidPrompt(format!(
                "{:?} cannot unlock a presence-gated key",
                self.allowed_authenticators
            )));
        }
        Ok(())
    }
}

/// Handed to the sensor when a challenge starts.
#[derive(Debug, Clone)]
pub struct ChallengeRequest {
    pub challenge: OperationChallenge,
    pub prompt: PromptConfig,
}

/// Everything a sensor can report about a running challenge.
#[derive(Debug)]
pub enum AuthEvent {
    Succeeded(HardwareAuthToken),
    /// One attempt did not match. The sensor keeps listening.
    Failed,
    Canceled(CancelReason),
    Error(AuthFailure),
}

pub type AuthEventSender = mpsc::UnboundedSender<AuthEvent>;

/// Platform presence sensor.
///
/// `start` must not block. The sensor sends zero or more
/// [`AuthEvent::Failed`] followed by exactly one terminal event on `events`.
pub trait PresenceSensor: Send + Sync {
    fn start(&self, request: ChallengeRequest, events: AuthEventSender);

    fn cancel(&self, challenge: OperationChallenge);
}

/// How a challenge ended.
#[derive(Debug)]
pub enum AuthOutcome {
    /// The session now carries a token for its own challenge.
    Succeeded(CipherSession),
    Canceled(CancelReason),
    Error(AuthFailure),
}

/// Runs one presence challenge at a time, each tied to one cipher session.
pub struct AuthGate {
    sensor: Arc<dyn PresenceSensor>,
    prompt: PromptConfig,
    max_failed_attempts: u32,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag on the way out and cancels the sensor if the
/// challenge did not reach a terminal event (future dropped, attempt cap).
struct InFlight<'a> {
    gate: &'a AuthGate,
    challenge: OperationChallenge,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(challenge = %self.challenge, "Cancelling unsettled challenge");
            self.gate.sensor.cancel(self.challenge);
        }
        self.gate.in_flight.store(false, Ordering::Release);
    }
}

impl AuthGate {
    pub fn new(
        sensor: Arc<dyn PresenceSensor>,
        prompt: PromptConfig,
        max_failed_attempts: u32,
    ) -> Self {
        Self {
            sensor,
            prompt,
            max_failed_attempts: max_failed_attempts.max(1),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn prompt(&self) -> &PromptConfig {
        &self.prompt
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Challenges the user for `session` and waits for the terminal event.
    #[instrument(level = "debug", skip(self, session), fields(challenge = %session.challenge()))]
    pub async fn challenge(&self, mut session: CipherSession) -> Result<AuthOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Challenge rejected, another one is in flight");
            return Err(Error::ChallengeAlreadyInProgress);
        }
        let challenge = session.challenge();
        let mut guard = InFlight {
            gate: self,
            challenge,
            settled: true,
        };

        if let Err(reason) = self.prompt.validate() {
            return Ok(AuthOutcome::Error(reason));
        }

        let (events, mut rx) = mpsc::unbounded_channel();
        guard.settled = false;
        self.sensor.start(
            ChallengeRequest {
                challenge,
                prompt: self.prompt.clone(),
            },
            events,
        );

        let mut failures = 0u32;
        loop {
            let Some(event) = rx.recv().await else {
                guard.settled = true;
                warn!("Sensor channel closed without a result");
                return Ok(AuthOutcome::Error(AuthFailure::SensorUnavailable));
            };
            match event {
                AuthEvent::Failed => {
                    failures += 1;
                    debug!(failures, "Biometric not recognized");
                    if failures >= self.max_failed_attempts {
                        warn!(failures, "Giving up on challenge");
                        return Ok(AuthOutcome::Error(AuthFailure::TooManyAttempts));
                    }
                }
                AuthEvent::Succeeded(token) => {
                    guard.settled = true;
                    if token.challenge != challenge {
                        warn!(token = %token.challenge, "Token minted for another operation");
                        return Ok(AuthOutcome::Error(AuthFailure::UnboundToken));
                    }
                    info!("Presence confirmed");
                    session.bind(token);
                    return Ok(AuthOutcome::Succeeded(session));
                }
                AuthEvent::Canceled(reason) => {
                    guard.settled = true;
                    debug!(?reason, "Challenge cancelled");
                    return Ok(AuthOutcome::Canceled(reason));
                }
                AuthEvent::Error(reason) => {
                    guard.settled = true;
                    warn!(%reason, "Challenge failed");
                    return Ok(AuthOutcome::Error(reason));
                }
            }
        }
    }
}
