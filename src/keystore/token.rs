//! Hardware auth tokens and the enrollment state they are checked against.
//!
//! On a real device the biometric sensor and the keystore live in the same
//! trusted environment and share a MAC key. The sensor signs a statement
//! ("the user was present for operation X at time T") and the keystore only
//! runs an auth-bound key when that statement checks out. [`TokenAuthority`]
//! is the in-process model of that shared secret, plus the enrolled template
//! set. Every change that revokes enrollment-bound keys advances an
//! [`EnrollmentEpoch`]; keys remember the epoch they were created in.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroize;

use super::params::AuthenticatorClass;
use crate::error::{AuthFailure, Error, Result};

type HmacSha256 = Hmac<Sha256>;

const MAC_KEY_LEN: usize = 32;

/// Identifies one pending keystore operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationChallenge(pub(crate) u64);

impl OperationChallenge {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Counts enrollment changes that revoke keys. Never goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnrollmentEpoch(u64);

impl EnrollmentEpoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Signed proof that the user authenticated for `challenge`.
#[derive(Clone, PartialEq, Eq)]
pub struct HardwareAuthToken {
    pub challenge: OperationChallenge,
    pub authenticator: AuthenticatorClass,
    pub timestamp_ms: u64,
    mac: [u8; 32],
}

impl fmt::Debug for HardwareAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareAuthToken")
            .field("challenge", &self.challenge)
            .field("authenticator", &self.authenticator)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish_non_exhaustive()
    }
}

struct AuthorityState {
    mac_key: SecretSlice<u8>,
    enrolled: BTreeSet<String>,
    enrollment_epoch: EnrollmentEpoch,
    epoch: Instant,
}

/// Shared secret and enrollment registry between sensor and keystore.
#[derive(Clone)]
pub struct TokenAuthority {
    state: Arc<Mutex<AuthorityState>>,
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenAuthority {
    pub fn new() -> Self {
        let mut key = [0u8; MAC_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        let mac_key = SecretSlice::new(key.to_vec().into());
        key.zeroize();

        Self {
            state: Arc::new(Mutex::new(AuthorityState {
                mac_key,
                enrolled: BTreeSet::new(),
                enrollment_epoch: EnrollmentEpoch(0),
                epoch: Instant::now(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, AuthorityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a biometric template. Returns false if it was already enrolled.
    ///
    /// A new template advances the enrollment epoch.
    pub fn enroll(&self, template: impl Into<String>) -> bool {
        let template = template.into();
        let mut state = self.state();
        let added = state.enrolled.insert(template.clone());
        if added {
            state.enrollment_epoch.0 += 1;
            info!(template = %template, epoch = state.enrollment_epoch.0, "Biometric enrolled");
        }
        added
    }

    /// Removes a biometric template. Returns false if it was not enrolled.
    ///
    /// Removing the last template advances the enrollment epoch; removing one
    /// of several does not.
    pub fn unenroll(&self, template: &str) -> bool {
        let mut state = self.state();
        let removed = state.enrolled.remove(template);
        if removed {
            if state.enrolled.is_empty() {
                state.enrollment_epoch.0 += 1;
            }
            info!(template = %template, epoch = state.enrollment_epoch.0, "Biometric removed");
        }
        removed
    }

    pub fn has_enrollments(&self) -> bool {
        !self.state().enrolled.is_empty()
    }

    pub fn enrollment_epoch(&self) -> EnrollmentEpoch {
        self.state().enrollment_epoch
    }

    /// Signs a token stating the user passed `authenticator` for `challenge`.
    pub fn mint(
        &self,
        challenge: OperationChallenge,
        authenticator: AuthenticatorClass,
    ) -> Result<HardwareAuthToken> {
        let state = self.state();
        let timestamp_ms = u64::try_from(state.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mac = token_mac(
            state.mac_key.expose_secret(),
            challenge,
            authenticator,
            timestamp_ms,
        )?;
        debug!(%challenge, ?authenticator, "Minted auth token");
        Ok(HardwareAuthToken {
            challenge,
            authenticator,
            timestamp_ms,
            mac,
        })
    }

    pub(crate) fn verify(&self, token: &HardwareAuthToken) -> bool {
        let state = self.state();
        let Ok(mut mac) = HmacSha256::new_from_slice(state.mac_key.expose_secret()) else {
            return false;
        };
        feed(
            &mut mac,
            token.challenge,
            token.authenticator,
            token.timestamp_ms,
        );
        mac.verify_slice(&token.mac).is_ok()
    }

    pub(crate) fn age(&self, token: &HardwareAuthToken) -> Duration {
        let now = self.state().epoch.elapsed();
        now.saturating_sub(Duration::from_millis(token.timestamp_ms))
    }
}

fn feed(
    mac: &mut HmacSha256,
    challenge: OperationChallenge,
    authenticator: AuthenticatorClass,
    timestamp_ms: u64,
) {
    mac.update(&challenge.0.to_be_bytes());
    mac.update(&[authenticator.as_byte()]);
    mac.update(&timestamp_ms.to_be_bytes());
}

fn token_mac(
    key: &[u8],
    challenge: OperationChallenge,
    authenticator: AuthenticatorClass,
    timestamp_ms: u64,
) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::AuthChallenge(AuthFailure::HardwareUnavailable))?;
    feed(&mut mac, challenge, authenticator, timestamp_ms);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_verify() {
        let authority = TokenAuthority::new();
        let token = authority
            .mint(OperationChallenge(42), AuthenticatorClass::BiometricStrong)
            .unwrap();
        assert!(authority.verify(&token));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let authority = TokenAuthority::new();
        let mut token = authority
            .mint(OperationChallenge(42), AuthenticatorClass::BiometricStrong)
            .unwrap();
        token.challenge = OperationChallenge(43);
        assert!(!authority.verify(&token));
    }

    #[test]
    fn tokens_do_not_cross_authorities() {
        let a = TokenAuthority::new();
        let b = TokenAuthority::new();
        let token = a
            .mint(OperationChallenge(7), AuthenticatorClass::BiometricStrong)
            .unwrap();
        assert!(!b.verify(&token));
    }

    #[test]
    fn epoch_only_moves_forward() {
        let authority = TokenAuthority::new();
        authority.enroll("left-thumb");
        let before = authority.enrollment_epoch();

        assert!(!authority.enroll("left-thumb"));
        assert_eq!(before, authority.enrollment_epoch());

        authority.enroll("right-index");
        let added = authority.enrollment_epoch();
        assert!(added > before);

        authority.unenroll("right-index");
        assert_eq!(added, authority.enrollment_epoch());

        authority.unenroll("left-thumb");
        assert!(authority.enrollment_epoch() > added);
        assert!(!authority.has_enrollments());
    }
}
