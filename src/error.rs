use std::fmt;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between asking for the secret and getting it.
///
/// None of these are fatal. [`Error::KeyInvalidated`] is the one case where
/// retrying is pointless until the key has been provisioned again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to provision key: {0}")]
    KeyProvisioning(String),

    #[error("Key `{alias}` not found")]
    KeyNotFound { alias: String },

    #[error("Key `{alias}` was invalidated by a biometric enrollment change")]
    KeyInvalidated { alias: String },

    #[error("Unsupported transformation: {0}")]
    UnsupportedTransformation(String),

    #[error("Decryption requires the IV captured at encryption")]
    MissingIv,

    #[error("Cipher finalization failed: {0}")]
    CryptoFinalization(String),

    #[error("Cipher session was already finalized")]
    SessionConsumed,

    #[error("An authentication challenge is already in progress")]
    ChallengeAlreadyInProgress,

    #[error("Authentication error: {0}")]
    AuthChallenge(AuthFailure),
}

/// Non-cancellation reasons a presence challenge can end without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Temporarily locked out after too many attempts on the sensor.
    Lockout,
    /// Locked out until the user unlocks with a strong credential.
    LockoutPermanent,
    /// The gate's own mismatch budget ran out.
    TooManyAttempts,
    NoBiometricsEnrolled,
    HardwareUnavailable,
    /// The outcome channel closed without a terminal event.
    SensorUnavailable,
    /// The sensor vouched for a different operation.
    UnboundToken,
    InvalidPrompt(String),
    Vendor { code: i32, message: String },
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Lockout => f.write_str("too many attempts, try again later"),
            AuthFailure::LockoutPermanent => {
                f.write_str("too many attempts, biometric sensor disabled")
            }
            AuthFailure::TooManyAttempts => f.write_str("too many failed attempts"),
            AuthFailure::NoBiometricsEnrolled => f.write_str("no biometrics enrolled"),
            AuthFailure::HardwareUnavailable => f.write_str("biometric hardware unavailable"),
            AuthFailure::SensorUnavailable => {
                f.write_str("sensor stopped without reporting a result")
            }
            AuthFailure::UnboundToken => {
                f.write_str("authentication was not bound to this operation")
            }
            AuthFailure::InvalidPrompt(reason) => write!(f, "invalid prompt: {reason}"),
            AuthFailure::Vendor { code, message } => write!(f, "[{code}] {message}"),
        }
    }
}

/// Why a challenge was cancelled. Cancellations are never reported as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    NegativeButton,
    System,
}

#[cfg(feature = "tpm")]
impl From<tss_esapi::Error> for Error {
    fn from(e: tss_esapi::Error) -> Self {
        Error::KeyProvisioning(format!("TPM: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_message_reaches_the_user() {
        let err = Error::AuthChallenge(AuthFailure::Lockout);
        assert_eq!(
            err.to_string(),
            "Authentication error: too many attempts, try again later"
        );
    }

    #[test]
    fn invalidation_names_the_alias() {
        let err = Error::KeyInvalidated {
            alias: "biometric_secure_key".into(),
        };
        assert!(err.to_string().contains("biometric_secure_key"));
    }
}
