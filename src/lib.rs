//! Presence-gated secret storage.
//!
//! A secret is encrypted with a hardware-bound AES key the first time the
//! user proves presence, and only decrypted again behind a fresh proof of
//! presence. Each proof is tied to exactly one cipher operation.

pub mod auth;
pub mod cipher;
pub mod config;
pub mod error;
pub mod keystore;
pub mod sensor;
pub mod vault;
pub mod workflow;

pub use auth::{
    AuthEvent, AuthEventSender, AuthGate, AuthOutcome, ChallengeRequest, PresenceSensor,
    PromptConfig,
};
pub use cipher::CipherSession;
pub use config::WorkflowConfig;
pub use error::{AuthFailure, CancelReason, Error, Result};
pub use keystore::{
    AuthValidity, AuthenticatorClass, CipherMode, Iv, KeyHandle, KeyParameters, Keystore,
    TokenAuthority, Transformation,
};
pub use sensor::{SimulatedSensor, Touch};
pub use vault::KeyVault;
pub use workflow::{CiphertextRecord, Completion, SecretObserver, SecretWorkflow, WorkflowState};
