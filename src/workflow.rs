//! Encrypt-on-first-use, decrypt-on-every-later-use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::auth::{AuthGate, AuthOutcome, PresenceSensor};
use crate::cipher::CipherSession;
use crate::config::WorkflowConfig;
use crate::error::{Error, Result};
use crate::keystore::{CipherMode, Iv, Keystore};
use crate::vault::KeyVault;

/// Outbound side of the workflow, usually a UI.
///
/// Cancellations and single unrecognized touches never reach it.
pub trait SecretObserver: Send + Sync {
    fn on_secret_revealed(&self, plaintext: &[u8]);

    fn on_failure(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    AwaitingFirstUse,
    HasCiphertext,
}

/// Ciphertext together with the IV it was produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextRecord {
    ciphertext: Vec<u8>,
    iv: Iv,
}

impl CiphertextRecord {
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn iv(&self) -> &Iv {
        &self.iv
    }
}

/// What a successful `request_operation` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Encrypted,
    Decrypted,
    Canceled,
}

struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ChallengeAlreadyInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Guards one secret behind the vault key.
///
/// The first successful challenge encrypts the secret and keeps the
/// ciphertext; every later one decrypts it again. Only one request runs at
/// a time.
pub struct SecretWorkflow {
    vault: KeyVault,
    gate: AuthGate,
    observer: Arc<dyn SecretObserver>,
    secret: SecretSlice<u8>,
    record: Mutex<Option<CiphertextRecord>>,
    busy: AtomicBool,
}

impl SecretWorkflow {
    pub fn new(
        config: &WorkflowConfig,
        keystore: Keystore,
        sensor: Arc<dyn PresenceSensor>,
        observer: Arc<dyn SecretObserver>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            vault: KeyVault::new(keystore, config.key_alias.clone(), config.key.clone()),
            gate: AuthGate::new(sensor, config.prompt.clone(), config.max_failed_attempts),
            observer,
            secret: SecretSlice::from(Into::<Vec<u8>>::into(secret)),
            record: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    /// The vault behind this workflow. Re-provision through
    /// [`reprovision`](Self::reprovision), which also drops the ciphertext
    /// a replaced key can no longer decrypt.
    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    fn records(&self) -> MutexGuard<'_, Option<CiphertextRecord>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WorkflowState {
        if self.records().is_some() {
            WorkflowState::HasCiphertext
        } else {
            WorkflowState::AwaitingFirstUse
        }
    }

    pub fn record(&self) -> Option<CiphertextRecord> {
        self.records().clone()
    }

    /// Runs one user-initiated request. Failures are also reported to the
    /// observer; cancellation is not.
    #[instrument(level = "debug", skip(self), fields(alias = self.vault.alias()))]
    pub async fn request_operation(&self) -> Result<Completion> {
        let result = self.run().await;
        if let Err(e) = &result {
            error!("Secret request failed: {e}");
            self.observer.on_failure(&e.to_string());
        }
        result
    }

    async fn run(&self) -> Result<Completion> {
        let _busy = Busy::acquire(&self.busy)?;
        let stored = self.record();

        let session = match &stored {
            None => {
                let key = self.vault.ensure_key()?;
                CipherSession::prepare(&self.vault, &key, CipherMode::Encrypt, None)?
            }
            Some(record) => {
                let key = self.vault.get_key()?;
                let iv = Some(record.iv.clone());
                CipherSession::prepare(&self.vault, &key, CipherMode::Decrypt, iv)?
            }
        };

        let mut session = match self.gate.challenge(session).await? {
            AuthOutcome::Succeeded(session) => session,
            AuthOutcome::Canceled(reason) => {
                debug!(?reason, "Request cancelled");
                return Ok(Completion::Canceled);
            }
            AuthOutcome::Error(reason) => return Err(Error::AuthChallenge(reason)),
        };

        match stored {
            None => {
                let iv = session.current_iv().cloned().ok_or(Error::MissingIv)?;
                let ciphertext = session.finish(self.secret.expose_secret())?;
                info!(len = ciphertext.len(), "Secret encrypted");
                *self.records() = Some(CiphertextRecord { ciphertext, iv });
                self.observer.on_secret_revealed(self.secret.expose_secret());
                Ok(Completion::Encrypted)
            }
            Some(record) => {
                let plaintext = Zeroizing::new(session.finish(&record.ciphertext)?);
                info!("Secret decrypted");
                self.observer.on_secret_revealed(&plaintext);
                Ok(Completion::Decrypted)
            }
        }
    }

    /// Makes sure a usable key exists again after invalidation.
    ///
    /// A record encrypted under a replaced key can never be decrypted; it is
    /// removed and returned, and the next request encrypts afresh.
    #[instrument(level = "debug", skip(self), fields(alias = self.vault.alias()))]
    pub fn reprovision(&self) -> Result<Option<CiphertextRecord>> {
        let _busy = Busy::acquire(&self.busy)?;
        let key = self.vault.ensure_key()?;

        let mut record = self.records();
        let stale = record
            .as_ref()
            .is_some_and(|r| r.iv.key_generation() != key.generation());
        if stale {
            warn!(generation = key.generation(), "Discarding ciphertext of the replaced key");
            return Ok(record.take());
        }
        Ok(None)
    }
}
