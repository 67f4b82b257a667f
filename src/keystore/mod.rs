//! Hardware-keystore model.
//!
//! A [`Keystore`] owns key entries (parameters plus the enrollment epoch
//! they were bound to) and pending cipher operations. Key material itself
//! lives in a [`KeyEngine`]. Every auth-bound operation goes through
//! `begin` → auth token → `finish`, and `finish` refuses to touch the engine
//! unless the token was minted for that very operation.

mod engine;
mod params;
mod token;
#[cfg(feature = "tpm")]
pub mod tpm;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use tracing::{debug, info, instrument, warn};

pub use engine::{IV_LEN, KeyEngine, SoftwareEngine};
pub use params::{
    Algorithm, AuthValidity, AuthenticatorClass, BlockMode, CipherMode, KeyParameters, KeyPurpose,
    Padding, PlatformApi, PlatformAuthParams, Transformation,
};
pub use token::{EnrollmentEpoch, HardwareAuthToken, OperationChallenge, TokenAuthority};

use crate::error::{Error, Result};

/// Opaque reference to a key entry. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    alias: String,
    generation: u64,
}

impl KeyHandle {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Initialization vector, tagged with the key generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iv {
    bytes: [u8; IV_LEN],
    key_generation: u64,
}

impl Iv {
    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.bytes
    }

    /// Generation of the key this IV was issued under.
    pub fn key_generation(&self) -> u64 {
        self.key_generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Valid,
    Invalidated,
}

struct KeyEntry {
    params: KeyParameters,
    generation: u64,
    enrollment: Option<EnrollmentEpoch>,
}

struct PendingOperation {
    key: KeyHandle,
    mode: CipherMode,
    iv: Iv,
}

struct KeystoreState {
    engine: Box<dyn KeyEngine>,
    entries: HashMap<String, KeyEntry>,
    operations: HashMap<OperationChallenge, PendingOperation>,
    next_generation: u64,
}

/// Shared handle to the keystore. Clones refer to the same store.
#[derive(Clone)]
pub struct Keystore {
    state: Arc<Mutex<KeystoreState>>,
    authority: TokenAuthority,
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore").finish_non_exhaustive()
    }
}

impl Keystore {
    /// Keystore over the in-process [`SoftwareEngine`].
    pub fn software(authority: TokenAuthority) -> Self {
        Self::with_engine(SoftwareEngine::new(), authority)
    }

    pub fn with_engine(engine: impl KeyEngine + 'static, authority: TokenAuthority) -> Self {
        info!(engine = engine.name(), "Opening keystore");
        Self {
            state: Arc::new(Mutex::new(KeystoreState {
                engine: Box::new(engine),
                entries: HashMap::new(),
                operations: HashMap::new(),
                next_generation: 1,
            })),
            authority,
        }
    }

    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
    }

    fn state(&self) -> MutexGuard<'_, KeystoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates (or replaces) the key stored under `alias`.
    #[instrument(level = "debug", skip(self, params))]
    pub fn generate_key(&self, alias: &str, params: &KeyParameters) -> Result<KeyHandle> {
        params.validate()?;
        if params.user_authentication_required
            && params.authenticator != AuthenticatorClass::DeviceCredential
            && !self.authority.has_enrollments()
        {
            return Err(Error::KeyProvisioning(
                "at least one biometric must be enrolled to create an auth-bound key".into(),
            ));
        }

        let enrollment = params
            .invalidated_by_biometric_enrollment
            .then(|| self.authority.enrollment_epoch());

        let mut state = self.state();
        if !state.engine.supports(&Transformation::AES_CBC_PKCS7) {
            return Err(Error::KeyProvisioning(format!(
                "{} engine cannot provide {}",
                state.engine.name(),
                Transformation::AES_CBC_PKCS7
            )));
        }
        state.engine.generate_key(alias, params)?;

        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            alias.to_string(),
            KeyEntry {
                params: params.clone(),
                generation,
                enrollment,
            },
        );

        debug!(
            platform = ?params
                .validity
                .platform_params(PlatformApi::Parameters, params.authenticator),
            legacy = ?params
                .validity
                .platform_params(PlatformApi::ValidityDuration, params.authenticator),
            "Key authentication parameters"
        );
        info!(alias, generation, "Key generated");
        Ok(KeyHandle {
            alias: alias.to_string(),
            generation,
        })
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.state().entries.contains_key(alias)
    }

    pub fn status(&self, alias: &str) -> Option<KeyStatus> {
        let state = self.state();
        state.entries.get(alias).map(|entry| self.entry_status(entry))
    }

    /// The epoch never goes back, so an invalidated key stays invalidated
    /// until it is replaced.
    fn entry_status(&self, entry: &KeyEntry) -> KeyStatus {
        match entry.enrollment {
            Some(epoch) if epoch != self.authority.enrollment_epoch() => KeyStatus::Invalidated,
            _ => KeyStatus::Valid,
        }
    }

    pub fn parameters(&self, alias: &str) -> Option<KeyParameters> {
        self.state()
            .entries
            .get(alias)
            .map(|entry| entry.params.clone())
    }

    /// Looks up a usable key.
    pub fn key(&self, alias: &str) -> Result<KeyHandle> {
        let state = self.state();
        let entry = state.entries.get(alias).ok_or_else(|| Error::KeyNotFound {
            alias: alias.to_string(),
        })?;
        if self.entry_status(entry) == KeyStatus::Invalidated {
            warn!(alias, "Key invalidated by enrollment change");
            return Err(Error::KeyInvalidated {
                alias: alias.to_string(),
            });
        }
        Ok(KeyHandle {
            alias: alias.to_string(),
            generation: entry.generation,
        })
    }

    /// Deletes the key and aborts every operation pending on it.
    pub fn delete_key(&self, alias: &str) -> bool {
        let mut state = self.state();
        state.operations.retain(|_, op| op.key.alias != alias);
        state.engine.delete_key(alias);
        let removed = state.entries.remove(alias).is_some();
        if removed {
            info!(alias, "Key deleted");
        }
        removed
    }

    fn live_entry<'a>(&self, state: &'a KeystoreState, key: &KeyHandle) -> Result<&'a KeyEntry> {
        let entry = state
            .entries
            .get(&key.alias)
            .filter(|entry| entry.generation == key.generation)
            .ok_or_else(|| Error::KeyNotFound {
                alias: key.alias.clone(),
            })?;
        if self.entry_status(entry) == KeyStatus::Invalidated {
            return Err(Error::KeyInvalidated {
                alias: key.alias.clone(),
            });
        }
        Ok(entry)
    }

    /// Starts an operation. Encryption IVs are always chosen here.
    #[instrument(level = "debug", skip(self, iv), fields(alias = key.alias()))]
    pub(crate) fn begin(
        &self,
        key: &KeyHandle,
        mode: CipherMode,
        transformation: &Transformation,
        iv: Option<Iv>,
    ) -> Result<(OperationChallenge, Iv)> {
        let mut state = self.state();
        let entry = self.live_entry(&state, key)?;
        entry.params.allows(mode, transformation)?;
        if !state.engine.supports(transformation) {
            return Err(Error::UnsupportedTransformation(format!(
                "{transformation} not available from the {} engine",
                state.engine.name()
            )));
        }
        let generation = entry.generation;

        let iv = match (mode, iv) {
            (CipherMode::Encrypt, None) => Iv {
                bytes: state.engine.random_iv()?,
                key_generation: generation,
            },
            (CipherMode::Encrypt, Some(_)) => {
                return Err(Error::UnsupportedTransformation(
                    "caller-provided IV not permitted for encryption".into(),
                ));
            }
            (CipherMode::Decrypt, Some(iv)) if iv.key_generation != generation => {
                warn!(
                    iv_generation = iv.key_generation,
                    generation, "IV belongs to a replaced key"
                );
                return Err(Error::CryptoFinalization(
                    "ciphertext was produced under a different key".into(),
                ));
            }
            (CipherMode::Decrypt, Some(iv)) => iv,
            (CipherMode::Decrypt, None) => return Err(Error::MissingIv),
        };

        let mut rng = rand::rng();
        let challenge = loop {
            let candidate = OperationChallenge(rng.next_u64());
            if candidate.0 != 0 && !state.operations.contains_key(&candidate) {
                break candidate;
            }
        };
        state.operations.insert(
            challenge,
            PendingOperation {
                key: key.clone(),
                mode,
                iv: iv.clone(),
            },
        );
        debug!(%challenge, ?mode, "Operation started");
        Ok((challenge, iv))
    }

    /// Runs the cipher for a pending operation. The operation is consumed
    /// whether or not it succeeds.
    #[instrument(level = "debug", skip(self, token, input))]
    pub(crate) fn finish(
        &self,
        challenge: OperationChallenge,
        token: Option<&HardwareAuthToken>,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let mut state = self.state();
        let op = state.operations.remove(&challenge).ok_or_else(|| {
            Error::CryptoFinalization(format!("no pending operation {challenge}"))
        })?;
        let entry = self.live_entry(&state, &op.key)?;

        if entry.params.user_authentication_required {
            self.check_token(&entry.params, challenge, token)?;
        }
        if op.mode == CipherMode::Decrypt && op.iv.key_generation != entry.generation {
            return Err(Error::CryptoFinalization(
                "ciphertext was produced under a different key".into(),
            ));
        }

        let alias = op.key.alias.as_str();
        let output = match op.mode {
            CipherMode::Encrypt => state.engine.encrypt(alias, &op.iv.bytes, input)?,
            CipherMode::Decrypt => state.engine.decrypt(alias, &op.iv.bytes, input)?,
        };
        debug!(%challenge, "Operation finished");
        Ok(output)
    }

    fn check_token(
        &self,
        params: &KeyParameters,
        challenge: OperationChallenge,
        token: Option<&HardwareAuthToken>,
    ) -> Result<()> {
        let token = token.ok_or_else(|| {
            Error::CryptoFinalization("key requires user authentication".into())
        })?;
        if !self.authority.verify(token) {
            return Err(Error::CryptoFinalization("auth token rejected".into()));
        }
        if token.authenticator != params.authenticator {
            return Err(Error::CryptoFinalization(format!(
                "key requires {:?}, token is {:?}",
                params.authenticator, token.authenticator
            )));
        }
        match params.validity {
            AuthValidity::EveryUse if token.challenge != challenge => Err(
                Error::CryptoFinalization("auth token bound to a different operation".into()),
            ),
            AuthValidity::Within(window) if self.authority.age(token) > window => {
                Err(Error::CryptoFinalization("auth token expired".into()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn abort(&self, challenge: OperationChallenge) {
        if self.state().operations.remove(&challenge).is_some() {
            debug!(%challenge, "Operation aborted");
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.state().operations.len()
    }
}
