//! One encrypt-or-decrypt operation against a vault key.

use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::keystore::{
    CipherMode, HardwareAuthToken, Iv, KeyHandle, Keystore, OperationChallenge, Transformation,
};
use crate::vault::KeyVault;

/// A cipher bound to one key, one mode and one IV.
///
/// Created per attempt and finalized at most once. The keystore will only
/// run it once an auth token for [`challenge`](Self::challenge) has been
/// bound, which only [`AuthGate`](crate::AuthGate) does. Dropping an
/// unfinished session aborts the pending keystore operation.
#[derive(Debug)]
pub struct CipherSession {
    keystore: Keystore,
    key: KeyHandle,
    mode: CipherMode,
    transformation: Transformation,
    challenge: OperationChallenge,
    iv: Iv,
    token: Option<HardwareAuthToken>,
    finished: bool,
}

impl CipherSession {
    /// Prepares an AES/CBC/PKCS7 session.
    ///
    /// Encryption picks a fresh IV, readable through [`current_iv`](Self::current_iv).
    /// Decryption needs the IV captured by the matching encryption.
    pub fn prepare(
        vault: &KeyVault,
        key: &KeyHandle,
        mode: CipherMode,
        iv: Option<Iv>,
    ) -> Result<Self> {
        Self::prepare_with(vault, key, mode, iv, Transformation::AES_CBC_PKCS7)
    }

    #[instrument(level = "debug", skip(vault, iv), fields(alias = key.alias()))]
    pub fn prepare_with(
        vault: &KeyVault,
        key: &KeyHandle,
        mode: CipherMode,
        iv: Option<Iv>,
        transformation: Transformation,
    ) -> Result<Self> {
        if mode == CipherMode::Decrypt && iv.is_none() {
            return Err(Error::MissingIv);
        }
        let keystore = vault.keystore().clone();
        let (challenge, iv) = keystore.begin(key, mode, &transformation, iv)?;
        debug!(%challenge, %transformation, "Cipher session prepared");

        Ok(Self {
            keystore,
            key: key.clone(),
            mode,
            transformation,
            challenge,
            iv,
            token: None,
            finished: false,
        })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn transformation(&self) -> Transformation {
        self.transformation
    }

    /// Challenge the presence proof has to be minted for.
    pub fn challenge(&self) -> OperationChallenge {
        self.challenge
    }

    /// The IV to keep next to the ciphertext. Only encryption sessions have one to hand out.
    pub fn current_iv(&self) -> Option<&Iv> {
        match self.mode {
            CipherMode::Encrypt => Some(&self.iv),
            CipherMode::Decrypt => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn bind(&mut self, token: HardwareAuthToken) {
        self.token = Some(token);
    }

    /// Encrypts or decrypts `input`. Callable once.
    #[instrument(
        level = "debug",
        skip(self, input),
        fields(challenge = %self.challenge, mode = ?self.mode)
    )]
    pub fn finish(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if self.finished {
            warn!("Cipher session reused");
            return Err(Error::SessionConsumed);
        }
        self.finished = true;
        self.keystore
            .finish(self.challenge, self.token.as_ref(), input)
    }
}

impl Drop for CipherSession {
    fn drop(&mut self) {
        if !self.finished {
            self.keystore.abort(self.challenge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{AuthenticatorClass, BlockMode, KeyParameters, TokenAuthority};

    fn vault() -> KeyVault {
        let authority = TokenAuthority::new();
        authority.enroll("finger-1");
        KeyVault::new(
            Keystore::software(authority),
            "biometric_secure_key",
            KeyParameters::default(),
        )
    }

    fn authenticate(session: &mut CipherSession, vault: &KeyVault) {
        let token = vault
            .keystore()
            .authority()
            .mint(session.challenge(), AuthenticatorClass::BiometricStrong)
            .unwrap();
        session.bind(token);
    }

    #[test]
    fn encrypt_session_exposes_its_iv_and_decrypt_does_not() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let enc = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        let iv = enc.current_iv().cloned().unwrap();

        let dec = CipherSession::prepare(&vault, &key, CipherMode::Decrypt, Some(iv)).unwrap();
        assert!(dec.current_iv().is_none());
    }

    #[test]
    fn decrypt_without_iv_fails() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let err = CipherSession::prepare(&vault, &key, CipherMode::Decrypt, None).unwrap_err();
        assert_eq!(err, Error::MissingIv);
    }

    #[test]
    fn unsupported_block_mode_is_rejected() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let ecb = Transformation {
            block_mode: BlockMode::Ecb,
            ..Transformation::AES_CBC_PKCS7
        };
        let err = CipherSession::prepare_with(&vault, &key, CipherMode::Encrypt, None, ecb)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransformation(_)));
    }

    #[test]
    fn finish_without_authentication_is_rejected() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let mut session = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        assert!(matches!(
            session.finish(b"hello"),
            Err(Error::CryptoFinalization(_))
        ));
    }

    #[test]
    fn second_finish_is_a_reuse_error() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let mut session = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        authenticate(&mut session, &vault);

        assert!(session.finish(b"hello").is_ok());
        assert_eq!(session.finish(b"hello"), Err(Error::SessionConsumed));
    }

    #[test]
    fn round_trip_through_two_sessions() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();

        let mut enc = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        authenticate(&mut enc, &vault);
        let iv = enc.current_iv().cloned().unwrap();
        let ciphertext = enc.finish(b"hello").unwrap();

        let mut dec = CipherSession::prepare(&vault, &key, CipherMode::Decrypt, Some(iv)).unwrap();
        authenticate(&mut dec, &vault);
        assert_eq!(dec.finish(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails_to_finalize() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();

        let mut enc = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        authenticate(&mut enc, &vault);
        let iv = enc.current_iv().cloned().unwrap();
        let mut ciphertext = enc.finish(b"hello").unwrap();
        ciphertext.truncate(ciphertext.len() - 1);

        let mut dec = CipherSession::prepare(&vault, &key, CipherMode::Decrypt, Some(iv)).unwrap();
        authenticate(&mut dec, &vault);
        assert!(matches!(
            dec.finish(&ciphertext),
            Err(Error::CryptoFinalization(_))
        ));
    }

    #[test]
    fn dropping_an_unfinished_session_aborts_the_operation() {
        let vault = vault();
        let key = vault.ensure_key().unwrap();
        let session = CipherSession::prepare(&vault, &key, CipherMode::Encrypt, None).unwrap();
        assert_eq!(vault.keystore().pending_operations(), 1);
        drop(session);
        assert_eq!(vault.keystore().pending_operations(), 0);
    }
}
