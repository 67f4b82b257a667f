//! The presence-gated key the whole workflow revolves around.

use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::keystore::{KeyHandle, KeyParameters, KeyStatus, Keystore};

/// Owns one key alias inside a [`Keystore`].
///
/// The vault never hands out key bytes, only [`KeyHandle`]s.
#[derive(Debug, Clone)]
pub struct KeyVault {
    keystore: Keystore,
    alias: String,
    params: KeyParameters,
}

impl KeyVault {
    pub fn new(keystore: Keystore, alias: impl Into<String>, params: KeyParameters) -> Self {
        Self {
            keystore,
            alias: alias.into(),
            params,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn parameters(&self) -> &KeyParameters {
        &self.params
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Returns the key, creating it first if there is none.
    ///
    /// An invalidated key is deleted and replaced; that is how a caller
    /// re-provisions after the enrolled biometrics changed.
    #[instrument(level = "debug", skip(self), fields(alias = %self.alias))]
    pub fn ensure_key(&self) -> Result<KeyHandle> {
        match self.keystore.status(&self.alias) {
            Some(KeyStatus::Valid) => return self.keystore.key(&self.alias),
            Some(KeyStatus::Invalidated) => {
                warn!("Replacing invalidated key");
                self.keystore.delete_key(&self.alias);
            }
            None => info!("No key yet, generating"),
        }
        self.keystore
            .generate_key(&self.alias, &self.params)
            .map_err(|e| match e {
                Error::KeyProvisioning(_) => e,
                other => Error::KeyProvisioning(other.to_string()),
            })
    }

    /// Returns the current key without creating one.
    pub fn get_key(&self) -> Result<KeyHandle> {
        self.keystore.key(&self.alias)
    }

    pub fn delete_key(&self) -> bool {
        self.keystore.delete_key(&self.alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::TokenAuthority;

    const ALIAS: &str = "biometric_secure_key";

    fn vault() -> KeyVault {
        let authority = TokenAuthority::new();
        authority.enroll("finger-1");
        KeyVault::new(Keystore::software(authority), ALIAS, KeyParameters::default())
    }

    #[test]
    fn ensure_key_is_idempotent() {
        let vault = vault();
        let first = vault.ensure_key().unwrap();
        let second = vault.ensure_key().unwrap();
        assert_eq!(first, second);
        assert_eq!(vault.get_key().unwrap(), first);
    }

    #[test]
    fn get_key_before_provisioning_is_not_found() {
        assert_eq!(
            vault().get_key(),
            Err(Error::KeyNotFound {
                alias: ALIAS.into()
            })
        );
    }

    #[test]
    fn invalidation_is_distinct_and_ensure_key_replaces_the_key() {
        let vault = vault();
        let original = vault.ensure_key().unwrap();

        vault.keystore().authority().enroll("finger-2");
        assert_eq!(
            vault.get_key(),
            Err(Error::KeyInvalidated {
                alias: ALIAS.into()
            })
        );

        let replacement = vault.ensure_key().unwrap();
        assert_ne!(replacement.generation(), original.generation());
        assert_eq!(vault.get_key().unwrap(), replacement);
    }

    #[test]
    fn provisioning_without_enrollment_fails() {
        let vault = KeyVault::new(
            Keystore::software(TokenAuthority::new()),
            ALIAS,
            KeyParameters::default(),
        );
        assert!(matches!(
            vault.ensure_key(),
            Err(Error::KeyProvisioning(_))
        ));
    }

    #[test]
    fn bad_parameters_fail_provisioning() {
        let authority = TokenAuthority::new();
        authority.enroll("finger-1");
        let params = KeyParameters {
            key_size_bits: 512,
            ..Default::default()
        };
        let vault = KeyVault::new(Keystore::software(authority), ALIAS, params);
        assert!(matches!(
            vault.ensure_key(),
            Err(Error::KeyProvisioning(_))
        ));
    }
}
