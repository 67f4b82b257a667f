use std::collections::HashMap;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::params::{Algorithm, BlockMode, KeyParameters, Padding, Transformation};
use crate::error::{Error, Result};

pub const IV_LEN: usize = 16;

const ROOT_KEY_LEN: usize = 32;
const KEY_SALT_LEN: usize = 16;

/// Holds key material and runs the raw cipher.
///
/// Engines know nothing about authentication; the [`Keystore`](super::Keystore)
/// in front of them decides whether an operation may run at all.
pub trait KeyEngine: Send {
    fn name(&self) -> &'static str;

    fn supports(&self, transformation: &Transformation) -> bool;

    fn generate_key(&mut self, alias: &str, params: &KeyParameters) -> Result<()>;

    fn delete_key(&mut self, alias: &str);

    fn random_iv(&mut self) -> Result<[u8; IV_LEN]>;

    fn encrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Root of the software key hierarchy. Every key entry is derived from it.
struct DeviceRootKey {
    key: SecretSlice<u8>,
}

impl DeviceRootKey {
    fn generate() -> Self {
        let mut key = [0u8; ROOT_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        let root = Self {
            key: SecretSlice::new(key.to_vec().into()),
        };
        key.zeroize();
        root
    }

    /// Derives a fresh key for `alias`. The random salt makes every
    /// generation of the same alias a different key.
    fn derive(&self, alias: &str, len: usize) -> Result<KeyMaterial> {
        let mut salt = [0u8; KEY_SALT_LEN];
        rand::rng().fill_bytes(&mut salt);

        let mut okm = [0u8; 32];
        let out = okm
            .get_mut(..len)
            .ok_or_else(|| Error::KeyProvisioning(format!("key length {len} too large")))?;
        let hkdf = Hkdf::<sha2::Sha256>::new(Some(&salt), self.key.expose_secret());
        hkdf.expand(format!("biogate/key/{alias}").as_bytes(), out)
            .map_err(|e| Error::KeyProvisioning(format!("key derivation failed: {e}")))?;

        let material = KeyMaterial {
            key: SecretSlice::new(out.to_vec().into()),
        };
        okm.zeroize();
        Ok(material)
    }
}

impl Zeroize for DeviceRootKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for DeviceRootKey {}

impl Drop for DeviceRootKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

struct KeyMaterial {
    key: SecretSlice<u8>,
}

/// In-process engine: AES-CBC-PKCS7 over keys that never leave this struct.
pub struct SoftwareEngine {
    root: DeviceRootKey,
    keys: HashMap<String, KeyMaterial>,
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self {
            root: DeviceRootKey::generate(),
            keys: HashMap::new(),
        }
    }

    fn material(&self, alias: &str) -> Result<&KeyMaterial> {
        self.keys.get(alias).ok_or_else(|| Error::KeyNotFound {
            alias: alias.to_string(),
        })
    }
}

impl KeyEngine for SoftwareEngine {
    fn name(&self) -> &'static str {
        "software"
    }

    fn supports(&self, transformation: &Transformation) -> bool {
        matches!(
            transformation,
            Transformation {
                algorithm: Algorithm::Aes,
                block_mode: BlockMode::Cbc,
                padding: Padding::Pkcs7,
            }
        )
    }

    fn generate_key(&mut self, alias: &str, params: &KeyParameters) -> Result<()> {
        let material = self.root.derive(alias, params.key_len())?;
        debug!(alias, bits = params.key_size_bits, "Derived software key");
        self.keys.insert(alias.to_string(), material);
        Ok(())
    }

    fn delete_key(&mut self, alias: &str) {
        self.keys.remove(alias);
    }

    fn random_iv(&mut self) -> Result<[u8; IV_LEN]> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        Ok(iv)
    }

    fn encrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.material(alias)?.key.expose_secret();
        trace!(alias, len = plaintext.len(), "AES-CBC encrypt");
        match key.len() {
            16 => Ok(cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|e| Error::CryptoFinalization(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
            32 => Ok(cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|e| Error::CryptoFinalization(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
            n => Err(Error::CryptoFinalization(format!("bad key length {n}"))),
        }
    }

    fn decrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.material(alias)?.key.expose_secret();
        trace!(alias, len = ciphertext.len(), "AES-CBC decrypt");
        let unpadded = match key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|e| Error::CryptoFinalization(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|e| Error::CryptoFinalization(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            n => return Err(Error::CryptoFinalization(format!("bad key length {n}"))),
        };
        unpadded.map_err(|_| Error::CryptoFinalization("bad padding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_key(alias: &str, bits: u16) -> SoftwareEngine {
        let mut engine = SoftwareEngine::new();
        let params = KeyParameters {
            key_size_bits: bits,
            ..Default::default()
        };
        engine.generate_key(alias, &params).unwrap();
        engine
    }

    #[test]
    fn cbc_round_trip_for_both_key_sizes() {
        for bits in [128, 256] {
            let mut engine = engine_with_key("k", bits);
            let iv = engine.random_iv().unwrap();
            let plaintext = b"Secret : This is a s3cr3t message that needs encryption";

            let ciphertext = engine.encrypt("k", &iv, plaintext).unwrap();
            assert_eq!(ciphertext.len() % IV_LEN, 0);
            assert_ne!(ciphertext, plaintext.to_vec());

            let decrypted = engine.decrypt("k", &iv, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn block_aligned_input_gets_a_full_padding_block() {
        let mut engine = engine_with_key("k", 256);
        let iv = engine.random_iv().unwrap();
        let ciphertext = engine.encrypt("k", &iv, &[0u8; 32]).unwrap();
        assert_eq!(ciphertext.len(), 48);
    }

    #[test]
    fn regenerating_an_alias_changes_the_key() {
        let mut engine = engine_with_key("k", 256);
        let iv = [0u8; IV_LEN];
        let first = engine.encrypt("k", &iv, b"same input").unwrap();

        engine
            .generate_key("k", &KeyParameters::default())
            .unwrap();
        let second = engine.encrypt("k", &iv, b"same input").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn truncated_ciphertext_fails_to_finalize() {
        let mut engine = engine_with_key("k", 256);
        let iv = engine.random_iv().unwrap();
        let ciphertext = engine.encrypt("k", &iv, b"hello").unwrap();
        let err = engine.decrypt("k", &iv, &ciphertext[..8]).unwrap_err();
        assert!(matches!(err, Error::CryptoFinalization(_)));
    }

    #[test]
    fn deleted_key_is_gone() {
        let mut engine = engine_with_key("k", 256);
        engine.delete_key("k");
        let err = engine.encrypt("k", &[0u8; IV_LEN], b"x").unwrap_err();
        assert!(matches!(err, Error::KeyNotFound { .. }));
    }

    #[test]
    fn only_cbc_pkcs7_is_supported() {
        let engine = SoftwareEngine::new();
        assert!(engine.supports(&Transformation::AES_CBC_PKCS7));
        assert!(!engine.supports(&Transformation {
            block_mode: BlockMode::Ecb,
            ..Transformation::AES_CBC_PKCS7
        }));
    }
}
