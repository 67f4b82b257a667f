//! Key generation parameters and the cipher transformation descriptor.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[default]
    Aes,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockMode {
    #[default]
    Cbc,
    Ctr,
    Cfb,
    Ecb,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Padding {
    #[default]
    Pkcs7,
    None,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    Encrypt,
    Decrypt,
}

/// Direction a cipher session runs in. Fixed for the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

impl CipherMode {
    pub fn purpose(self) -> KeyPurpose {
        match self {
            CipherMode::Encrypt => KeyPurpose::Encrypt,
            CipherMode::Decrypt => KeyPurpose::Decrypt,
        }
    }
}

/// Assurance class of whatever vouched for the user.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthenticatorClass {
    #[default]
    BiometricStrong,
    BiometricWeak,
    DeviceCredential,
}

impl AuthenticatorClass {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            AuthenticatorClass::BiometricStrong => 0x0f,
            AuthenticatorClass::BiometricWeak => 0xff,
            AuthenticatorClass::DeviceCredential => 0x80,
        }
    }
}

/// Algorithm/mode/padding triple. Stateless; built fresh for each operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transformation {
    pub algorithm: Algorithm,
    pub block_mode: BlockMode,
    pub padding: Padding,
}

impl Transformation {
    pub const AES_CBC_PKCS7: Transformation = Transformation {
        algorithm: Algorithm::Aes,
        block_mode: BlockMode::Cbc,
        padding: Padding::Pkcs7,
    };
}

impl Default for Transformation {
    fn default() -> Self {
        Self::AES_CBC_PKCS7
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.algorithm {
            Algorithm::Aes => "AES",
        };
        let mode = match self.block_mode {
            BlockMode::Cbc => "CBC",
            BlockMode::Ctr => "CTR",
            BlockMode::Cfb => "CFB",
            BlockMode::Ecb => "ECB",
        };
        let padding = match self.padding {
            Padding::Pkcs7 => "PKCS7Padding",
            Padding::None => "NoPadding",
        };
        write!(f, "{algorithm}/{mode}/{padding}")
    }
}

/// How long a successful authentication keeps the key usable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthValidity {
    /// Every cipher operation needs its own authentication.
    #[default]
    EveryUse,
    /// Any authentication younger than this unlocks the key.
    Within(Duration),
}

/// Shape of the authentication-timeout API a platform keystore exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformApi {
    /// Timeout plus authenticator set in one call.
    Parameters,
    /// Only a validity duration in seconds, `-1` meaning every use.
    ValidityDuration,
}

/// [`AuthValidity`] lowered onto one of the platform API shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformAuthParams {
    Parameters {
        timeout_seconds: u32,
        authenticators: AuthenticatorClass,
    },
    ValidityDurationSeconds(i64),
}

impl AuthValidity {
    pub fn platform_params(
        self,
        api: PlatformApi,
        authenticators: AuthenticatorClass,
    ) -> PlatformAuthParams {
        match (api, self) {
            (PlatformApi::Parameters, AuthValidity::EveryUse) => PlatformAuthParams::Parameters {
                timeout_seconds: 0,
                authenticators,
            },
            (PlatformApi::Parameters, AuthValidity::Within(window)) => {
                PlatformAuthParams::Parameters {
                    timeout_seconds: u32::try_from(window.as_secs()).unwrap_or(u32::MAX),
                    authenticators,
                }
            }
            (PlatformApi::ValidityDuration, AuthValidity::EveryUse) => {
                PlatformAuthParams::ValidityDurationSeconds(-1)
            }
            (PlatformApi::ValidityDuration, AuthValidity::Within(window)) => {
                PlatformAuthParams::ValidityDurationSeconds(
                    i64::try_from(window.as_secs()).unwrap_or(i64::MAX),
                )
            }
        }
    }
}

/// Constraints baked into a key when it is generated.
///
/// The defaults describe a presence-gated key: AES-256 for CBC with PKCS7,
/// strong biometric required for every single use, and revoked as soon as
/// the enrolled biometric set changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct KeyParameters {
    pub algorithm: Algorithm,
    pub key_size_bits: u16,
    pub purposes: Vec<KeyPurpose>,
    pub block_modes: Vec<BlockMode>,
    pub paddings: Vec<Padding>,
    pub user_authentication_required: bool,
    pub authenticator: AuthenticatorClass,
    pub validity: AuthValidity,
    pub invalidated_by_biometric_enrollment: bool,
}

impl Default for KeyParameters {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Aes,
            key_size_bits: 256,
            purposes: vec![KeyPurpose::Encrypt, KeyPurpose::Decrypt],
            block_modes: vec![BlockMode::Cbc],
            paddings: vec![Padding::Pkcs7],
            user_authentication_required: true,
            authenticator: AuthenticatorClass::BiometricStrong,
            validity: AuthValidity::EveryUse,
            invalidated_by_biometric_enrollment: true,
        }
    }
}

impl KeyParameters {
    pub fn key_len(&self) -> usize {
        usize::from(self.key_size_bits / 8)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.key_size_bits, 128 | 256) {
            return Err(Error::KeyProvisioning(format!(
                "unsupported AES key size {} bits",
                self.key_size_bits
            )));
        }
        if self.purposes.is_empty() {
            return Err(Error::KeyProvisioning("key has no purposes".into()));
        }
        if self.block_modes.is_empty() || self.paddings.is_empty() {
            return Err(Error::KeyProvisioning(
                "key must allow at least one block mode and padding".into(),
            ));
        }
        if self.invalidated_by_biometric_enrollment
            && self.authenticator == AuthenticatorClass::DeviceCredential
        {
            return Err(Error::KeyProvisioning(
                "enrollment invalidation needs a biometric authenticator".into(),
            ));
        }
        Ok(())
    }

    pub fn allows(&self, mode: CipherMode, transformation: &Transformation) -> Result<()> {
        if !self.purposes.contains(&mode.purpose()) {
            return Err(Error::UnsupportedTransformation(format!(
                "key purposes {:?} exclude {:?}",
                self.purposes,
                mode.purpose()
            )));
        }
        if transformation.algorithm != self.algorithm
            || !self.block_modes.contains(&transformation.block_mode)
            || !self.paddings.contains(&transformation.padding)
        {
            return Err(Error::UnsupportedTransformation(format!(
                "{transformation} is not permitted for this key"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformation_renders_like_a_jca_name() {
        assert_eq!(
            Transformation::AES_CBC_PKCS7.to_string(),
            "AES/CBC/PKCS7Padding"
        );
    }

    #[test]
    fn every_use_lowers_to_both_platform_shapes() {
        let strong = AuthenticatorClass::BiometricStrong;
        assert_eq!(
            AuthValidity::EveryUse.platform_params(PlatformApi::Parameters, strong),
            PlatformAuthParams::Parameters {
                timeout_seconds: 0,
                authenticators: strong
            }
        );
        assert_eq!(
            AuthValidity::EveryUse.platform_params(PlatformApi::ValidityDuration, strong),
            PlatformAuthParams::ValidityDurationSeconds(-1)
        );
    }

    #[test]
    fn time_window_keeps_its_length() {
        let window = AuthValidity::Within(Duration::from_secs(30));
        assert_eq!(
            window.platform_params(PlatformApi::ValidityDuration, AuthenticatorClass::default()),
            PlatformAuthParams::ValidityDurationSeconds(30)
        );
    }

    #[test]
    fn default_parameters_are_presence_gated() {
        let params = KeyParameters::default();
        assert!(params.validate().is_ok());
        assert!(params.user_authentication_required);
        assert!(params.invalidated_by_biometric_enrollment);
        assert_eq!(params.validity, AuthValidity::EveryUse);
        assert_eq!(params.key_len(), 32);
    }

    #[test]
    fn odd_key_sizes_are_rejected() {
        let params = KeyParameters {
            key_size_bits: 192,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(Error::KeyProvisioning(_))));
    }

    #[test]
    fn ctr_is_not_allowed_on_a_cbc_key() {
        let ctr = Transformation {
            block_mode: BlockMode::Ctr,
            ..Transformation::AES_CBC_PKCS7
        };
        assert!(matches!(
            KeyParameters::default().allows(CipherMode::Encrypt, &ctr),
            Err(Error::UnsupportedTransformation(_))
        ));
    }

    #[test]
    fn encrypt_only_key_refuses_decrypt() {
        let params = KeyParameters {
            purposes: vec![KeyPurpose::Encrypt],
            ..Default::default()
        };
        assert!(params
            .allows(CipherMode::Decrypt, &Transformation::AES_CBC_PKCS7)
            .is_err());
    }
}
