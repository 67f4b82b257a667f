//! TPM 2.0 key engine.
//!
//! Keys are AES child keys created under a symmetric primary in the owner
//! hierarchy. They are `fixedTPM`, so the material never leaves the chip;
//! CBC runs inside the TPM through `EncryptDecrypt2` and only the PKCS7
//! padding is applied on this side.
//!
//! The ESYS context is not thread-safe, so it lives on a dedicated worker
//! thread. [`TpmEngine`] only holds the sending half of a job queue.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use aes::cipher::block_padding::{Pkcs7, RawPadding};
use tracing::{debug, error, info, instrument, trace};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::{AlgorithmIdentifier, CapabilityType};
use tss_esapi::handles::{KeyHandle as TpmKeyHandle, ObjectHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::key_bits::AesKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    CapabilityData, CreateKeyResult, Digest, InitialValue, MaxBuffer, PublicBuilder,
    SymmetricCipherParameters, SymmetricDefinitionObject,
};
use tss_esapi::{Context, TctiNameConf, tcti_ldr::TabrmdConfig};

use super::engine::{IV_LEN, KeyEngine};
use super::params::{Algorithm, BlockMode, KeyParameters, Padding, Transformation};
use crate::error::{Error, Result};

const AES_BLOCK_SIZE: usize = 16;

/// TCTI from the environment, falling back to the tabrmd resource manager.
pub fn default_tcti() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

/// Asks the TPM whether it implements both AES and CBC.
fn supports_aes_cbc(ctx: &mut Context) -> Result<bool> {
    let (data, _) = ctx.get_capability(CapabilityType::Algorithms, 0, 64)?;
    let CapabilityData::Algorithms(algorithms) = data else {
        error!("Unexpected capability data type: {:?}", data);
        return Err(Error::KeyProvisioning(
            "TPM returned unexpected capability data".into(),
        ));
    };
    let has = |id| algorithms.iter().any(|a| a.algorithm_identifier() == id);
    Ok(has(AlgorithmIdentifier::Aes) && has(AlgorithmIdentifier::Cbc))
}

fn worker_gone() -> Error {
    Error::CryptoFinalization("TPM worker thread is not running".into())
}

/// Everything that touches the ESYS context. Owned by the worker thread.
struct TpmState {
    ctx: Context,
    primary: TpmKeyHandle,
    keys: HashMap<String, TpmKeyHandle>,
}

type Job = Box<dyn FnOnce(&mut TpmState) + Send>;

impl TpmState {
    /// Creates the AES-128-CFB storage primary every key is parented to.
    fn open(mut ctx: Context) -> Result<(Self, bool)> {
        let cbc_supported = supports_aes_cbc(&mut ctx)?;

        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_st_clear(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .build()?;

        let primary_public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()?;

        trace!(?primary_public, "Creating storage primary");
        let primary = ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, primary_public, None, None, None, None)
            })?
            .key_handle;

        let state = Self {
            ctx,
            primary,
            keys: HashMap::new(),
        };
        Ok((state, cbc_supported))
    }

    fn key(&self, alias: &str) -> Result<TpmKeyHandle> {
        self.keys.get(alias).copied().ok_or_else(|| Error::KeyNotFound {
            alias: alias.to_string(),
        })
    }

    fn flush(&mut self, handle: TpmKeyHandle) {
        if let Err(e) = self.ctx.flush_context(ObjectHandle::from(handle)) {
            error!(error = %e, "Failed to flush key handle");
        }
    }

    fn create_key(&mut self, alias: String, key_bits: AesKeyBits) -> Result<()> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_st_clear(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_sign_encrypt(true)
            .with_decrypt(true)
            .with_restricted(false)
            .build()?;

        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::Aes {
                    key_bits,
                    mode: SymmetricMode::Cbc,
                },
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()?;

        let primary = self.primary;
        let (private, public) = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(primary, template, None, None, None, None)
                .map(|key: CreateKeyResult| (key.out_private, key.out_public))
        })?;
        let handle = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;

        if let Some(old) = self.keys.insert(alias.clone(), handle) {
            self.flush(old);
        }
        debug!(alias, "TPM child key loaded");
        Ok(())
    }

    fn random_iv(&mut self) -> Result<[u8; IV_LEN]> {
        let random = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.get_random(IV_LEN))?;
        random
            .value()
            .try_into()
            .map_err(|_| Error::KeyProvisioning("TPM returned a short IV".into()))
    }

    /// Runs CBC in `MaxBuffer`-sized chunks, chaining the IV the TPM hands back.
    fn cbc(
        &mut self,
        alias: &str,
        decrypt: bool,
        iv: &[u8; IV_LEN],
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let handle = self.key(alias)?;
        let mut chain = InitialValue::try_from(iv.to_vec())
            .map_err(|e| Error::CryptoFinalization(e.to_string()))?;
        let mut out = Vec::with_capacity(data.len());

        for chunk in data.chunks(MaxBuffer::MAX_SIZE) {
            let input = MaxBuffer::try_from(chunk.to_vec())
                .map_err(|e| Error::CryptoFinalization(e.to_string()))?;
            let (output, next_iv) = self
                .ctx
                .execute_with_nullauth_session(|ctx| {
                    ctx.encrypt_decrypt_2(handle, decrypt, SymmetricMode::Cbc, input, chain.clone())
                })
                .map_err(|e| Error::CryptoFinalization(format!("TPM: {e}")))?;
            out.extend_from_slice(output.value());
            chain = next_iv;
        }
        Ok(out)
    }
}

impl Drop for TpmState {
    fn drop(&mut self) {
        let handles: Vec<_> = self.keys.drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            self.flush(handle);
        }
        let primary = self.primary;
        self.flush(primary);
    }
}

pub struct TpmEngine {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    cbc_supported: bool,
}

impl TpmEngine {
    pub fn from_environment() -> Result<Self> {
        Self::new(default_tcti())
    }

    /// Starts the worker thread, opens the context on it and creates the
    /// storage primary.
    #[instrument(level = "debug", skip_all)]
    pub fn new(tcti: TctiNameConf) -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<bool>>(1);

        let worker = thread::Builder::new()
            .name("tpm-engine".into())
            .spawn(move || {
                let opened = Context::new(tcti)
                    .map_err(Error::from)
                    .and_then(TpmState::open);
                let mut state = match opened {
                    Ok((state, cbc_supported)) => {
                        if ready_tx.send(Ok(cbc_supported)).is_err() {
                            return;
                        }
                        state
                    }
                    Err(e) => {
                        if ready_tx.send(Err(e)).is_err() {
                            debug!("TPM engine dropped before it was ready");
                        }
                        return;
                    }
                };
                while let Ok(job) = queue.recv() {
                    job(&mut state);
                }
                debug!("TPM worker shutting down");
            })
            .map_err(|e| Error::KeyProvisioning(format!("cannot start TPM worker: {e}")))?;

        let cbc_supported = ready_rx
            .recv()
            .map_err(|_| Error::KeyProvisioning("TPM worker exited during startup".into()))??;

        info!(cbc_supported, "TPM engine ready");
        Ok(Self {
            jobs: Some(jobs),
            worker: Some(worker),
            cbc_supported,
        })
    }

    /// Runs `f` on the worker thread and waits for its result.
    fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TpmState) -> Result<T> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or_else(worker_gone)?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        jobs.send(Box::new(move |state: &mut TpmState| {
            if reply_tx.send(f(state)).is_err() {
                debug!("TPM job result discarded");
            }
        }))
        .map_err(|_| worker_gone())?;
        reply_rx.recv().map_err(|_| worker_gone())?
    }
}

impl Drop for TpmEngine {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop, which flushes every handle.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("TPM worker panicked");
            }
        }
    }
}

impl KeyEngine for TpmEngine {
    fn name(&self) -> &'static str {
        "tpm"
    }

    fn supports(&self, transformation: &Transformation) -> bool {
        self.cbc_supported
            && matches!(
                transformation,
                Transformation {
                    algorithm: Algorithm::Aes,
                    block_mode: BlockMode::Cbc,
                    padding: Padding::Pkcs7,
                }
            )
    }

    #[instrument(level = "debug", skip(self, params))]
    fn generate_key(&mut self, alias: &str, params: &KeyParameters) -> Result<()> {
        let key_bits = match params.key_size_bits {
            128 => AesKeyBits::Aes128,
            256 => AesKeyBits::Aes256,
            bits => {
                return Err(Error::KeyProvisioning(format!(
                    "TPM cannot create a {bits}-bit AES key"
                )));
            }
        };
        let alias = alias.to_string();
        self.call(move |tpm| tpm.create_key(alias, key_bits))
    }

    fn delete_key(&mut self, alias: &str) {
        let alias = alias.to_string();
        let deleted = self.call(move |tpm| {
            if let Some(handle) = tpm.keys.remove(&alias) {
                tpm.flush(handle);
            }
            Ok(())
        });
        if let Err(e) = deleted {
            error!(error = %e, "Failed to delete TPM key");
        }
    }

    fn random_iv(&mut self) -> Result<[u8; IV_LEN]> {
        self.call(TpmState::random_iv)
    }

    fn encrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let alias = alias.to_string();
        let iv = *iv;
        let padded = pkcs7_pad(plaintext);
        self.call(move |tpm| tpm.cbc(&alias, false, &iv, &padded))
    }

    fn decrypt(&mut self, alias: &str, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::CryptoFinalization(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }
        let alias = alias.to_string();
        let iv = *iv;
        let ciphertext = ciphertext.to_vec();
        let padded = self.call(move |tpm| tpm.cbc(&alias, true, &iv, &ciphertext))?;
        pkcs7_unpad(padded)
    }
}

/// Pads to whole blocks; a full padding block is added when `data` is already aligned.
fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let tail = data.len() % AES_BLOCK_SIZE;
    let padded_len = data.len() - tail + AES_BLOCK_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.resize(padded_len, 0);
    Pkcs7::raw_pad(&mut padded[padded_len - AES_BLOCK_SIZE..], tail);
    padded
}

fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let bad_padding = || Error::CryptoFinalization("bad padding".into());
    if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
        return Err(bad_padding());
    }
    let last = data.len() - AES_BLOCK_SIZE;
    let kept = Pkcs7::raw_unpad(&data[last..])
        .map_err(|_| bad_padding())?
        .len();
    data.truncate(last + kept);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing_test::traced_test;
    use tss_esapi::Tcti;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn test_tcti() -> Tcti {
        Tcti::from_environment_variable().unwrap_or(Tcti::Swtpm(NetworkTPMConfig::default()))
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn engine_is_send_without_sharing_the_context() {
        assert_send::<TpmEngine>();
    }

    #[test]
    fn padding_round_trip() {
        for len in [0, 1, 15, 16, 17, 31, 32] {
            let data = vec![0xabu8; len];
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % AES_BLOCK_SIZE, 0);
            assert!(padded.len() > data.len());
            assert_eq!(pkcs7_unpad(padded).unwrap(), data);
        }
    }

    #[test]
    fn aligned_input_gets_a_full_padding_block() {
        let padded = pkcs7_pad(&[0u8; AES_BLOCK_SIZE]);
        assert_eq!(padded.len(), 2 * AES_BLOCK_SIZE);
        assert!(padded[AES_BLOCK_SIZE..].iter().all(|&b| b == 16));
    }

    #[test]
    fn corrupt_padding_is_rejected() {
        let mut padded = pkcs7_pad(b"hello");
        let last = padded.len() - 2;
        padded[last] ^= 1;
        assert!(pkcs7_unpad(padded).is_err());
        assert!(pkcs7_unpad(vec![0u8; 16]).is_err());
        assert!(pkcs7_unpad(vec![1u8; 15]).is_err());
        assert!(pkcs7_unpad(Vec::new()).is_err());
    }

    #[test]
    #[serial]
    #[traced_test]
    fn tpm_cbc_round_trip_across_chunks() {
        let mut engine = TpmEngine::new(test_tcti()).unwrap();
        engine
            .generate_key("k", &KeyParameters::default())
            .unwrap();

        let iv = engine.random_iv().unwrap();
        let plaintext = vec![0x5au8; MaxBuffer::MAX_SIZE + 100];
        let ciphertext = engine.encrypt("k", &iv, &plaintext).unwrap();
        assert_ne!(ciphertext[..plaintext.len()], plaintext[..]);

        let decrypted = engine.decrypt("k", &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    #[serial]
    #[traced_test]
    fn deleted_tpm_key_is_gone() {
        let mut engine = TpmEngine::new(test_tcti()).unwrap();
        engine
            .generate_key("k", &KeyParameters::default())
            .unwrap();
        engine.delete_key("k");
        assert!(matches!(
            engine.encrypt("k", &[0u8; IV_LEN], b"x"),
            Err(Error::KeyNotFound { .. })
        ));
    }
}
