use serde::{Deserialize, Serialize};

use crate::auth::PromptConfig;
use crate::keystore::KeyParameters;

pub const DEFAULT_KEY_ALIAS: &str = "biometric_secure_key";
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

/// Everything a [`SecretWorkflow`](crate::SecretWorkflow) needs to know up front.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    pub key_alias: String,
    pub key: KeyParameters,
    pub prompt: PromptConfig,
    /// Unrecognized touches tolerated per challenge.
    pub max_failed_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            key_alias: DEFAULT_KEY_ALIAS.into(),
            key: KeyParameters::default(),
            prompt: PromptConfig::default(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}
