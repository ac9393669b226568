use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    command::{DEFAULT_KEY_SLOT, KeySlot, ObjectId},
    error::{EnclogError, EnclogResult},
    record::{BLOCK_LEN, NONCE_LEN, RECORD_LEN},
    storage::BackendKind,
};

const AES_BLOCK: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnclogConfig {
    pub key_slot: ObjectId,
    /// Overwrite the slot key on boot even when it is already provisioned.
    pub force_regenerate: bool,
    pub plaintext_max_len: usize,
    pub record_size: usize,
    pub storage: StorageConfig,
    pub hsm: HsmConfig,
}

impl Default for EnclogConfig {
    fn default() -> Self {
        Self {
            key_slot: DEFAULT_KEY_SLOT,
            force_regenerate: false,
            plaintext_max_len: BLOCK_LEN,
            record_size: RECORD_LEN,
            storage: StorageConfig::default(),
            hsm: HsmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Falls back to the backend's default mount point.
    pub mount_point: Option<PathBuf>,
    pub file_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mount_point: None,
            file_name: "enc_log.bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HsmConfig {
    /// `None` waits for completions indefinitely.
    pub completion_timeout_ms: Option<u64>,
    /// Persist the software element's slots here; volatile when unset.
    pub state_file: Option<PathBuf>,
    pub latency_ms: u64,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: Some(5_000),
            state_file: None,
            latency_ms: 0,
        }
    }
}

impl HsmConfig {
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl EnclogConfig {
    /// Loads YAML, or JSON when the file extension is `.json`, and validates the result.
    pub fn from_path<P: AsRef<Path>>(path: P) -> EnclogResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| EnclogError::config(format!("{}: {err}", path.display())))?;
        let config: Self = if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
        {
            serde_json::from_str(&contents).map_err(EnclogError::config)?
        } else {
            serde_yaml::from_str(&contents).map_err(EnclogError::config)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EnclogResult<()> {
        if self.plaintext_max_len == 0 || self.plaintext_max_len % AES_BLOCK != 0 {
            return Err(EnclogError::config(format!(
                "plaintext_max_len must be a non-zero multiple of {AES_BLOCK}, got {}",
                self.plaintext_max_len
            )));
        }
        if self.record_size != NONCE_LEN + self.plaintext_max_len {
            return Err(EnclogError::config(format!(
                "record_size must equal {NONCE_LEN} + plaintext_max_len ({}), got {}",
                NONCE_LEN + self.plaintext_max_len,
                self.record_size
            )));
        }
        if self.storage.file_name.is_empty() {
            return Err(EnclogError::config("storage.file_name must not be empty"));
        }
        if self.hsm.completion_timeout_ms == Some(0) {
            return Err(EnclogError::config(
                "hsm.completion_timeout_ms must be positive; omit it to wait indefinitely",
            ));
        }
        Ok(())
    }

    pub fn key_slot(&self) -> KeySlot {
        KeySlot::aes128_encryption(self.key_slot)
    }
}
