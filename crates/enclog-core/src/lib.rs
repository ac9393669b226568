//! Encrypted append-only status log backed by a secure element. Every record is
//! encrypted inside the element under a key that never leaves it, with a fresh hardware
//! nonce per record, and appended as a fixed-size `nonce ‖ ciphertext` block.

pub mod cipher;
pub mod command;
pub mod config;
pub mod element;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod log_store;
pub mod record;
pub mod soft;
pub mod storage;

pub use cipher::{RecordCipher, pad_block};
pub use command::{
    CipherMode, CommandOutput, CommandResult, DEFAULT_KEY_SLOT, HsmCommand, KeySlot, KeyUsage,
    ObjectId, StatusCode, SymmetricAlgorithm,
};
pub use config::{EnclogConfig, HsmConfig, StorageConfig};
pub use element::{CompletionHandle, SecureElement};
pub use error::{CipherError, EnclogError, EnclogResult, HsmError, IoError, KeyError};
pub use gateway::{CommandGateway, CommandStatus};
pub use keys::{KeyLifecycleManager, KeyProvisioning, KeyReadiness, SLOT_METADATA_DESCRIPTOR};
pub use log_store::{DUMP_CHUNK_LEN, HexChunk, HexDump, LogStore};
pub use record::{BLOCK_LEN, NONCE_LEN, RECORD_LEN, Record, SequenceCounter, StatusMessage};
pub use soft::{Fault, SoftSecureElement};
pub use storage::{BackendKind, FileBackend, MemoryBackend, StorageBackend, open_backend};

use std::{sync::Arc, time::Instant};

use tracing::info;

/// Outcome of a successful [`EncryptedLog::append_status`].
#[derive(Debug, Clone)]
pub struct AppendReport {
    pub seq: u32,
    pub message: StatusMessage,
    pub record: Record,
}

/// Storage, element connection and key slot wired together for one process.
pub struct EncryptedLog {
    gateway: Arc<CommandGateway>,
    keys: KeyLifecycleManager,
    provisioning: KeyProvisioning,
    cipher: RecordCipher,
    store: LogStore,
    sequence: SequenceCounter,
    started: Instant,
}

impl EncryptedLog {
    /// Mounts storage, then makes the configured key slot ready. Either failing is fatal.
    pub fn boot(config: &EnclogConfig, element: Arc<dyn SecureElement>) -> EnclogResult<Self> {
        config.validate()?;
        let backend = open_backend(&config.storage)?;
        Self::boot_with_backend(config, element, backend)
    }

    /// As [`EncryptedLog::boot`], over an already mounted backend.
    pub fn boot_with_backend(
        config: &EnclogConfig,
        element: Arc<dyn SecureElement>,
        backend: Arc<dyn StorageBackend>,
    ) -> EnclogResult<Self> {
        let started = Instant::now();
        config.validate()?;
        let store = LogStore::with_record_len(backend, config.record_size);

        let gateway = Arc::new(CommandGateway::new(
            element,
            config.hsm.completion_timeout(),
        ));
        let slot = config.key_slot();
        let keys = KeyLifecycleManager::new(Arc::clone(&gateway), slot);
        let provisioning = keys.ensure_key_ready(config.force_regenerate)?;
        let cipher =
            RecordCipher::with_block_len(Arc::clone(&gateway), slot, config.plaintext_max_len);

        info!(
            element = gateway.element_id(),
            %slot,
            location = %store.location(),
            ?provisioning,
            "encrypted log ready"
        );
        Ok(Self {
            gateway,
            keys,
            provisioning,
            cipher,
            store,
            sequence: SequenceCounter::new(),
            started,
        })
    }

    /// Encrypts and appends the next status line. The sequence number is consumed even
    /// when the append fails.
    pub fn append_status(&self) -> EnclogResult<AppendReport> {
        let seq = self.sequence.next();
        let message = StatusMessage {
            seq,
            uptime_ms: self.uptime_ms(),
        };
        let record = self.append_message(&message.encode()?)?;
        info!(seq, "status record appended");
        Ok(AppendReport {
            seq,
            message,
            record,
        })
    }

    /// Encrypts and appends arbitrary bytes, at most `plaintext_max_len` long.
    pub fn append_message(&self, plaintext: &[u8]) -> EnclogResult<Record> {
        let record = self.cipher.encrypt_message(plaintext)?;
        self.store.append(&record)?;
        Ok(record)
    }

    pub fn clear(&self) -> EnclogResult<()> {
        Ok(self.store.clear()?)
    }

    pub fn dump_hex(&self) -> EnclogResult<HexDump> {
        Ok(self.store.dump_hex()?)
    }

    pub fn records(&self) -> EnclogResult<Vec<Record>> {
        Ok(self.store.records()?)
    }

    pub fn record_count(&self) -> EnclogResult<u64> {
        Ok(self.store.record_count()?)
    }

    pub fn keys(&self) -> &KeyLifecycleManager {
        &self.keys
    }

    /// How the key slot was made ready at boot.
    pub fn provisioning(&self) -> KeyProvisioning {
        self.provisioning
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn last_seq(&self) -> u32 {
        self.sequence.current()
    }

    fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
