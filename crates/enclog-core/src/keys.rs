//! Brings the log encryption key slot into a usable state once per boot.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{command::KeySlot, error::KeyError, gateway::CommandGateway};

/// Access-control descriptor written before key generation: declares the slot as an
/// internally generated AES key usable for encryption.
pub const SLOT_METADATA_DESCRIPTOR: [u8; 8] = [0x20, 0x06, 0xD0, 0x01, 0x00, 0xD3, 0x01, 0x00];

/// Slot state as last observed through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyReadiness {
    Unknown,
    NotProvisioned,
    MetadataWritten,
    KeyGenerated,
    Ready,
}

/// How `ensure_key_ready` reached [`KeyReadiness::Ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProvisioning {
    /// Slot metadata was present; the existing key is used as-is.
    Reused,
    /// Metadata was (re)written and a fresh key generated inside the element.
    Generated,
}

pub struct KeyLifecycleManager {
    gateway: Arc<CommandGateway>,
    slot: KeySlot,
    readiness: Mutex<KeyReadiness>,
}

impl KeyLifecycleManager {
    pub fn new(gateway: Arc<CommandGateway>, slot: KeySlot) -> Self {
        Self {
            gateway,
            slot,
            readiness: Mutex::new(KeyReadiness::Unknown),
        }
    }

    pub fn slot(&self) -> KeySlot {
        self.slot
    }

    pub fn readiness(&self) -> KeyReadiness {
        *self.readiness.lock()
    }

    /// Reuses the slot's key when its metadata is present, otherwise provisions it.
    /// `force_regenerate` skips the check and overwrites whatever the slot holds.
    pub fn ensure_key_ready(&self, force_regenerate: bool) -> Result<KeyProvisioning, KeyError> {
        if force_regenerate {
            warn!(slot = %self.slot, "forced key regeneration; existing key will be overwritten");
        } else if self.slot_has_metadata() {
            info!(slot = %self.slot, "using existing key");
            self.transition(KeyReadiness::Ready);
            return Ok(KeyProvisioning::Reused);
        } else {
            info!(slot = %self.slot, "key slot not provisioned; initializing");
        }
        self.transition(KeyReadiness::NotProvisioned);
        self.provision()?;
        Ok(KeyProvisioning::Generated)
    }

    fn slot_has_metadata(&self) -> bool {
        match self.gateway.read_metadata(self.slot.id) {
            Ok(metadata) if metadata.is_empty() => false,
            Ok(metadata) => {
                info!(slot = %self.slot, len = metadata.len(), "key metadata present");
                true
            }
            Err(err) => {
                warn!(slot = %self.slot, error = %err, "key metadata unreadable");
                false
            }
        }
    }

    fn provision(&self) -> Result<(), KeyError> {
        info!(slot = %self.slot, "writing key slot metadata");
        self.gateway
            .write_metadata(self.slot.id, &SLOT_METADATA_DESCRIPTOR)
            .map_err(|source| self.failed("metadata write", source))?;
        self.transition(KeyReadiness::MetadataWritten);

        info!(slot = %self.slot, algorithm = ?self.slot.algorithm, "generating key in secure element");
        self.gateway
            .generate_symmetric_key(&self.slot)
            .map_err(|source| self.failed("key generation", source))?;
        self.transition(KeyReadiness::KeyGenerated);

        info!(slot = %self.slot, "key generated");
        self.transition(KeyReadiness::Ready);
        Ok(())
    }

    fn failed(&self, stage: &'static str, source: crate::error::HsmError) -> KeyError {
        KeyError::ProvisioningFailed {
            slot: self.slot,
            stage,
            source,
        }
    }

    fn transition(&self, next: KeyReadiness) {
        *self.readiness.lock() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{CommandOutput, HsmCommand, StatusCode},
        element::{CompletionHandle, SecureElement},
    };
    use std::time::Duration;

    /// Resolves inline, records every command and answers metadata reads from a fixture.
    struct RecordingStub {
        metadata: Result<Vec<u8>, StatusCode>,
        fail_on: Option<&'static str>,
        log: Mutex<Vec<&'static str>>,
    }

    impl RecordingStub {
        fn with_metadata(metadata: Result<Vec<u8>, StatusCode>) -> Arc<Self> {
            Arc::new(Self {
                metadata,
                fail_on: None,
                log: Mutex::new(Vec::new()),
            })
        }

        fn failing(fail_on: &'static str) -> Arc<Self> {
            Arc::new(Self {
                metadata: Ok(Vec::new()),
                fail_on: Some(fail_on),
                log: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.log.lock().clone()
        }
    }

    impl SecureElement for RecordingStub {
        fn id(&self) -> &'static str {
            "recording-stub"
        }

        fn submit(
            &self,
            command: HsmCommand,
            completion: CompletionHandle,
        ) -> Result<(), StatusCode> {
            let name = command.name();
            self.log.lock().push(name);
            if self.fail_on == Some(name) {
                completion.complete(Err(StatusCode::ACCESS_CONDITION));
                return Ok(());
            }
            let reply = match command {
                HsmCommand::ReadMetadata { .. } => {
                    self.metadata.clone().map(CommandOutput::Metadata)
                }
                _ => Ok(CommandOutput::Done),
            };
            completion.complete(reply);
            Ok(())
        }
    }

    fn manager(stub: &Arc<RecordingStub>) -> KeyLifecycleManager {
        let element: Arc<dyn SecureElement> = stub.clone();
        let gateway = Arc::new(CommandGateway::new(element, Some(Duration::from_secs(1))));
        KeyLifecycleManager::new(gateway, KeySlot::default())
    }

    #[test]
    fn ready_slot_is_reused_with_a_single_read() {
        let stub = RecordingStub::with_metadata(Ok(SLOT_METADATA_DESCRIPTOR.to_vec()));
        let keys = manager(&stub);
        assert_eq!(keys.readiness(), KeyReadiness::Unknown);
        let outcome = keys.ensure_key_ready(false).expect("ready");
        assert_eq!(outcome, KeyProvisioning::Reused);
        assert_eq!(keys.readiness(), KeyReadiness::Ready);
        assert_eq!(stub.calls(), vec!["read_metadata"]);
    }

    #[test]
    fn forced_regeneration_always_provisions() {
        let stub = RecordingStub::with_metadata(Ok(SLOT_METADATA_DESCRIPTOR.to_vec()));
        let keys = manager(&stub);
        let outcome = keys.ensure_key_ready(true).expect("ready");
        assert_eq!(outcome, KeyProvisioning::Generated);
        assert_eq!(
            stub.calls(),
            vec!["write_metadata", "generate_symmetric_key"]
        );
    }

    #[test]
    fn empty_metadata_counts_as_not_provisioned() {
        let stub = RecordingStub::with_metadata(Ok(Vec::new()));
        let keys = manager(&stub);
        let outcome = keys.ensure_key_ready(false).unwrap();
        assert_eq!(outcome, KeyProvisioning::Generated);
        assert_eq!(
            stub.calls(),
            vec!["read_metadata", "write_metadata", "generate_symmetric_key"]
        );
    }

    #[test]
    fn unreadable_metadata_triggers_provisioning() {
        let stub = RecordingStub::with_metadata(Err(StatusCode::DEVICE_ERROR));
        let keys = manager(&stub);
        let outcome = keys.ensure_key_ready(false).unwrap();
        assert_eq!(outcome, KeyProvisioning::Generated);
        assert_eq!(keys.readiness(), KeyReadiness::Ready);
    }

    #[test]
    fn metadata_write_failure_aborts_before_key_generation() {
        let stub = RecordingStub::failing("write_metadata");
        let keys = manager(&stub);
        let err = keys.ensure_key_ready(false).unwrap_err();
        let KeyError::ProvisioningFailed { stage, .. } = err;
        assert_eq!(stage, "metadata write");
        assert_eq!(stub.calls(), vec!["read_metadata", "write_metadata"]);
        assert_eq!(keys.readiness(), KeyReadiness::NotProvisioned);
    }

    #[test]
    fn key_generation_failure_is_reported() {
        let stub = RecordingStub::failing("generate_symmetric_key");
        let keys = manager(&stub);
        let err = keys.ensure_key_ready(true).unwrap_err();
        assert!(err.to_string().contains("key generation"));
        assert_eq!(keys.readiness(), KeyReadiness::MetadataWritten);
    }
}
