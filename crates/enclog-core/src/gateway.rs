//! Synchronous front for the secure element's asynchronous command channel.
//!
//! Each submission gets its own completion slot, created in [`CommandStatus::Pending`]
//! immediately before the command is handed to the element. The element's completion
//! notification is the only writer of that slot. Callers block on a condition variable
//! until the slot resolves or the configured timeout elapses.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{
    command::{CipherMode, CommandOutput, CommandResult, HsmCommand, KeySlot, ObjectId},
    element::{CompletionHandle, SecureElement},
    error::HsmError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Succeeded,
    Failed,
}

struct SlotState {
    status: CommandStatus,
    outcome: Option<CommandResult>,
}

pub(crate) struct CompletionSlot {
    state: Mutex<SlotState>,
    resolved: Condvar,
}

impl CompletionSlot {
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                status: CommandStatus::Pending,
                outcome: None,
            }),
            resolved: Condvar::new(),
        })
    }

    /// Returns false if the slot had already been resolved.
    pub(crate) fn resolve(&self, outcome: CommandResult) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != CommandStatus::Pending {
                return false;
            }
            state.status = if outcome.is_ok() {
                CommandStatus::Succeeded
            } else {
                CommandStatus::Failed
            };
            state.outcome = Some(outcome);
        }
        self.resolved.notify_all();
        true
    }

    pub(crate) fn status(&self) -> CommandStatus {
        self.state.lock().status
    }

    /// Blocks until resolved. `None` means the timeout elapsed first.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<CommandResult> {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while state.status == CommandStatus::Pending {
                    self.resolved.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.status == CommandStatus::Pending {
                    if self.resolved.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        if state.status == CommandStatus::Pending {
            None
        } else {
            state.outcome.take()
        }
    }
}

/// Serialises commands to one secure element and presents them as blocking calls.
pub struct CommandGateway {
    element: Arc<dyn SecureElement>,
    in_flight: Mutex<()>,
    last_status: Mutex<Option<CommandStatus>>,
    timeout: Option<Duration>,
    issued: AtomicU64,
}

impl CommandGateway {
    /// `timeout` bounds every wait; `None` waits for as long as the element takes.
    pub fn new(element: Arc<dyn SecureElement>, timeout: Option<Duration>) -> Self {
        Self {
            element,
            in_flight: Mutex::new(()),
            last_status: Mutex::new(None),
            timeout,
            issued: AtomicU64::new(0),
        }
    }

    pub fn element_id(&self) -> &'static str {
        self.element.id()
    }

    /// Status of the most recent command, `None` before the first submission.
    pub fn status(&self) -> Option<CommandStatus> {
        *self.last_status.lock()
    }

    pub fn commands_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn submit_and_wait(&self, command: HsmCommand) -> Result<CommandOutput, HsmError> {
        let _flight = self.in_flight.lock();
        let name = command.name();
        let seq = self.issued.fetch_add(1, Ordering::Relaxed) + 1;

        let slot = CompletionSlot::pending();
        *self.last_status.lock() = Some(CommandStatus::Pending);
        debug!(command = name, seq, "submitting command");

        if let Err(code) = self
            .element
            .submit(command, CompletionHandle::new(Arc::clone(&slot)))
        {
            *self.last_status.lock() = Some(CommandStatus::Failed);
            warn!(command = name, seq, %code, "command rejected at submission");
            return Err(HsmError::SubmissionFailed {
                command: name,
                code,
            });
        }

        let outcome = slot.wait(self.timeout);
        *self.last_status.lock() = Some(slot.status());
        match outcome {
            Some(Ok(output)) => {
                debug!(command = name, seq, "command succeeded");
                Ok(output)
            }
            Some(Err(code)) => {
                warn!(command = name, seq, %code, "command failed");
                Err(HsmError::CompletionFailed {
                    command: name,
                    code,
                })
            }
            None => {
                let timeout = self.timeout.unwrap_or_default();
                warn!(command = name, seq, ?timeout, "command timed out; abandoning");
                Err(HsmError::Timeout {
                    command: name,
                    timeout,
                })
            }
        }
    }

    pub fn generate_random(&self, len: usize) -> Result<Vec<u8>, HsmError> {
        match self.submit_and_wait(HsmCommand::GenerateRandom { len })? {
            CommandOutput::Random(bytes) => Ok(bytes),
            _ => Err(HsmError::UnexpectedResponse {
                command: "generate_random",
            }),
        }
    }

    pub fn read_metadata(&self, slot: ObjectId) -> Result<Vec<u8>, HsmError> {
        match self.submit_and_wait(HsmCommand::ReadMetadata { slot })? {
            CommandOutput::Metadata(bytes) => Ok(bytes),
            _ => Err(HsmError::UnexpectedResponse {
                command: "read_metadata",
            }),
        }
    }

    pub fn write_metadata(&self, slot: ObjectId, metadata: &[u8]) -> Result<(), HsmError> {
        self.submit_and_wait(HsmCommand::WriteMetadata {
            slot,
            metadata: metadata.to_vec(),
        })
        .map(|_| ())
    }

    pub fn generate_symmetric_key(&self, slot: &KeySlot) -> Result<(), HsmError> {
        self.submit_and_wait(HsmCommand::GenerateSymmetricKey {
            slot: slot.id,
            algorithm: slot.algorithm,
            usage: slot.usage,
        })
        .map(|_| ())
    }

    pub fn encrypt(
        &self,
        slot: &KeySlot,
        mode: CipherMode,
        plaintext: &[u8],
        iv: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        let command = HsmCommand::Encrypt {
            slot: slot.id,
            mode,
            plaintext: plaintext.to_vec(),
            iv: iv.to_vec(),
        };
        match self.submit_and_wait(command)? {
            CommandOutput::Ciphertext(bytes) => Ok(bytes),
            _ => Err(HsmError::UnexpectedResponse { command: "encrypt" }),
        }
    }
}
