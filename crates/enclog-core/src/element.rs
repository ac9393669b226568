//! Boundary to the secure element's own execution context.

use std::{fmt, sync::Arc};

use crate::{
    command::{CommandResult, HsmCommand, StatusCode},
    gateway::CompletionSlot,
};

/// Opaque command interface of a secure element.
///
/// `submit` must not block on the command itself. The element resolves `completion`
/// later, from whatever context executes the command. Returning `Err` means the command
/// was never accepted and the completion will not be resolved.
pub trait SecureElement: Send + Sync {
    fn id(&self) -> &'static str;
    fn submit(&self, command: HsmCommand, completion: CompletionHandle) -> Result<(), StatusCode>;
}

/// One-shot notification for a single submitted command.
///
/// `complete` consumes the handle, so a command resolves at most once. Dropping an
/// unresolved handle resolves the command as failed with [`StatusCode::ABANDONED`].
pub struct CompletionHandle {
    slot: Option<Arc<CompletionSlot>>,
}

impl CompletionHandle {
    pub(crate) fn new(slot: Arc<CompletionSlot>) -> Self {
        Self { slot: Some(slot) }
    }

    pub fn complete(mut self, outcome: CommandResult) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(outcome);
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Err(StatusCode::ABANDONED));
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("armed", &self.slot.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::CommandOutput, gateway::CommandStatus};

    #[test]
    fn complete_resolves_slot_once() {
        let slot = CompletionSlot::pending();
        let handle = CompletionHandle::new(Arc::clone(&slot));
        handle.complete(Ok(CommandOutput::Done));
        assert_eq!(slot.status(), CommandStatus::Succeeded);
        assert_eq!(slot.wait(None), Some(Ok(CommandOutput::Done)));
    }

    #[test]
    fn dropped_handle_fails_the_command() {
        let slot = CompletionSlot::pending();
        drop(CompletionHandle::new(Arc::clone(&slot)));
        assert_eq!(slot.status(), CommandStatus::Failed);
        assert_eq!(slot.wait(None), Some(Err(StatusCode::ABANDONED)));
    }
}
