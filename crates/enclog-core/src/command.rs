use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric object identifier addressing a data or key object inside the secure element.
pub type ObjectId = u16;

/// Key object used for log encryption unless configured otherwise.
pub const DEFAULT_KEY_SLOT: ObjectId = 0xE200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SymmetricAlgorithm {
    Aes128,
}

impl SymmetricAlgorithm {
    pub fn key_len(&self) -> usize {
        match self {
            SymmetricAlgorithm::Aes128 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    Encryption,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CipherMode {
    /// Block chaining with the caller-supplied IV and no padding.
    Cbc,
}

/// A named key location inside the element together with its declared class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySlot {
    pub id: ObjectId,
    pub algorithm: SymmetricAlgorithm,
    pub usage: KeyUsage,
}

impl KeySlot {
    pub const fn aes128_encryption(id: ObjectId) -> Self {
        Self {
            id,
            algorithm: SymmetricAlgorithm::Aes128,
            usage: KeyUsage::Encryption,
        }
    }
}

impl Default for KeySlot {
    fn default() -> Self {
        Self::aes128_encryption(DEFAULT_KEY_SLOT)
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.id)
    }
}

/// Raw 16-bit status reported by the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0x0000);
    pub const BUSY: StatusCode = StatusCode(0x0001);
    pub const DEVICE_ERROR: StatusCode = StatusCode(0x8001);
    pub const INVALID_INPUT: StatusCode = StatusCode(0x8002);
    pub const ACCESS_CONDITION: StatusCode = StatusCode(0x8003);
    pub const KEY_NOT_FOUND: StatusCode = StatusCode(0x8004);
    /// The element released a completion handle without resolving it.
    pub const ABANDONED: StatusCode = StatusCode(0x80FF);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// One command on the element's asynchronous command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsmCommand {
    GenerateRandom {
        len: usize,
    },
    ReadMetadata {
        slot: ObjectId,
    },
    WriteMetadata {
        slot: ObjectId,
        metadata: Vec<u8>,
    },
    GenerateSymmetricKey {
        slot: ObjectId,
        algorithm: SymmetricAlgorithm,
        usage: KeyUsage,
    },
    Encrypt {
        slot: ObjectId,
        mode: CipherMode,
        plaintext: Vec<u8>,
        iv: Vec<u8>,
    },
}

impl HsmCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HsmCommand::GenerateRandom { .. } => "generate_random",
            HsmCommand::ReadMetadata { .. } => "read_metadata",
            HsmCommand::WriteMetadata { .. } => "write_metadata",
            HsmCommand::GenerateSymmetricKey { .. } => "generate_symmetric_key",
            HsmCommand::Encrypt { .. } => "encrypt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Random(Vec<u8>),
    Metadata(Vec<u8>),
    Ciphertext(Vec<u8>),
    Done,
}

/// Outcome delivered through a completion notification.
pub type CommandResult = Result<CommandOutput, StatusCode>;
