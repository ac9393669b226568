use std::time::Duration;

use thiserror::Error;

use crate::command::{KeySlot, StatusCode};

pub type EnclogResult<T> = Result<T, EnclogError>;

/// Failures on the element command channel.
#[derive(Debug, Error)]
pub enum HsmError {
    #[error("{command} rejected at submission (status {code})")]
    SubmissionFailed {
        command: &'static str,
        code: StatusCode,
    },
    #[error("{command} failed inside the secure element (status {code})")]
    CompletionFailed {
        command: &'static str,
        code: StatusCode,
    },
    #[error("{command} did not complete within {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("{command} resolved with an unexpected response")]
    UnexpectedResponse { command: &'static str },
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("provisioning key slot {slot} failed during {stage}: {source}")]
    ProvisioningFailed {
        slot: KeySlot,
        stage: &'static str,
        #[source]
        source: HsmError,
    },
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("plaintext of {len} bytes exceeds block capacity of {max} bytes")]
    PlaintextTooLong { len: usize, max: usize },
    #[error("nonce generation failed: {0}")]
    NonceGenerationFailed(#[source] HsmError),
    #[error("encryption failed: {0}")]
    EncryptionFailed(#[source] HsmError),
    #[error("unexpected {what} length: expected {expected}, got {actual}")]
    UnexpectedOutputLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to open {target}: {source}")]
    OpenFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {target}: {source}")]
    WriteFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {target}: {source}")]
    ReadFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("record of {actual} bytes does not match record size {expected}")]
    RecordSizeMismatch { expected: usize, actual: usize },
}

impl IoError {
    pub(crate) fn open(target: impl Into<String>, source: std::io::Error) -> Self {
        Self::OpenFailed {
            target: target.into(),
            source,
        }
    }

    pub(crate) fn write(target: impl Into<String>, source: std::io::Error) -> Self {
        Self::WriteFailed {
            target: target.into(),
            source,
        }
    }

    pub(crate) fn read(target: impl Into<String>, source: std::io::Error) -> Self {
        Self::ReadFailed {
            target: target.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnclogError {
    #[error(transparent)]
    Hsm(#[from] HsmError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("failed to encode status message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("secure element error: {0}")]
    Element(String),
}

impl EnclogError {
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
    pub fn element<E: std::fmt::Display>(err: E) -> Self {
        Self::Element(err.to_string())
    }
}
