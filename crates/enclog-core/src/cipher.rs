//! Turns a plaintext message into a `nonce ‖ ciphertext` record via the secure element.

use std::sync::Arc;

use tracing::debug;

use crate::{
    command::{CipherMode, KeySlot},
    error::CipherError,
    gateway::CommandGateway,
    record::{BLOCK_LEN, NONCE_LEN, Record},
};

pub struct RecordCipher {
    gateway: Arc<CommandGateway>,
    slot: KeySlot,
    block_len: usize,
}

impl RecordCipher {
    pub fn new(gateway: Arc<CommandGateway>, slot: KeySlot) -> Self {
        Self::with_block_len(gateway, slot, BLOCK_LEN)
    }

    /// `block_len` must be a non-zero multiple of the AES block size; configuration
    /// validation enforces this before a cipher is built.
    pub fn with_block_len(gateway: Arc<CommandGateway>, slot: KeySlot, block_len: usize) -> Self {
        Self {
            gateway,
            slot,
            block_len,
        }
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn record_len(&self) -> usize {
        NONCE_LEN + self.block_len
    }

    /// Encrypts `plaintext` under a freshly drawn hardware nonce. The slot key must
    /// already be ready.
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Record, CipherError> {
        let block = pad_block(plaintext, self.block_len)?;

        let nonce_bytes = self
            .gateway
            .generate_random(NONCE_LEN)
            .map_err(CipherError::NonceGenerationFailed)?;
        let nonce: [u8; NONCE_LEN] =
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CipherError::UnexpectedOutputLength {
                    what: "nonce",
                    expected: NONCE_LEN,
                    actual: nonce_bytes.len(),
                })?;

        let ciphertext = self
            .gateway
            .encrypt(&self.slot, CipherMode::Cbc, &block, &nonce)
            .map_err(CipherError::EncryptionFailed)?;
        if ciphertext.len() != self.block_len {
            return Err(CipherError::UnexpectedOutputLength {
                what: "ciphertext",
                expected: self.block_len,
                actual: ciphertext.len(),
            });
        }

        debug!(slot = %self.slot, plaintext_len = plaintext.len(), "record encrypted");
        Ok(Record::new(nonce, ciphertext))
    }
}

/// Zero-pads `plaintext` to exactly `block_len` bytes. The original length is not kept.
pub fn pad_block(plaintext: &[u8], block_len: usize) -> Result<Vec<u8>, CipherError> {
    if plaintext.len() > block_len {
        return Err(CipherError::PlaintextTooLong {
            len: plaintext.len(),
            max: block_len,
        });
    }
    let mut block = vec![0u8; block_len];
    block[..plaintext.len()].copy_from_slice(plaintext);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_with_trailing_zeros() {
        let block = pad_block(b"hello", 16).expect("fits");
        assert_eq!(&block[..5], b"hello");
        assert!(block[5..].iter().all(|b| *b == 0));
        assert_eq!(block.len(), 16);
    }

    #[test]
    fn exact_fit_is_not_padded() {
        let block = pad_block(&[1u8; 64], 64).expect("fits");
        assert_eq!(block, vec![1u8; 64]);
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let err = pad_block(&[0u8; 65], 64).unwrap_err();
        assert!(matches!(
            err,
            CipherError::PlaintextTooLong { len: 65, max: 64 }
        ));
    }
}
