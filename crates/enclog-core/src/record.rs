use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

/// Bytes of hardware-drawn nonce leading every record; doubles as the CBC IV.
pub const NONCE_LEN: usize = 16;
/// Fixed plaintext/ciphertext block capacity.
pub const BLOCK_LEN: usize = 64;
/// `nonce ‖ ciphertext`.
pub const RECORD_LEN: usize = NONCE_LEN + BLOCK_LEN;

/// One encrypted log entry. Immutable once produced.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl Record {
    pub fn new(nonce: [u8; NONCE_LEN], ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Splits a serialized record. Returns `None` when there is no ciphertext after
    /// the nonce.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        Some(Self {
            nonce: nonce.try_into().ok()?,
            ciphertext: ciphertext.to_vec(),
        })
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Size of the serialized record in bytes.
    pub fn encoded_len(&self) -> usize {
        NONCE_LEN + self.ciphertext.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("nonce", &hex::encode(self.nonce))
            .field("ciphertext", &hex::encode(&self.ciphertext))
            .finish()
    }
}

/// Cosmetic per-process counter embedded in status messages. Not a record index.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the counter and returns the new value (first call yields 1).
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Application status line that gets encrypted into each record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusMessage {
    pub seq: u32,
    pub uptime_ms: u64,
}

impl StatusMessage {
    /// Compact JSON, e.g. `{"seq":1,"uptime_ms":57196}`.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
