//! Software stand-in for the secure element.
//!
//! Commands are accepted on the caller's thread and executed on a dedicated worker
//! thread, which resolves each completion handle the way device firmware would. Key
//! material stays inside the engine; only ciphertext, random bytes and metadata leave.

use std::{
    collections::{HashMap, VecDeque},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::{
    command::{CipherMode, CommandOutput, CommandResult, HsmCommand, ObjectId, StatusCode},
    config::HsmConfig,
    element::{CompletionHandle, SecureElement},
    error::{EnclogError, EnclogResult},
    keys::SLOT_METADATA_DESCRIPTOR,
};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const AES_BLOCK: usize = 16;
const RANDOM_MIN: usize = 8;
const RANDOM_MAX: usize = 256;
const METADATA_MAX: usize = 44;

/// Misbehaviour to apply to the next accepted command, in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the command at submission with the given status.
    RejectSubmission(StatusCode),
    /// Accept the command, skip it, and resolve it as failed.
    FailCompletion(StatusCode),
    /// Accept the command and never resolve it.
    Stall,
    /// Execute the command but drop the last byte of its output.
    ShortOutput,
}

#[derive(Debug, Clone, Default)]
struct SlotEntry {
    metadata: Vec<u8>,
    key: Option<Vec<u8>>,
}

struct Engine {
    slots: HashMap<ObjectId, SlotEntry>,
    rng: Box<dyn RngCore + Send>,
    latency: Duration,
    state_file: Option<PathBuf>,
}

struct Job {
    command: HsmCommand,
    completion: CompletionHandle,
    fault: Option<Fault>,
}

pub struct SoftSecureElement {
    engine: Arc<Mutex<Engine>>,
    jobs: Mutex<Sender<Job>>,
    faults: Mutex<VecDeque<Fault>>,
    history: Mutex<Vec<&'static str>>,
    stalled: Arc<Mutex<Vec<CompletionHandle>>>,
}

impl SoftSecureElement {
    /// Volatile element with empty slots and OS randomness.
    pub fn new() -> EnclogResult<Self> {
        let engine = Arc::new(Mutex::new(Engine {
            slots: HashMap::new(),
            rng: Box::new(OsRng),
            latency: Duration::ZERO,
            state_file: None,
        }));
        let stalled = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<Job>();

        let worker_engine = Arc::clone(&engine);
        let worker_stalled = Arc::clone(&stalled);
        thread::Builder::new()
            .name("soft-secure-element".into())
            .spawn(move || {
                for job in rx {
                    run_job(&worker_engine, &worker_stalled, job);
                }
                debug!("software secure element worker stopped");
            })
            .map_err(EnclogError::element)?;

        Ok(Self {
            engine,
            jobs: Mutex::new(tx),
            faults: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            stalled,
        })
    }

    /// Element whose slots persist in `path`, so keys survive restarts. A state file
    /// whose digest does not match its content is refused.
    pub fn open<P: AsRef<Path>>(path: P) -> EnclogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let element = Self::new()?;
        {
            let mut engine = element.engine.lock();
            if path.exists() {
                engine.slots = load_state(&path)?;
                info!(path = %path.display(), slots = engine.slots.len(), "secure element state loaded");
            }
            engine.state_file = Some(path);
        }
        Ok(element)
    }

    /// Builds the element described by `config`: persistent when a state file is set.
    pub fn from_config(config: &HsmConfig) -> EnclogResult<Self> {
        let element = match &config.state_file {
            Some(path) => Self::open(path)?,
            None => Self::new()?,
        };
        Ok(element.with_latency(config.latency()))
    }

    pub fn with_rng<R: RngCore + Send + 'static>(self, rng: R) -> Self {
        self.engine.lock().rng = Box::new(rng);
        self
    }

    /// Simulated firmware processing time per command.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.engine.lock().latency = latency;
        self
    }

    /// Provisions `slot` with the standard descriptor and a known key. Test fixtures only;
    /// a real element never accepts plaintext keys this way.
    pub fn with_key(self, slot: ObjectId, key: [u8; 16]) -> Self {
        self.engine.lock().slots.insert(
            slot,
            SlotEntry {
                metadata: SLOT_METADATA_DESCRIPTOR.to_vec(),
                key: Some(key.to_vec()),
            },
        );
        self
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Names of accepted commands in submission order.
    pub fn history(&self) -> Vec<&'static str> {
        self.history.lock().clone()
    }

    /// Commands held back by [`Fault::Stall`] and still unresolved.
    pub fn stalled_count(&self) -> usize {
        self.stalled.lock().len()
    }

    pub fn has_key(&self, slot: ObjectId) -> bool {
        self.engine
            .lock()
            .slots
            .get(&slot)
            .is_some_and(|entry| entry.key.is_some())
    }

    pub fn metadata(&self, slot: ObjectId) -> Vec<u8> {
        self.engine
            .lock()
            .slots
            .get(&slot)
            .map(|entry| entry.metadata.clone())
            .unwrap_or_default()
    }

    fn check_parameters(command: &HsmCommand) -> Result<(), StatusCode> {
        match command {
            HsmCommand::GenerateRandom { len } if !(RANDOM_MIN..=RANDOM_MAX).contains(len) => {
                Err(StatusCode::INVALID_INPUT)
            }
            HsmCommand::WriteMetadata { metadata, .. }
                if metadata.is_empty() || metadata.len() > METADATA_MAX =>
            {
                Err(StatusCode::INVALID_INPUT)
            }
            _ => Ok(()),
        }
    }
}

impl SecureElement for SoftSecureElement {
    fn id(&self) -> &'static str {
        "soft-secure-element"
    }

    fn submit(&self, command: HsmCommand, completion: CompletionHandle) -> Result<(), StatusCode> {
        Self::check_parameters(&command)?;
        let fault = self.faults.lock().pop_front();
        if let Some(Fault::RejectSubmission(code)) = fault {
            return Err(code);
        }
        let name = command.name();
        self.jobs
            .lock()
            .send(Job {
                command,
                completion,
                fault,
            })
            .map_err(|_| StatusCode::DEVICE_ERROR)?;
        self.history.lock().push(name);
        Ok(())
    }
}

fn run_job(engine: &Mutex<Engine>, stalled: &Mutex<Vec<CompletionHandle>>, job: Job) {
    let Job {
        command,
        completion,
        fault,
    } = job;
    match fault {
        Some(Fault::Stall) => {
            stalled.lock().push(completion);
            return;
        }
        Some(Fault::FailCompletion(code)) => {
            completion.complete(Err(code));
            return;
        }
        _ => {}
    }

    let latency = engine.lock().latency;
    if !latency.is_zero() {
        thread::sleep(latency);
    }
    let mut outcome = engine.lock().execute(&command);
    if fault == Some(Fault::ShortOutput) {
        outcome = outcome.map(truncate_output);
    }
    completion.complete(outcome);
}

fn truncate_output(output: CommandOutput) -> CommandOutput {
    match output {
        CommandOutput::Random(mut bytes) => {
            bytes.pop();
            CommandOutput::Random(bytes)
        }
        CommandOutput::Metadata(mut bytes) => {
            bytes.pop();
            CommandOutput::Metadata(bytes)
        }
        CommandOutput::Ciphertext(mut bytes) => {
            bytes.pop();
            CommandOutput::Ciphertext(bytes)
        }
        CommandOutput::Done => CommandOutput::Done,
    }
}

impl Engine {
    fn execute(&mut self, command: &HsmCommand) -> CommandResult {
        match command {
            HsmCommand::GenerateRandom { len } => {
                let mut bytes = vec![0u8; *len];
                self.rng.fill_bytes(&mut bytes);
                Ok(CommandOutput::Random(bytes))
            }
            HsmCommand::ReadMetadata { slot } => Ok(CommandOutput::Metadata(
                self.slots
                    .get(slot)
                    .map(|entry| entry.metadata.clone())
                    .unwrap_or_default(),
            )),
            HsmCommand::WriteMetadata { slot, metadata } => {
                let mut entry = self.slots.get(slot).cloned().unwrap_or_default();
                entry.metadata = metadata.clone();
                self.commit(*slot, entry)?;
                Ok(CommandOutput::Done)
            }
            HsmCommand::GenerateSymmetricKey {
                slot, algorithm, ..
            } => {
                let mut entry = match self.slots.get(slot) {
                    Some(entry) if !entry.metadata.is_empty() => entry.clone(),
                    _ => return Err(StatusCode::ACCESS_CONDITION),
                };
                let mut key = vec![0u8; algorithm.key_len()];
                self.rng.fill_bytes(&mut key);
                entry.key = Some(key);
                self.commit(*slot, entry)?;
                Ok(CommandOutput::Done)
            }
            HsmCommand::Encrypt {
                slot,
                mode: CipherMode::Cbc,
                plaintext,
                iv,
            } => {
                let key = self
                    .slots
                    .get(slot)
                    .and_then(|entry| entry.key.as_deref())
                    .ok_or(StatusCode::KEY_NOT_FOUND)?;
                if plaintext.is_empty() || plaintext.len() % AES_BLOCK != 0 || iv.len() != AES_BLOCK
                {
                    return Err(StatusCode::INVALID_INPUT);
                }
                encrypt_cbc(key, iv, plaintext).map(CommandOutput::Ciphertext)
            }
        }
    }

    /// Installs `entry` only once it is durable; a failed save leaves the slot untouched.
    fn commit(&mut self, slot: ObjectId, entry: SlotEntry) -> Result<(), StatusCode> {
        if let Some(path) = &self.state_file {
            let mut staged = self.slots.clone();
            staged.insert(slot, entry.clone());
            save_state(path, &staged).map_err(|err| {
                error!(path = %path.display(), error = %err, "failed to persist secure element state");
                StatusCode::DEVICE_ERROR
            })?;
        }
        self.slots.insert(slot, entry);
        Ok(())
    }
}

fn encrypt_cbc(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, StatusCode> {
    let encryptor =
        Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| StatusCode::INVALID_INPUT)?;
    let mut buf = plaintext.to_vec();
    let len = buf.len();
    encryptor
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| StatusCode::INVALID_INPUT)?;
    Ok(buf)
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSlot {
    id: ObjectId,
    metadata: String,
    key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    slots: Vec<PersistedSlot>,
    digest: String,
}

fn slots_digest(slots: &[PersistedSlot]) -> EnclogResult<String> {
    let payload = serde_json::to_vec(slots).map_err(EnclogError::element)?;
    Ok(hex::encode(Sha256::digest(payload)))
}

fn save_state(path: &Path, slots: &HashMap<ObjectId, SlotEntry>) -> EnclogResult<()> {
    let mut persisted: Vec<PersistedSlot> = slots
        .iter()
        .map(|(id, entry)| PersistedSlot {
            id: *id,
            metadata: hex::encode(&entry.metadata),
            key: entry.key.as_ref().map(hex::encode),
        })
        .collect();
    persisted.sort_by_key(|slot| slot.id);
    let digest = slots_digest(&persisted)?;
    let state = PersistedState {
        slots: persisted,
        digest,
    };

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(EnclogError::element)?;
    }
    let tmp = path.with_extension("tmp");
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&tmp).map_err(EnclogError::element)?;
    serde_json::to_writer_pretty(&mut file, &state).map_err(EnclogError::element)?;
    file.flush().map_err(EnclogError::element)?;
    file.sync_all().map_err(EnclogError::element)?;
    fs::rename(&tmp, path).map_err(EnclogError::element)?;
    Ok(())
}

fn load_state(path: &Path) -> EnclogResult<HashMap<ObjectId, SlotEntry>> {
    let contents = fs::read(path).map_err(EnclogError::element)?;
    let state: PersistedState = serde_json::from_slice(&contents).map_err(EnclogError::element)?;
    if slots_digest(&state.slots)? != state.digest {
        return Err(EnclogError::element(format!(
            "state file {} failed integrity check",
            path.display()
        )));
    }
    state
        .slots
        .into_iter()
        .map(|slot| {
            let metadata = hex::decode(&slot.metadata).map_err(EnclogError::element)?;
            let key = slot
                .key
                .map(|key| hex::decode(key).map_err(EnclogError::element))
                .transpose()?;
            Ok::<_, EnclogError>((slot.id, SlotEntry { metadata, key }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::DEFAULT_KEY_SLOT, command::KeySlot, gateway::CommandGateway};
    use rand::rngs::mock::StepRng;
    use tempfile::TempDir;

    const TEST_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn gateway(element: &Arc<SoftSecureElement>) -> CommandGateway {
        let element: Arc<dyn SecureElement> = element.clone();
        CommandGateway::new(element, Some(Duration::from_secs(5)))
    }

    #[test]
    fn cbc_matches_reference_vector() {
        // First block of the SP 800-38A CBC-AES128 example.
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let iv: Vec<u8> = (0u8..16).collect();
        let ciphertext = encrypt_cbc(&TEST_KEY, &iv, &plaintext).unwrap();
        assert_eq!(hex::encode(ciphertext), "7649abac8119b246cee98e9b12e9197d");
    }

    #[test]
    fn random_draws_differ_and_respect_bounds() {
        let element = Arc::new(SoftSecureElement::new().unwrap());
        let gw = gateway(&element);
        let a = gw.generate_random(16).unwrap();
        let b = gw.generate_random(16).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(matches!(
            gw.generate_random(4),
            Err(crate::HsmError::SubmissionFailed {
                code: StatusCode::INVALID_INPUT,
                ..
            })
        ));
    }

    #[test]
    fn key_generation_requires_metadata() {
        let element = Arc::new(SoftSecureElement::new().unwrap());
        let gw = gateway(&element);
        let slot = KeySlot::default();
        assert!(gw.generate_symmetric_key(&slot).is_err());
        gw.write_metadata(slot.id, &SLOT_METADATA_DESCRIPTOR).unwrap();
        gw.generate_symmetric_key(&slot).unwrap();
        assert!(element.has_key(slot.id));
        assert_eq!(element.metadata(slot.id), SLOT_METADATA_DESCRIPTOR.to_vec());
        assert_eq!(
            element.history(),
            vec!["generate_symmetric_key", "write_metadata", "generate_symmetric_key"]
        );
    }

    #[test]
    fn encrypt_without_key_fails() {
        let element = Arc::new(SoftSecureElement::new().unwrap());
        let gw = gateway(&element);
        let err = gw
            .encrypt(&KeySlot::default(), CipherMode::Cbc, &[0u8; 64], &[0u8; 16])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::HsmError::CompletionFailed {
                code: StatusCode::KEY_NOT_FOUND,
                ..
            }
        ));
    }

    #[test]
    fn injected_faults_apply_in_order() {
        let element = SoftSecureElement::new()
            .unwrap()
            .with_key(DEFAULT_KEY_SLOT, TEST_KEY);
        let element = Arc::new(element);
        element.inject_fault(Fault::RejectSubmission(StatusCode::BUSY));
        element.inject_fault(Fault::FailCompletion(StatusCode::DEVICE_ERROR));
        element.inject_fault(Fault::ShortOutput);
        let gw = gateway(&element);
        assert!(matches!(
            gw.generate_random(16),
            Err(crate::HsmError::SubmissionFailed { .. })
        ));
        assert!(matches!(
            gw.generate_random(16),
            Err(crate::HsmError::CompletionFailed { .. })
        ));
        assert_eq!(gw.generate_random(16).unwrap().len(), 15);
        assert_eq!(gw.generate_random(16).unwrap().len(), 16);
    }

    #[test]
    fn stalled_command_times_out_at_the_gateway() {
        let element = Arc::new(SoftSecureElement::new().unwrap());
        element.inject_fault(Fault::Stall);
        let element_dyn: Arc<dyn SecureElement> = element.clone();
        let gw = CommandGateway::new(element_dyn, Some(Duration::from_millis(50)));
        assert!(matches!(
            gw.generate_random(16),
            Err(crate::HsmError::Timeout { .. })
        ));
        assert_eq!(element.stalled_count(), 1);
        // the element keeps serving later commands
        assert_eq!(gw.generate_random(16).unwrap().len(), 16);
        assert_eq!(element.stalled_count(), 1);
    }

    #[test]
    fn failed_persist_leaves_slots_unchanged() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("element.json");
        let element = Arc::new(SoftSecureElement::open(&path).unwrap());
        let gw = gateway(&element);
        let slot = KeySlot::default();
        gw.write_metadata(slot.id, &SLOT_METADATA_DESCRIPTOR).unwrap();

        // a directory in place of the state file makes every save fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(matches!(
            gw.generate_symmetric_key(&slot),
            Err(crate::HsmError::CompletionFailed {
                code: StatusCode::DEVICE_ERROR,
                ..
            })
        ));
        assert!(!element.has_key(slot.id));

        let rewrite = gw.write_metadata(0xE201, &SLOT_METADATA_DESCRIPTOR);
        assert!(rewrite.is_err());
        assert!(element.metadata(0xE201).is_empty());
        assert_eq!(element.metadata(slot.id), SLOT_METADATA_DESCRIPTOR.to_vec());
    }

    #[test]
    fn injected_rng_controls_random_output() {
        let element = Arc::new(
            SoftSecureElement::new()
                .unwrap()
                .with_rng(StepRng::new(0x0706_0504_0302_0100, 0x0808_0808_0808_0808)),
        );
        let gw = gateway(&element);
        let bytes = gw.generate_random(16).unwrap();
        assert_eq!(bytes, (0u8..16).collect::<Vec<_>>());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("element.json");
        {
            let element = Arc::new(SoftSecureElement::open(&path).unwrap());
            let gw = gateway(&element);
            let slot = KeySlot::default();
            gw.write_metadata(slot.id, &SLOT_METADATA_DESCRIPTOR).unwrap();
            gw.generate_symmetric_key(&slot).unwrap();
        }
        let reopened = SoftSecureElement::open(&path).unwrap();
        assert!(reopened.has_key(DEFAULT_KEY_SLOT));
        assert_eq!(
            reopened.metadata(DEFAULT_KEY_SLOT),
            SLOT_METADATA_DESCRIPTOR.to_vec()
        );
    }

    #[test]
    fn tampered_state_is_refused() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("element.json");
        {
            let element = Arc::new(SoftSecureElement::open(&path).unwrap());
            gateway(&element)
                .write_metadata(DEFAULT_KEY_SLOT, &SLOT_METADATA_DESCRIPTOR)
                .unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("2006d00100d30100", "2006d00100d30101");
        assert_ne!(contents, tampered);
        fs::write(&path, tampered).unwrap();
        assert!(matches!(
            SoftSecureElement::open(&path),
            Err(EnclogError::Element(_))
        ));
    }
}
