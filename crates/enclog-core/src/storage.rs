//! Byte-stream file abstraction underneath the log store, selected at runtime.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{config::StorageConfig, error::IoError};

/// Where the log lives. Flash and SD card are both mounted filesystems that differ
/// only in their default mount point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Flash,
    #[serde(rename = "sdcard")]
    SdCard,
    Memory,
}

impl BackendKind {
    pub fn default_mount_point(&self) -> Option<PathBuf> {
        match self {
            BackendKind::Flash => Some(PathBuf::from("/spiflash")),
            BackendKind::SdCard => Some(PathBuf::from("/sdcard")),
            BackendKind::Memory => None,
        }
    }
}

pub trait StorageBackend: Send + Sync {
    /// Human readable location, used in errors and logs.
    fn describe(&self) -> String;
    /// Opens the log for appending, creating it if absent. The handle is released on drop.
    fn open_append(&self) -> io::Result<Box<dyn Write + Send>>;
    /// Resets the log to zero length, creating it if absent.
    fn truncate(&self) -> io::Result<()>;
    /// `Ok(None)` when the log does not exist.
    fn open_read(&self) -> io::Result<Option<Box<dyn Read + Send>>>;
    /// Current size in bytes, `Ok(None)` when the log does not exist.
    fn size(&self) -> io::Result<Option<u64>>;
}

/// Log file on a mounted filesystem. The directory is restricted to the owner and the
/// file to owner read/write.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Prepares `mount_point` and creates an empty log file there if none exists.
    pub fn mount(mount_point: &Path, file_name: &str) -> Result<Self, IoError> {
        let target = mount_point.display().to_string();
        fs::create_dir_all(mount_point).map_err(|err| IoError::open(&target, err))?;
        #[cfg(unix)]
        fs::set_permissions(mount_point, fs::Permissions::from_mode(0o700))
            .map_err(|err| IoError::open(&target, err))?;

        let backend = Self {
            path: mount_point.join(file_name),
        };
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        backend
            .open_with(&mut options)
            .map_err(|err| IoError::open(backend.describe(), err))?;
        info!(path = %backend.path.display(), "log storage mounted");
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the log with owner-only permissions, tightening them on a pre-existing file.
    fn open_with(&self, options: &mut OpenOptions) -> io::Result<File> {
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(&self.path)?;
        #[cfg(unix)]
        {
            let mut perms = file.metadata()?.permissions();
            if perms.mode() & 0o777 != 0o600 {
                perms.set_mode(0o600);
                file.set_permissions(perms)?;
            }
        }
        Ok(file)
    }
}

impl StorageBackend for FileBackend {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open_append(&self) -> io::Result<Box<dyn Write + Send>> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let file = self.open_with(&mut options)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Box::new(file))
    }

    fn truncate(&self) -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let file = self.open_with(&mut options)?;
        file.sync_all()
    }

    fn open_read(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn size(&self) -> io::Result<Option<u64>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Volatile log kept in process memory.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Mounted with an empty log.
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Mounted with no log present.
    pub fn absent() -> Self {
        Self {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data.lock().clone()
    }
}

struct MemoryAppender {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Write for MemoryAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data
            .lock()
            .get_or_insert_with(Vec::new)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn open_append(&self) -> io::Result<Box<dyn Write + Send>> {
        self.data.lock().get_or_insert_with(Vec::new);
        Ok(Box::new(MemoryAppender {
            data: Arc::clone(&self.data),
        }))
    }

    fn truncate(&self) -> io::Result<()> {
        *self.data.lock() = Some(Vec::new());
        Ok(())
    }

    fn open_read(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        match self.data.lock().clone() {
            Some(bytes) => Ok(Some(Box::new(Cursor::new(bytes)))),
            None => Ok(None),
        }
    }

    fn size(&self) -> io::Result<Option<u64>> {
        Ok(self.data.lock().as_ref().map(|bytes| bytes.len() as u64))
    }
}

/// Mounts the backend named by `config`.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, IoError> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        kind => {
            let mount_point = config
                .mount_point
                .clone()
                .or_else(|| kind.default_mount_point())
                .unwrap_or_else(|| PathBuf::from("."));
            let backend = FileBackend::mount(&mount_point, &config.file_name)?;
            Ok(Arc::new(backend))
        }
    }
}
