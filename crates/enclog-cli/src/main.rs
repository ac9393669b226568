mod console;

use std::{
    io::{self, IsTerminal},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use enclog_core::{BackendKind, EnclogConfig, EncryptedLog, SoftSecureElement};
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Encrypted status log backed by a secure element",
    after_help = "Reads single-byte operator commands from stdin: a/1 appends an encrypted \
                  status record, c/2 clears the log, p prints it as hex."
)]
struct Args {
    /// Configuration file (YAML, or JSON with a .json extension).
    #[arg(long, env = "ENCLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Overwrite the key slot with a freshly generated key on boot.
    #[arg(long)]
    force_regenerate: bool,

    /// Storage medium holding the log.
    #[arg(long, value_enum)]
    storage: Option<StorageArg>,

    /// Directory the log file lives in; defaults to the medium's mount point.
    #[arg(long)]
    mount_point: Option<PathBuf>,

    /// Secure element state file, so the key survives restarts.
    #[arg(long, env = "ENCLOG_HSM_STATE")]
    hsm_state: Option<PathBuf>,

    /// Completion timeout for secure element commands, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageArg {
    Flash,
    Sdcard,
    Memory,
}

impl From<StorageArg> for BackendKind {
    fn from(value: StorageArg) -> Self {
        match value {
            StorageArg::Flash => BackendKind::Flash,
            StorageArg::Sdcard => BackendKind::SdCard,
            StorageArg::Memory => BackendKind::Memory,
        }
    }
}

impl Args {
    fn load_config(&self) -> Result<EnclogConfig> {
        let mut config = match &self.config {
            Some(path) => EnclogConfig::from_path(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => EnclogConfig::default(),
        };
        if self.force_regenerate {
            config.force_regenerate = true;
        }
        if let Some(storage) = self.storage {
            config.storage.backend = storage.into();
        }
        if let Some(mount_point) = &self.mount_point {
            config.storage.mount_point = Some(mount_point.clone());
        }
        if let Some(state) = &self.hsm_state {
            config.hsm.state_file = Some(state.clone());
        }
        if let Some(timeout) = self.timeout_ms {
            config.hsm.completion_timeout_ms = Some(timeout);
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = args.load_config()?;
    let element = SoftSecureElement::from_config(&config.hsm)
        .context("failed to start secure element")?;
    let log = EncryptedLog::boot(&config, Arc::new(element)).context("boot failed")?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    console::run(&log, stdin.lock(), &mut stdout.lock())
}
