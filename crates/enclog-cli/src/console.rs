//! Single-byte operator console.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use enclog_core::EncryptedLog;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Append,
    Clear,
    Print,
    /// Line terminators between commands.
    Ignore,
    Unknown(u8),
}

impl OperatorCommand {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'a' | b'A' | b'1' => Self::Append,
            b'c' | b'C' | b'2' => Self::Clear,
            b'p' | b'P' => Self::Print,
            b'\r' | b'\n' => Self::Ignore,
            other => Self::Unknown(other),
        }
    }
}

pub fn print_usage<W: Write>(out: &mut W) -> Result<()> {
    writeln!(out, "commands:")?;
    writeln!(out, "  a | 1   append an encrypted status record")?;
    writeln!(out, "  c | 2   clear the log")?;
    writeln!(out, "  p       print the log as hex")?;
    out.flush()?;
    Ok(())
}

pub fn print_log<W: Write>(log: &EncryptedLog, out: &mut W) -> Result<()> {
    let dump = log.dump_hex().context("failed to open log for reading")?;
    if dump.is_missing() {
        info!("no existing log file found.");
        return Ok(());
    }
    let mut total = 0usize;
    for chunk in dump {
        let chunk = chunk.context("failed to read log")?;
        total += chunk.bytes.len();
        writeln!(out, "{chunk}")?;
    }
    out.flush()?;
    let records = total / log.store().record_len();
    info!(bytes = total, records, "log dumped");
    Ok(())
}

/// Executes commands from `input` until it is exhausted. A failing command is reported
/// and the loop carries on; only console I/O errors end it early.
pub fn run<R: Read, W: Write>(log: &EncryptedLog, input: R, out: &mut W) -> Result<()> {
    print_log(log, out)?;
    print_usage(out)?;

    for byte in input.bytes() {
        let byte = byte.context("failed to read operator input")?;
        match OperatorCommand::from_byte(byte) {
            OperatorCommand::Append => match log.append_status() {
                Ok(report) => {
                    debug!(record = ?report.record, uptime_ms = report.message.uptime_ms, "appended");
                    info!(seq = report.seq, "record appended");
                }
                Err(err) => error!(error = %err, "append failed"),
            },
            OperatorCommand::Clear => match log.clear() {
                Ok(()) => info!("log cleared."),
                Err(err) => error!(error = %err, "clear failed"),
            },
            OperatorCommand::Print => {
                if let Err(err) = print_log(log, out) {
                    error!(error = %err, "dump failed");
                }
            }
            OperatorCommand::Ignore => {}
            OperatorCommand::Unknown(byte) => {
                warn!(byte = %char::from(byte).escape_default(), "unknown command");
                print_usage(out)?;
            }
        }
    }
    debug!("operator input closed");
    Ok(())
}
