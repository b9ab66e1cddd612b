use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{MtftpError, Result};
use crate::{MAX_BLOCK_SIZE, MAX_WINDOW_SIZE};

/// Tunable protocol parameters (spec §6 "Configuration").
///
/// Both peers must agree on `block_size` and `window_size` out of band —
/// a mismatch manifests as decode errors rather than a negotiation failure,
/// the same way a raw block-size mismatch would on the wire this protocol
/// targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtftpConfig {
    /// DATA payload cap, in bytes. Typical range 16-64.
    pub block_size: u16,
    /// Blocks per window; must be a non-zero multiple of 8, capped at
    /// [`MAX_WINDOW_SIZE`] so the receive bitmap fits a single `u64`.
    pub window_size: u16,
    /// Sender wait for ACK before retransmitting the window.
    pub ack_timeout_ms: u64,
    /// Receiver wait for a completing window before re-announcing its bitmap.
    pub rx_timeout_ms: u64,
    /// Consecutive timeout retries tolerated before the endpoint gives up.
    pub max_retries: u32,
    /// Logging setup for the demo binaries.
    pub logging: LoggingConfig,
}

impl Default for MtftpConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            window_size: 8,
            ack_timeout_ms: 1_000,
            rx_timeout_ms: 1_000,
            max_retries: 5,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging setup, applied by the demo binaries when they initialize
/// `tracing-subscriber` (spec's expanded `[MODULE: logging]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `"info"` or `"mtftp=debug"`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for a human reading the terminal directly.
    Text,
    /// JSON structured logging, for piping into a log aggregator.
    Json,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block_size must be non-zero and at most {MAX_BLOCK_SIZE} (header + payload must fit an 8-bit transport length)")]
    BlockSizeOutOfRange,

    #[error("window_size must be a non-zero multiple of 8, at most {MAX_WINDOW_SIZE}, got {0}")]
    WindowSizeInvalid(u16),

    #[error("ack_timeout_ms must be non-zero")]
    AckTimeoutZero,

    #[error("rx_timeout_ms must be non-zero")]
    RxTimeoutZero,
}

impl MtftpConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size as usize > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeOutOfRange);
        }
        if self.window_size == 0
            || self.window_size % 8 != 0
            || self.window_size as usize > MAX_WINDOW_SIZE
        {
            return Err(ConfigError::WindowSizeInvalid(self.window_size));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::AckTimeoutZero);
        }
        if self.rx_timeout_ms == 0 {
            return Err(ConfigError::RxTimeoutZero);
        }
        Ok(())
    }
}

/// Load a config from a TOML file, then validate it.
pub fn load_config(path: &Path) -> Result<MtftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: MtftpConfig = toml::from_str(&contents)
        .map_err(|e| MtftpError::Other(anyhow::anyhow!("invalid config file {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write `config` to `path` as pretty-printed TOML.
pub fn write_config(path: &Path, config: &MtftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| MtftpError::Other(anyhow::anyhow!("failed to serialize config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}
