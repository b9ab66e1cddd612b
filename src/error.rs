use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;

/// Crate-wide error type.
///
/// Session-level protocol faults (decode failures, I/O callback failures,
/// timeouts, stale windows, busy, aborted) are never surfaced through this
/// type — the state machines handle those locally by emitting an `ERR`
/// packet and returning to `IDLE` (see [`crate::server`] and
/// [`crate::client`]). `MtftpError` exists for the host-side plumbing: a
/// misconfigured crate, or a demo binary's transport/file setup failing
/// before a session ever starts.
#[derive(Error, Debug)]
pub enum MtftpError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MtftpError>;
