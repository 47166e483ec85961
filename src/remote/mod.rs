//! Pushing a project tree to its remote target.
//!
//! # Architecture
//!
//! - **sync**: transport-independent push engine ([`PushEngine`]) and the
//!   [`Connect`]/[`RemoteFs`] traits it drives
//! - **sftp**: the ssh2-backed implementation used by the CLI
//!
//! # Example
//!
//! ```rust,ignore
//! use remote_target::config::RemoteTarget;
//! use remote_target::remote::{PushEngine, SftpConnector};
//!
//! let target = RemoteTarget::discover(&std::env::current_dir()?)?;
//! let engine = PushEngine::new(SftpConnector::default());
//! let report = engine.push(&target, |event| println!("{event}"))?;
//! println!("{} files", report.files_uploaded);
//! ```

pub mod sftp;
pub mod sync;

use thiserror::Error;

pub use sftp::SftpConnector;
pub use sync::{
    AuthMethod, Connect, Credentials, FileTimes, PushEngine, PushEvent, PushReport, RemoteFs,
};

/// Errors raised while talking to the remote host.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("SSH connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("host key verification failed for {host}: {message}")]
    HostKey { host: String, message: String },

    #[error("authentication as {user} failed: {message}")]
    Authentication { user: String, message: String },

    #[error("transfer failed for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("failed to read local files: {0}")]
    Local(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl SyncError {
    /// Shorthand for a [`SyncError::Transfer`] on `path`.
    pub fn transfer(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
