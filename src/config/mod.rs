//! Project configuration for remote_target.
//!
//! A project is marked by a `.remote_target` file in its root directory. The
//! file is a flat INI-style document whose `[DEFAULT]` section carries the
//! connection settings:
//!
//! ```ini
//! [DEFAULT]
//! Hostname = build.example.com
//! Username = deploy
//! PrivateKey = ~/.ssh/id_ed25519
//! Base = /srv
//! RemoteDir = ${Base}/app
//! ```
//!
//! # Architecture
//!
//! - **store**: INI parser/writer with `${key}` interpolation
//! - **locate**: upward search for the `.remote_target` file
//! - **target**: typed view over the store ([`RemoteTarget`])

pub mod locate;
pub mod store;
pub mod target;

use std::path::PathBuf;

use thiserror::Error;

pub use locate::{TARGET_FILE_NAME, find_target_file};
pub use store::{ConfigStore, DEFAULT_SECTION};
pub use target::{RemoteTarget, TargetDefaults};

/// Errors raised while locating, reading, or writing project configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Couldn't find '{}' file in parents of {}", TARGET_FILE_NAME, .start.display())]
    NotFound { start: PathBuf },

    #[error("{} doesn't exist or is not accessible", .0.display())]
    FileMissing(PathBuf),

    #[error("a {} file already exists here: {}", TARGET_FILE_NAME, .0.display())]
    AlreadyExists(PathBuf),

    #[error("missing configuration key '{0}'")]
    MissingField(String),

    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("bad value for '{key}': '{reference}' is not defined")]
    InterpolationMissing { key: String, reference: String },

    #[error("bad interpolation syntax in '{key}': {message}")]
    InterpolationSyntax { key: String, message: String },

    #[error("interpolation of '{key}' nested deeper than {max} levels")]
    InterpolationDepth { key: String, max: usize },

    #[error("configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
