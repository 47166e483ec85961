//! Typed view over a `.remote_target` file.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use super::locate::find_target_file;
use super::store::{ConfigStore, DEFAULT_SECTION};
use super::ConfigError;

pub const KEY_HOSTNAME: &str = "Hostname";
pub const KEY_USERNAME: &str = "Username";
pub const KEY_PASSWORD: &str = "Password";
pub const KEY_PRIVATE_KEY: &str = "PrivateKey";
pub const KEY_REMOTE_DIR: &str = "RemoteDir";

/// Placeholder written by `init` until the user fills in a real host.
pub const PLACEHOLDER_HOSTNAME: &str = "url/to/server";

/// Values written into a freshly scaffolded `.remote_target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDefaults {
    pub hostname: String,
    pub username: String,
    pub private_key: String,
    pub remote_dir: String,
}

impl TargetDefaults {
    /// Defaults for the current OS user, using `$HOME` for the key path.
    pub fn detect() -> Self {
        let user = whoami::username();
        let home = std::env::var("HOME").ok();
        Self::for_user(&user, home.as_deref())
    }

    /// Defaults for `user`; an unset or empty `home` becomes `/home/<user>`.
    pub fn for_user(user: &str, home: Option<&str>) -> Self {
        let home = match home {
            Some(home) if !home.is_empty() => home.to_string(),
            _ => format!("/home/{user}"),
        };
        Self {
            hostname: PLACEHOLDER_HOSTNAME.to_string(),
            username: user.to_string(),
            private_key: format!("{home}/.ssh/id_rsa"),
            remote_dir: "/tmp".to_string(),
        }
    }

    fn to_store(&self) -> ConfigStore {
        let mut store = ConfigStore::new();
        store.set(DEFAULT_SECTION, KEY_HOSTNAME, &self.hostname);
        store.set(DEFAULT_SECTION, KEY_USERNAME, &self.username);
        store.set(DEFAULT_SECTION, KEY_PRIVATE_KEY, &self.private_key);
        store.set(DEFAULT_SECTION, KEY_REMOTE_DIR, &self.remote_dir);
        store
    }
}

/// A loaded `.remote_target`: the parsed settings plus the directory that
/// holds the file, which is the local root of every push.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    config_path: PathBuf,
    local_root: PathBuf,
    config: ConfigStore,
}

impl RemoteTarget {
    /// Find the nearest `.remote_target` at or above `start` and load it.
    pub fn discover(start: &Path) -> Result<Self, ConfigError> {
        let path = find_target_file(start).ok_or_else(|| ConfigError::NotFound {
            start: start.to_path_buf(),
        })?;
        Self::load(&path)
    }

    /// Load an explicit `.remote_target` path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileMissing(path.to_path_buf()));
        }
        let config = ConfigStore::read_file(path)?;
        tracing::debug!(path = %path.display(), "loaded target configuration");
        Ok(Self::from_parts(path, config))
    }

    /// Scaffold a new file at `path` with defaults for the current user.
    pub fn create_default(path: &Path) -> Result<Self, ConfigError> {
        Self::create_default_with(path, &TargetDefaults::detect())
    }

    /// Scaffold a new file at `path` from explicit defaults.
    ///
    /// Never overwrites: an existing file is an [`ConfigError::AlreadyExists`].
    pub fn create_default_with(path: &Path, defaults: &TargetDefaults) -> Result<Self, ConfigError> {
        if path.is_file() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }

        let config = defaults.to_store();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => ConfigError::AlreadyExists(path.to_path_buf()),
                _ => ConfigError::Io(e),
            })?;
        file.write_all(config.to_string().as_bytes())?;

        tracing::debug!(path = %path.display(), "wrote default target configuration");
        Ok(Self::from_parts(path, config))
    }

    /// Build a target from an in-memory store, as if loaded from `config_path`.
    pub fn from_parts(config_path: &Path, config: ConfigStore) -> Self {
        let local_root = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            config_path: config_path.to_path_buf(),
            local_root,
            config,
        }
    }

    /// Path of the `.remote_target` file this target came from.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory containing the `.remote_target` file.
    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn hostname(&self) -> Result<String, ConfigError> {
        self.required(KEY_HOSTNAME)
    }

    pub fn username(&self) -> Result<String, ConfigError> {
        self.required(KEY_USERNAME)
    }

    /// `None` means key-based authentication.
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        self.config.get(DEFAULT_SECTION, KEY_PASSWORD)
    }

    /// `None` means password (or agent) authentication.
    pub fn private_key(&self) -> Result<Option<String>, ConfigError> {
        self.config.get(DEFAULT_SECTION, KEY_PRIVATE_KEY)
    }

    pub fn remote_directory(&self) -> Result<String, ConfigError> {
        self.required(KEY_REMOTE_DIR)
    }

    /// Human-readable listing of the five connection fields.
    ///
    /// The password is shown in plain text; `info` relies on this.
    pub fn summary(&self) -> Result<String, ConfigError> {
        Ok(format!(
            "hostname: {}\nusername: {}\npassword: {}\nprivate_key: {}\nremote_directory: {}\n",
            self.hostname()?,
            self.username()?,
            or_none(self.password()?),
            or_none(self.private_key()?),
            self.remote_directory()?,
        ))
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.config
            .get(DEFAULT_SECTION, key)?
            .ok_or_else(|| ConfigError::MissingField(key.to_string()))
    }
}

fn or_none(value: Option<String>) -> String {
    value.unwrap_or_else(|| "None".to_string())
}
