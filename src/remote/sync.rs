//! Push engine: mirror a local project tree onto a remote directory.
//!
//! The engine is transport-independent. It talks to the remote host through
//! two small traits:
//!
//! - [`Connect`] opens an authenticated session from [`Credentials`]
//! - [`RemoteFs`] is the handful of file operations a push needs
//!
//! # Semantics
//!
//! A push is all-or-nothing from the caller's point of view: the first
//! failure aborts the walk and is returned. The session is disconnected on
//! every path out of [`PushEngine::push`], including errors.
//!
//! Uploads are additive. Nothing on the remote side is ever deleted.

use std::fmt;
use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use super::SyncError;
use crate::config::{ConfigError, RemoteTarget};

/// Port used for every connection; `.remote_target` has no port setting.
pub const DEFAULT_SSH_PORT: u16 = 22;

// =============================================================================
// Credentials
// =============================================================================

/// How the session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Plain password authentication.
    Password(String),
    /// Public key authentication from a private key file.
    PrivateKey(PathBuf),
    /// Whatever identities the running ssh-agent offers.
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(<redacted>)"),
            Self::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
            Self::Agent => write!(f, "Agent"),
        }
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl Credentials {
    /// Resolve credentials from a loaded target.
    ///
    /// A password wins over a private key when both are set. With neither,
    /// the first of `~/.ssh/id_rsa` and `~/.ssh/id_dsa` that exists is used,
    /// and the ssh-agent only after that. `~` in the key path is expanded
    /// against the local home directory.
    pub fn from_target(target: &RemoteTarget) -> Result<Self, ConfigError> {
        Self::from_target_with_home(target, dirs::home_dir().as_deref())
    }

    fn from_target_with_home(
        target: &RemoteTarget,
        home: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let auth = match (target.password()?, target.private_key()?) {
            (Some(password), _) => AuthMethod::Password(password),
            (None, Some(key)) => AuthMethod::PrivateKey(expand_tilde_with_home(&key, home)),
            (None, None) => match default_identity(home) {
                Some(key) => AuthMethod::PrivateKey(key),
                None => AuthMethod::Agent,
            },
        };

        Ok(Self {
            hostname: target.hostname()?,
            port: DEFAULT_SSH_PORT,
            username: target.username()?,
            auth,
        })
    }
}

/// Key files tried, in order, when the target names no credentials.
const DEFAULT_IDENTITIES: [&str; 2] = ["id_rsa", "id_dsa"];

fn default_identity(home: Option<&Path>) -> Option<PathBuf> {
    let ssh_dir = home?.join(".ssh");
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

/// Expand a leading `~` or `~/` using `home`.
///
/// `~user/...` and paths without a tilde are returned unchanged, as is
/// everything when no home directory is known.
fn expand_tilde_with_home(path: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(path);
    };

    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

// =============================================================================
// Transport traits
// =============================================================================

/// Access and modification times copied onto uploaded files (Unix seconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: u64,
    pub mtime: u64,
}

impl FileTimes {
    /// Times of a local file; `atime` falls back to `mtime` when unavailable.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta.modified().ok().map(unix_secs).unwrap_or(0);
        let atime = meta.accessed().ok().map(unix_secs).unwrap_or(mtime);
        Self { atime, mtime }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Remote file operations needed by a push. Paths are POSIX strings.
pub trait RemoteFs {
    /// Whether anything exists at `path`.
    fn exists(&mut self, path: &str) -> Result<bool, SyncError>;

    /// Create a single directory; the parent must already exist.
    fn mkdir(&mut self, path: &str) -> Result<(), SyncError>;

    /// Copy a local file to `remote`, replacing it. Returns bytes written.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, SyncError>;

    /// Set access and modification times on `remote`.
    fn set_times(&mut self, remote: &str, times: FileTimes) -> Result<(), SyncError>;

    /// Close the session. Must tolerate being called more than once.
    fn disconnect(&mut self) -> Result<(), SyncError>;
}

/// Opens authenticated sessions.
pub trait Connect {
    type Session: RemoteFs;

    fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self::Session, SyncError>;
}

// =============================================================================
// Events and report
// =============================================================================

/// Progress notifications emitted during a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// The remote directory is missing and is about to be created.
    CreatingRemoteDir(String),
    /// The tree walk is starting.
    Uploading { local_root: PathBuf, remote_dir: String },
    /// One file has been uploaded and its times copied.
    FileUploaded { remote_path: String, bytes: u64 },
    /// The push finished and the session is closed.
    Done,
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreatingRemoteDir(dir) => write!(f, "Creating directory {dir} on remote..."),
            Self::Uploading { .. } => write!(f, "Uploading files..."),
            Self::FileUploaded { remote_path, bytes } => write!(f, "{remote_path} ({bytes} bytes)"),
            Self::Done => write!(f, "Done."),
        }
    }
}

/// Summary of a successful push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Number of files uploaded.
    pub files_uploaded: u64,
    /// Total bytes uploaded.
    pub bytes_uploaded: u64,
    /// Remote directories created, including the destination itself.
    pub dirs_created: u64,
    /// Whether the destination directory had to be created.
    pub remote_dir_created: bool,
    /// Wall time from connect to disconnect.
    pub duration_ms: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Pushes a target's local root to its remote directory.
pub struct PushEngine<C> {
    connector: C,
    /// Connection timeout in seconds.
    connection_timeout: u64,
}

impl<C: Connect> PushEngine<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connection_timeout: 10,
        }
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, seconds: u64) -> Self {
        self.connection_timeout = seconds;
        self
    }

    /// Push `target.local_root()` to the target's remote directory.
    pub fn push(
        &self,
        target: &RemoteTarget,
        on_event: impl FnMut(&PushEvent),
    ) -> Result<PushReport, SyncError> {
        let credentials = Credentials::from_target(target)?;
        let remote_dir = target.remote_directory()?;
        self.push_tree(&credentials, target.local_root(), &remote_dir, on_event)
    }

    /// Push an explicit local tree with explicit credentials.
    pub fn push_tree(
        &self,
        credentials: &Credentials,
        local_root: &Path,
        remote_dir: &str,
        mut on_event: impl FnMut(&PushEvent),
    ) -> Result<PushReport, SyncError> {
        let start = Instant::now();

        tracing::debug!(
            host = %credentials.hostname,
            user = %credentials.username,
            auth = ?credentials.auth,
            "connecting"
        );
        let mut session = self
            .connector
            .connect(credentials, Duration::from_secs(self.connection_timeout))?;

        let result = upload_tree(&mut session, local_root, remote_dir, &mut on_event);

        if let Err(e) = session.disconnect() {
            tracing::warn!(host = %credentials.hostname, error = %e, "disconnect failed");
        }

        let mut report = result?;
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            host = %credentials.hostname,
            remote_path = %remote_dir,
            files = report.files_uploaded,
            bytes = report.bytes_uploaded,
            duration_ms = report.duration_ms,
            "push completed"
        );
        on_event(&PushEvent::Done);
        Ok(report)
    }
}

/// Ensure `remote_dir` exists, then upload everything under `local_root`.
fn upload_tree<S: RemoteFs>(
    session: &mut S,
    local_root: &Path,
    remote_dir: &str,
    on_event: &mut impl FnMut(&PushEvent),
) -> Result<PushReport, SyncError> {
    let mut report = PushReport::default();

    if !session.exists(remote_dir)? {
        on_event(&PushEvent::CreatingRemoteDir(remote_dir.to_string()));
        report.dirs_created += make_remote_dirs(session, remote_dir)?;
        report.remote_dir_created = true;
    }

    on_event(&PushEvent::Uploading {
        local_root: local_root.to_path_buf(),
        remote_dir: remote_dir.to_string(),
    });

    for entry in WalkDir::new(local_root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(local_root) else {
            continue;
        };
        let remote_path = remote_join(remote_dir, relative);

        if entry.file_type().is_dir() {
            if !session.exists(&remote_path)? {
                session.mkdir(&remote_path)?;
                report.dirs_created += 1;
            }
        } else if entry.path().is_file() {
            // Follows symlinks to files; symlinked directories are not walked.
            let meta = fs::metadata(entry.path())?;
            let bytes = session.upload(entry.path(), &remote_path)?;
            session.set_times(&remote_path, FileTimes::from_metadata(&meta))?;

            report.files_uploaded += 1;
            report.bytes_uploaded += bytes;
            tracing::debug!(remote_path = %remote_path, bytes, "uploaded");
            on_event(&PushEvent::FileUploaded { remote_path, bytes });
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping non-regular entry");
        }
    }

    Ok(report)
}

/// Create `path` and any missing parents. Returns how many were created.
pub fn make_remote_dirs<S: RemoteFs + ?Sized>(
    session: &mut S,
    path: &str,
) -> Result<u64, SyncError> {
    let mut created = 0;
    let mut current = String::new();
    if path.starts_with('/') {
        current.push('/');
    }

    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(component);
        if !session.exists(&current)? {
            session.mkdir(&current)?;
            created += 1;
        }
    }

    Ok(created)
}

/// Join a local relative path onto a POSIX remote directory.
pub fn remote_join(base: &str, relative: &Path) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() || base.starts_with('/') {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() && base.starts_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, DEFAULT_SECTION, TARGET_FILE_NAME};
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Records calls; `fail_upload` makes uploads of that path fail.
    #[derive(Default)]
    struct RecordingFs {
        existing: BTreeSet<String>,
        calls: Vec<String>,
        fail_upload: Option<String>,
        disconnects: Rc<Cell<usize>>,
    }

    impl RemoteFs for RecordingFs {
        fn exists(&mut self, path: &str) -> Result<bool, SyncError> {
            Ok(self.existing.contains(path))
        }

        fn mkdir(&mut self, path: &str) -> Result<(), SyncError> {
            self.calls.push(format!("mkdir {path}"));
            self.existing.insert(path.to_string());
            Ok(())
        }

        fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, SyncError> {
            if self.fail_upload.as_deref() == Some(remote) {
                return Err(SyncError::transfer(remote, "permission denied"));
            }
            self.calls.push(format!("put {remote}"));
            self.existing.insert(remote.to_string());
            Ok(fs::metadata(local)?.len())
        }

        fn set_times(&mut self, remote: &str, _times: FileTimes) -> Result<(), SyncError> {
            self.calls.push(format!("utime {remote}"));
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), SyncError> {
            self.disconnects.set(self.disconnects.get() + 1);
            Ok(())
        }
    }

    fn creds() -> Credentials {
        Credentials {
            hostname: "example.com".into(),
            port: DEFAULT_SSH_PORT,
            username: "alice".into(),
            auth: AuthMethod::Agent,
        }
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/var/www", Path::new("a/b.txt")), "/var/www/a/b.txt");
        assert_eq!(remote_join("/var/www/", Path::new("a")), "/var/www/a");
        assert_eq!(remote_join("/", Path::new("a")), "/a");
        assert_eq!(remote_join("rel", Path::new("a")), "rel/a");
        assert_eq!(remote_join("/", Path::new("")), "/");
    }

    #[test]
    fn test_make_remote_dirs_creates_missing_only() {
        let mut fs = RecordingFs::default();
        fs.existing.insert("/var".into());

        let created = make_remote_dirs(&mut fs, "/var/www/app/").unwrap();

        assert_eq!(created, 2);
        assert_eq!(fs.calls, vec!["mkdir /var/www", "mkdir /var/www/app"]);
    }

    #[test]
    fn test_make_remote_dirs_relative() {
        let mut fs = RecordingFs::default();
        make_remote_dirs(&mut fs, "deploy/app").unwrap();
        assert_eq!(fs.calls, vec!["mkdir deploy", "mkdir deploy/app"]);
    }

    #[test]
    fn test_upload_tree_order_and_report() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.txt"), "bbbb").unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("a/one.txt"), "1").unwrap();

        let mut remote = RecordingFs::default();
        remote.existing.insert("/srv".into());
        let mut events = Vec::new();

        let report =
            upload_tree(&mut remote, tmp.path(), "/srv", &mut |e: &PushEvent| {
                events.push(e.clone())
            })
            .unwrap();

        assert_eq!(
            remote.calls,
            vec![
                "mkdir /srv/a",
                "put /srv/a/one.txt",
                "utime /srv/a/one.txt",
                "put /srv/b.txt",
                "utime /srv/b.txt",
            ]
        );
        assert_eq!(report.files_uploaded, 2);
        assert_eq!(report.bytes_uploaded, 5);
        assert_eq!(report.dirs_created, 1);
        assert!(!report.remote_dir_created);
        assert!(matches!(events[0], PushEvent::Uploading { .. }));
        assert_eq!(events.len(), 3);
    }

    struct OneShot(RefCell<Option<RecordingFs>>);

    impl Connect for OneShot {
        type Session = RecordingFs;

        fn connect(&self, _: &Credentials, _: Duration) -> Result<RecordingFs, SyncError> {
            self.0.borrow_mut().take().ok_or_else(|| SyncError::Connection {
                host: "example.com".into(),
                message: "already used".into(),
            })
        }
    }

    #[test]
    fn test_failed_upload_still_disconnects() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("x.bin"), "x").unwrap();

        let disconnects = Rc::new(Cell::new(0));
        let remote = RecordingFs {
            fail_upload: Some("/srv/x.bin".into()),
            disconnects: Rc::clone(&disconnects),
            ..Default::default()
        };
        let engine = PushEngine::new(OneShot(RefCell::new(Some(remote))));

        let mut events = Vec::new();
        let err = engine
            .push_tree(&creds(), tmp.path(), "/srv", |e: &PushEvent| events.push(e.clone()))
            .unwrap_err();

        assert!(matches!(err, SyncError::Transfer { ref path, .. } if path == "/srv/x.bin"));
        assert_eq!(disconnects.get(), 1);
        assert!(!events.contains(&PushEvent::Done));
    }

    #[test]
    fn test_connect_failure_propagates() {
        let engine = PushEngine::new(OneShot(RefCell::new(None)));
        let tmp = TempDir::new().unwrap();
        let err = engine
            .push_tree(&creds(), tmp.path(), "/srv", |_: &PushEvent| {})
            .unwrap_err();
        assert!(matches!(err, SyncError::Connection { .. }));
    }

    #[test]
    fn test_push_engine_with_timeout() {
        let engine = PushEngine::new(OneShot(RefCell::new(None))).with_connection_timeout(30);
        assert_eq!(engine.connection_timeout, 30);
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let home = Path::new("/home/alice");
        assert_eq!(
            expand_tilde_with_home("~/.ssh/id_rsa", Some(home)),
            PathBuf::from("/home/alice/.ssh/id_rsa")
        );
        assert_eq!(expand_tilde_with_home("~", Some(home)), PathBuf::from("/home/alice"));
        assert_eq!(
            expand_tilde_with_home("~bob/key", Some(home)),
            PathBuf::from("~bob/key")
        );
        assert_eq!(
            expand_tilde_with_home("~/.ssh/id_rsa", None),
            PathBuf::from("~/.ssh/id_rsa")
        );
        assert_eq!(
            expand_tilde_with_home("/etc/key", Some(home)),
            PathBuf::from("/etc/key")
        );
    }

    fn target_with(pairs: &[(&str, &str)]) -> RemoteTarget {
        let mut store = ConfigStore::new();
        for (k, v) in pairs {
            store.set(DEFAULT_SECTION, k, v);
        }
        RemoteTarget::from_parts(Path::new("/proj").join(TARGET_FILE_NAME).as_path(), store)
    }

    #[test]
    fn test_credentials_auth_precedence() {
        let base = [("Hostname", "h"), ("Username", "u"), ("RemoteDir", "/d")];

        let both = target_with(&[base[0], base[1], ("Password", "pw"), ("PrivateKey", "/k")]);
        assert_eq!(
            Credentials::from_target(&both).unwrap().auth,
            AuthMethod::Password("pw".into())
        );

        let key = target_with(&[base[0], base[1], ("PrivateKey", "/k")]);
        assert_eq!(
            Credentials::from_target(&key).unwrap().auth,
            AuthMethod::PrivateKey(PathBuf::from("/k"))
        );

        let no_keys = TempDir::new().unwrap();
        let agent = target_with(&base);
        let creds = Credentials::from_target_with_home(&agent, Some(no_keys.path())).unwrap();
        assert_eq!(creds.auth, AuthMethod::Agent);
        assert_eq!(creds.port, 22);
    }

    #[test]
    fn test_credentials_fall_back_to_default_identity() {
        let home = TempDir::new().unwrap();
        let ssh_dir = home.path().join(".ssh");
        std::fs::create_dir_all(&ssh_dir).unwrap();
        let target = target_with(&[("Hostname", "h"), ("Username", "u")]);

        std::fs::write(ssh_dir.join("id_dsa"), "dsa").unwrap();
        let creds = Credentials::from_target_with_home(&target, Some(home.path())).unwrap();
        assert_eq!(creds.auth, AuthMethod::PrivateKey(ssh_dir.join("id_dsa")));

        // id_rsa is preferred once it exists.
        std::fs::write(ssh_dir.join("id_rsa"), "rsa").unwrap();
        let creds = Credentials::from_target_with_home(&target, Some(home.path())).unwrap();
        assert_eq!(creds.auth, AuthMethod::PrivateKey(ssh_dir.join("id_rsa")));

        // An explicit key is never replaced by a default one.
        let explicit = target_with(&[("Hostname", "h"), ("Username", "u"), ("PrivateKey", "~/k")]);
        let creds = Credentials::from_target_with_home(&explicit, Some(home.path())).unwrap();
        assert_eq!(creds.auth, AuthMethod::PrivateKey(home.path().join("k")));

        let creds = Credentials::from_target_with_home(&target, None).unwrap();
        assert_eq!(creds.auth, AuthMethod::Agent);
    }

    #[test]
    fn test_credentials_require_host_and_user() {
        let target = target_with(&[("Username", "u")]);
        assert!(matches!(
            Credentials::from_target(&target).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let creds = Credentials {
            auth: AuthMethod::Password("hunter2".into()),
            ..creds()
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_push_event_messages() {
        assert_eq!(
            PushEvent::CreatingRemoteDir("/var/www".into()).to_string(),
            "Creating directory /var/www on remote..."
        );
        assert_eq!(
            PushEvent::Uploading {
                local_root: PathBuf::from("."),
                remote_dir: "/tmp".into()
            }
            .to_string(),
            "Uploading files..."
        );
        assert_eq!(PushEvent::Done.to_string(), "Done.");
    }
}
