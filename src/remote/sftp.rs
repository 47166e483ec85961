//! SFTP transport built on libssh2 (`ssh2` crate).

use std::fs::{self, File};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{
    CheckResult, DisconnectCode, ErrorCode, FileStat, KnownHostFileKind, OpenFlags, OpenType,
    Session, Sftp,
};

use super::SyncError;
use super::sync::{AuthMethod, Connect, Credentials, FileTimes, RemoteFs};

/// `SSH_FX_NO_SUCH_FILE` status from the SFTP protocol.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Mode for directories created on the remote (the server's umask applies).
const REMOTE_DIR_MODE: i32 = 0o777;

/// Opens ssh2 sessions with host key verification.
#[derive(Debug, Clone, Default)]
pub struct SftpConnector {
    /// Override for `~/.ssh/known_hosts`.
    known_hosts: Option<PathBuf>,
}

impl SftpConnector {
    /// Verify host keys against `path` instead of `~/.ssh/known_hosts`.
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")))
    }

    /// Check the server key against known_hosts.
    ///
    /// A missing known_hosts file only logs a warning; an unknown host or a
    /// changed key is fatal.
    fn verify_host_key(&self, session: &Session, creds: &Credentials) -> Result<(), SyncError> {
        let host_key_err = |message: String| SyncError::HostKey {
            host: creds.hostname.clone(),
            message,
        };

        let Some(path) = self.known_hosts_path().filter(|p| p.is_file()) else {
            tracing::warn!(
                host = %creds.hostname,
                "no known_hosts file found; skipping host key verification"
            );
            return Ok(());
        };

        let mut known = session
            .known_hosts()
            .map_err(|e| host_key_err(e.to_string()))?;
        known
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|e| host_key_err(format!("failed to read {}: {}", path.display(), e)))?;

        let (key, _) = session
            .host_key()
            .ok_or_else(|| host_key_err("server did not present a host key".to_string()))?;

        match known.check_port(&creds.hostname, creds.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(host_key_err(format!(
                "no host key for {} in {}",
                creds.hostname,
                path.display()
            ))),
            CheckResult::Mismatch => Err(host_key_err(format!(
                "host key does not match the entry in {}",
                path.display()
            ))),
            CheckResult::Failure => Err(host_key_err("host key check failed".to_string())),
        }
    }
}

fn authenticate(session: &Session, creds: &Credentials) -> Result<(), SyncError> {
    let user = creds.username.as_str();
    let auth_err = |message: String| SyncError::Authentication {
        user: user.to_string(),
        message,
    };

    let result = match &creds.auth {
        AuthMethod::Password(password) => session.userauth_password(user, password),
        AuthMethod::PrivateKey(key) => session.userauth_pubkey_file(user, None, key, None),
        AuthMethod::Agent => session.userauth_agent(user),
    };
    result.map_err(|e| auth_err(e.to_string()))?;

    if !session.authenticated() {
        return Err(auth_err("server rejected the credentials".to_string()));
    }
    Ok(())
}

impl Connect for SftpConnector {
    type Session = SftpSession;

    fn connect(&self, creds: &Credentials, timeout: Duration) -> Result<SftpSession, SyncError> {
        let conn_err = |message: String| SyncError::Connection {
            host: creds.hostname.clone(),
            message,
        };

        let addr = (creds.hostname.as_str(), creds.port)
            .to_socket_addrs()
            .map_err(|e| conn_err(format!("cannot resolve host: {e}")))?
            .next()
            .ok_or_else(|| conn_err("host resolved to no addresses".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| conn_err(e.to_string()))?;
        let mut session = Session::new().map_err(|e| conn_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| conn_err(e.to_string()))?;
        tracing::debug!(host = %creds.hostname, %addr, "ssh handshake complete");

        self.verify_host_key(&session, creds)?;
        authenticate(&session, creds)?;

        let sftp = session.sftp().map_err(|e| conn_err(e.to_string()))?;
        tracing::debug!(host = %creds.hostname, "sftp channel open");

        Ok(SftpSession {
            host: creds.hostname.clone(),
            session,
            sftp: Some(sftp),
        })
    }
}

/// An authenticated SFTP session. Disconnects on drop if still open.
pub struct SftpSession {
    host: String,
    session: Session,
    /// `None` once disconnected.
    sftp: Option<Sftp>,
}

impl SftpSession {
    fn sftp(&self) -> Result<&Sftp, SyncError> {
        self.sftp.as_ref().ok_or_else(|| SyncError::Connection {
            host: self.host.clone(),
            message: "session already closed".to_string(),
        })
    }
}

impl RemoteFs for SftpSession {
    fn exists(&mut self, path: &str) -> Result<bool, SyncError> {
        match self.sftp()?.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => Ok(false),
            Err(e) => Err(SyncError::transfer(path, e)),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<(), SyncError> {
        self.sftp()?
            .mkdir(Path::new(path), REMOTE_DIR_MODE)
            .map_err(|e| SyncError::transfer(path, e))
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, SyncError> {
        let mut src = File::open(local)?;
        let mode = local_file_mode(&fs::metadata(local)?);
        let mut dst = self
            .sftp()?
            .open_mode(
                Path::new(remote),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|e| SyncError::transfer(remote, e))?;
        io::copy(&mut src, &mut dst).map_err(|e| SyncError::transfer(remote, e))
    }

    fn set_times(&mut self, remote: &str, times: FileTimes) -> Result<(), SyncError> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(times.atime),
            mtime: Some(times.mtime),
        };
        self.sftp()?
            .setstat(Path::new(remote), stat)
            .map_err(|e| SyncError::transfer(remote, e))
    }

    fn disconnect(&mut self) -> Result<(), SyncError> {
        // Close the SFTP channel before tearing down the session.
        if self.sftp.take().is_none() {
            return Ok(());
        }
        self.session
            .disconnect(Some(DisconnectCode::ByApplication), "push finished", None)
            .map_err(|e| SyncError::Connection {
                host: self.host.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(host = %self.host, "disconnected");
        Ok(())
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if self.sftp.is_some()
            && let Err(e) = self.disconnect()
        {
            tracing::warn!(host = %self.host, error = %e, "disconnect on drop failed");
        }
    }
}

#[cfg(unix)]
fn local_file_mode(meta: &fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn local_file_mode(_meta: &fs::Metadata) -> i32 {
    0o644
}
