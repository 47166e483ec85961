pub mod config;
pub mod remote;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use config::{RemoteTarget, TARGET_FILE_NAME};
use remote::{Connect, PushEngine, PushEvent, PushReport, SftpConnector};

/// A tool for automating software deployments and directory replication over sftp.
#[derive(Parser, Debug)]
#[command(name = "remote_target", arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Displays information about the current remote_target configuration
    Info,
    /// Initializes a .remote_target file in the current working directory
    Init,
    /// Pushes the local files to the remote target
    Push,
}

/// Library entrypoint; dispatches one subcommand against the process cwd.
pub fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Info => cmd_info(&cwd, &mut out),
        Commands::Init => cmd_init(&cwd, &mut out),
        Commands::Push => {
            let engine = PushEngine::new(SftpConnector::default());
            cmd_push(&cwd, &engine, &mut out).map(|_| ())
        }
    }
}

/// `info`: show where the configuration came from and what it resolves to.
pub fn cmd_info(cwd: &Path, out: &mut impl Write) -> Result<()> {
    let target = RemoteTarget::discover(cwd)?;
    writeln!(
        out,
        "Configuration loaded from {}",
        target.config_path().display()
    )?;
    write!(out, "{}", target.summary()?)?;
    Ok(())
}

/// `init`: scaffold a `.remote_target` in `cwd`; never overwrites.
pub fn cmd_init(cwd: &Path, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "Creating example {TARGET_FILE_NAME} file in the current directory"
    )?;
    RemoteTarget::create_default(&cwd.join(TARGET_FILE_NAME))?;
    Ok(())
}

/// `push`: upload the project root that contains `cwd` to its remote directory.
pub fn cmd_push<C: Connect>(
    cwd: &Path,
    engine: &PushEngine<C>,
    out: &mut impl Write,
) -> Result<PushReport> {
    let target = RemoteTarget::discover(cwd)?;

    let mut write_error = None;
    let report = engine
        .push(&target, |event| {
            if matches!(event, PushEvent::FileUploaded { .. }) {
                return;
            }
            if let Err(e) = writeln!(out, "{event}")
                && write_error.is_none()
            {
                write_error = Some(e);
            }
        })
        .context("push failed")?;
    if let Some(e) = write_error {
        return Err(e.into());
    }

    writeln!(
        out,
        "{} files ({} bytes) uploaded in {} ms",
        report.files_uploaded, report.bytes_uploaded, report.duration_ms
    )?;
    Ok(report)
}
