// src/device/ssh.rs

//! SSH transport to a real tablet
//!
//! The tablet runs a minimal SSH server without an SFTP subsystem, so files
//! move through `cat` on exec channels and metadata comes from busybox
//! tools (`wc`, `sha256sum`, `find`). Every command line is built with
//! quoted paths.
//!
//! Connection-level failures are retried under the configured
//! [`RetryPolicy`], reconnecting before each new attempt. A failure after a
//! command was sent is only retried when the command can safely run twice;
//! otherwise its outcome is unknown and reported as such. A call that hits
//! the per-call timeout is aborted and reported immediately.

use super::path::{shell_quote, strip_root};
use super::retry::{CallError, RetryPolicy};
use super::{CommandOutput, Connection, FileStat};
use crate::error::{Error, Result};
use crate::hash::is_valid_checksum;
use ssh2::{ErrorCode, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// libssh2's LIBSSH2_ERROR_TIMEOUT
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Exit status the wrapped commands use for "no such file"
const EXIT_MISSING: i32 = 3;

/// Where and as whom to connect
///
/// Authentication is attempted with the key file if given, then the
/// password, then the SSH agent.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<String>,
    pub password: Option<String>,
}

pub struct SshConnection {
    target: SshTarget,
    retry: RetryPolicy,
    timeout: Duration,
    session: Option<Session>,
}

enum TransportError {
    Ssh(ssh2::Error),
    Io(io::Error),
}

impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        TransportError::Ssh(err)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// Where in a command's life the transport failed
enum ExecFailure {
    /// Nothing reached the device
    BeforeExec(TransportError),
    /// The command was sent and may have run
    AfterExec(TransportError),
}

/// Whether a command may be sent again after an unknown outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Running it twice leaves the device as running it once
    Safe,
    /// Sent at most once
    Once,
}

impl TransportError {
    fn is_timeout(&self) -> bool {
        match self {
            TransportError::Ssh(e) => e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT),
            TransportError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
        }
    }

    fn message(&self) -> String {
        match self {
            TransportError::Ssh(e) => e.to_string(),
            TransportError::Io(e) => e.to_string(),
        }
    }
}

impl SshConnection {
    /// Connect and authenticate, retrying transient failures
    pub fn connect(target: SshTarget, retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        info!("Connecting to {}@{}:{}", target.user, target.host, target.port);
        let session = retry.run("connect", |_| open_session(&target, timeout))?;
        Ok(Self {
            target,
            retry,
            timeout,
            session: Some(session),
        })
    }

    fn run(&mut self, command: &str, stdin: Option<&[u8]>, replay: Replay) -> Result<CommandOutput> {
        let retry = self.retry;
        let timeout = self.timeout;
        debug!("ssh exec: {}", command);

        retry.run("ssh exec", |attempt| {
            if attempt > 1 {
                self.session = None;
            }
            if self.session.is_none() {
                self.session = Some(open_session(&self.target, timeout)?);
            }
            let Some(session) = self.session.as_ref() else {
                return Err(CallError::Transient("no session".to_string()));
            };

            match exec_on(session, command, stdin) {
                Ok(output) => Ok(output),
                Err(failure) => {
                    self.session = None;
                    Err(classify(&failure, replay, command, timeout))
                }
            }
        })
    }

    /// Run a wrapped command, mapping [`EXIT_MISSING`] to `NotFound`
    fn checked(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        path: &str,
        replay: Replay,
    ) -> Result<CommandOutput> {
        let output = self.run(command, stdin, replay)?;
        match output.exit_code {
            0 => Ok(output),
            EXIT_MISSING => Err(Error::NotFound(path.to_string())),
            code => Err(Error::Connection(format!(
                "`{}` exited with {}: {}",
                command,
                code,
                output.stderr_lossy().trim()
            ))),
        }
    }
}

fn open_session(target: &SshTarget, timeout: Duration) -> std::result::Result<Session, CallError> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| CallError::Transient(format!("resolve {}: {}", target.host, e)))?
        .next()
        .ok_or_else(|| CallError::Fatal(Error::Connection(format!("no address for {}", target.host))))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| CallError::Transient(format!("connect {}: {}", addr, e)))?;

    let mut session = Session::new().map_err(|e| CallError::Transient(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| CallError::Transient(format!("handshake: {}", e)))?;

    let auth = if let Some(key) = &target.key_path {
        session.userauth_pubkey_file(&target.user, None, Path::new(key), target.password.as_deref())
    } else if let Some(password) = &target.password {
        session.userauth_password(&target.user, password)
    } else {
        session.userauth_agent(&target.user)
    };
    auth.map_err(|e| CallError::Fatal(Error::Connection(format!("authentication failed: {}", e))))?;

    if !session.authenticated() {
        return Err(CallError::Fatal(Error::Connection(
            "authentication failed".to_string(),
        )));
    }
    Ok(session)
}

/// Decide whether a failed call may be attempted again
fn classify(failure: &ExecFailure, replay: Replay, command: &str, timeout: Duration) -> CallError {
    let (error, sent) = match failure {
        ExecFailure::BeforeExec(e) => (e, false),
        ExecFailure::AfterExec(e) => (e, true),
    };
    if error.is_timeout() {
        return CallError::Fatal(Error::Connection(format!(
            "call timed out after {:?}: {}",
            timeout, command
        )));
    }
    if sent && replay == Replay::Once {
        return CallError::Fatal(Error::Connection(format!(
            "connection lost after `{}` was sent, outcome unknown: {}",
            command,
            error.message()
        )));
    }
    CallError::Transient(error.message())
}

fn exec_on(
    session: &Session,
    command: &str,
    stdin: Option<&[u8]>,
) -> std::result::Result<CommandOutput, ExecFailure> {
    let mut channel = session
        .channel_session()
        .map_err(|e| ExecFailure::BeforeExec(e.into()))?;
    channel
        .exec(command)
        .map_err(|e| ExecFailure::BeforeExec(e.into()))?;
    collect_output(&mut channel, stdin).map_err(ExecFailure::AfterExec)
}

fn collect_output(
    channel: &mut ssh2::Channel,
    stdin: Option<&[u8]>,
) -> std::result::Result<CommandOutput, TransportError> {
    if let Some(data) = stdin {
        channel.write_all(data)?;
        channel.flush()?;
        channel.send_eof()?;
    }

    let mut stdout = Vec::new();
    channel.read_to_end(&mut stdout)?;
    let mut stderr = Vec::new();
    channel.stderr().read_to_end(&mut stderr)?;
    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Parse the output of the stat command: size line, then checksum line
fn parse_stat(stdout: &str) -> Option<FileStat> {
    let mut lines = stdout.lines();
    let size = lines.next()?.trim().parse::<u64>().ok()?;
    let checksum = lines
        .next()
        .map(|l| l.trim().to_string())
        .filter(|c| is_valid_checksum(c));
    Some(FileStat { size, checksum })
}

impl Connection for SshConnection {
    fn describe(&self) -> String {
        format!("ssh:{}@{}:{}", self.target.user, self.target.host, self.target.port)
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.run(command, None, Replay::Once)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let p = shell_quote(path);
        let cmd = format!("[ -f {p} ] || exit {EXIT_MISSING}; cat {p}");
        Ok(self.checked(&cmd, None, path, Replay::Safe)?.stdout)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let cmd = format!("cat > {}", shell_quote(path));
        self.checked(&cmd, Some(data), path, Replay::Safe)?;
        Ok(())
    }

    fn list_tree(&mut self, root: &str) -> Result<Vec<String>> {
        let r = shell_quote(root);
        let cmd = format!("[ -d {r} ] || exit {EXIT_MISSING}; find {r} -type f");
        let output = self.checked(&cmd, None, root, Replay::Safe)?;
        let stdout = output.stdout_lossy();
        let mut files: Vec<String> = stdout
            .lines()
            .filter_map(|line| strip_root(root, line))
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    fn stat(&mut self, path: &str) -> Result<Option<FileStat>> {
        let p = shell_quote(path);
        let cmd = format!(
            "[ -f {p} ] || exit {EXIT_MISSING}; wc -c < {p}; sha256sum {p} 2>/dev/null | cut -d' ' -f1"
        );
        match self.checked(&cmd, None, path, Replay::Safe) {
            Ok(output) => parse_stat(&output.stdout_lossy())
                .map(Some)
                .ok_or_else(|| Error::Connection(format!("unparseable stat output for {}", path))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_dir_all(&mut self, path: &str) -> Result<()> {
        self.checked(&format!("mkdir -p {}", shell_quote(path)), None, path, Replay::Safe)?;
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        let p = shell_quote(path);
        let cmd = format!("[ -e {p} ] || [ -L {p} ] || exit {EXIT_MISSING}; rm -f {p}");
        self.checked(&cmd, None, path, Replay::Once)?;
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        let p = shell_quote(path);
        let cmd = format!("[ -d {p} ] || exit {EXIT_MISSING}; rmdir {p}");
        self.checked(&cmd, None, path, Replay::Once)?;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let f = shell_quote(from);
        let cmd = format!("[ -e {f} ] || exit {EXIT_MISSING}; mv -f {f} {}", shell_quote(to));
        self.checked(&cmd, None, from, Replay::Once)?;
        Ok(())
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        let output = self.run(&format!("[ -d {} ]", shell_quote(path)), None, Replay::Safe)?;
        Ok(output.success())
    }

    fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()> {
        let p = shell_quote(path);
        let cmd = format!("[ -e {p} ] || exit {EXIT_MISSING}; chmod {:o} {p}", mode & 0o7777);
        self.checked(&cmd, None, path, Replay::Safe)?;
        Ok(())
    }
}
