// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Uniform remote execution over heterogeneous machines.
//!
//! Every machine participating in a cluster bring-up is reached through a
//! [`Transport`]: run a command, stream a command's output, or move a file,
//! without the caller knowing whether the machine is an SSH-reachable VM or
//! a local container. Two implementations are provided: [`SshTransport`]
//! (one authenticated session per node, reused across commands) and
//! [`ContainerExecTransport`] (direct exec into a local container, no
//! network handshake).

use async_trait::async_trait;
use camino::Utf8Path;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod local_exec;
pub mod node;
pub mod ssh;

pub use local_exec::ContainerExecTransport;
pub use node::{ClusterNodes, NodeError, NodeHandle, Role, TransportKind};
pub use ssh::SshTransport;

/// Exit code recorded when a per-operation timeout killed the remote
/// process (the coreutils `timeout` convention).
pub const EXIT_TIMED_OUT: i32 = 124;

/// Exit code recorded when the operation failed below the command level
/// (connect, auth, or copy failure) and no real exit status exists.
pub const EXIT_TRANSPORT_FAILED: i32 = 255;

/// The outcome of running one command on one node.
///
/// Immutable once produced; dispatch batches aggregate one of these per
/// target node.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub node: NodeHandle,
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Pid of the locally spawned process, when one exists. Commands run
    /// over SSH execute entirely on the remote side and have no local pid.
    pub pid: Option<u32>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Synthesize a result for an operation that failed before the remote
    /// command could produce an exit status.
    pub fn transport_failure(
        node: NodeHandle,
        args: Vec<String>,
        error: &TransportError,
    ) -> Self {
        CommandResult {
            node,
            args,
            stdout: Vec::new(),
            stderr: error_chain(error).into_bytes(),
            exit_code: EXIT_TRANSPORT_FAILED,
            pid: None,
        }
    }

    /// Synthesize a result for an operation killed by its timeout.
    pub fn timed_out(
        node: NodeHandle,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        CommandResult {
            node,
            args,
            stdout: Vec::new(),
            stderr: format!("operation timed out after {timeout:?}")
                .into_bytes(),
            exit_code: EXIT_TIMED_OUT,
            pid: None,
        }
    }
}

/// Errors raised by transport implementations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connecting to {addr}")]
    Connect {
        addr: IpAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("authenticating to {addr} as {principal}")]
    Auth {
        addr: IpAddr,
        principal: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("authentication rejected by {addr} for {principal}")]
    AuthRejected { addr: IpAddr, principal: String },

    #[error(
        "command {:?} failed on {} with exit code {}: {}",
        .result.args,
        .result.node.public_ip(),
        .result.exit_code,
        .result.stderr_str(),
    )]
    CommandFailed { result: CommandResult },

    #[error("copying {local} to {addr}:{remote}")]
    Upload {
        addr: IpAddr,
        local: camino::Utf8PathBuf,
        remote: camino::Utf8PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("copying {addr}:{remote} to {local}")]
    Download {
        addr: IpAddr,
        remote: camino::Utf8PathBuf,
        local: camino::Utf8PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("running command channel against {addr}")]
    Channel {
        addr: IpAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("a pty session cannot produce separable captured streams")]
    PtyWithCapture,

    #[error("no container mapped to node address {addr}")]
    UnknownContainer { addr: IpAddr },

    #[error("no transport registered for kind {0:?}")]
    UnregisteredKind(TransportKind),
}

/// Render an error and its source chain on one line, so a failed target's
/// stderr identifies the offending node without cross-referencing logs.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// One command to run on a remote machine.
///
/// Privilege elevation is the caller's concern: [`RemoteCommand::sudo`]
/// prepends the elevation prefix, and transports never special-case it.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub args: Vec<String>,
    /// Principal to run as; defaults to the node's principal.
    pub principal: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Allocate a pseudo-terminal. Incompatible with `capture`.
    pub pty: bool,
    /// Capture stdout/stderr into the result. When false, output is logged
    /// as it arrives and the result's buffers stay empty.
    pub capture: bool,
    /// Raise [`TransportError::CommandFailed`] on a non-zero exit. When
    /// false, the non-zero result is returned for the caller to inspect.
    pub raise_on_failure: bool,
    /// Kill the remote process and record [`EXIT_TIMED_OUT`] if it runs
    /// longer than this.
    pub timeout: Option<Duration>,
}

impl RemoteCommand {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        RemoteCommand {
            args: args.into_iter().map(Into::into).collect(),
            principal: None,
            env: BTreeMap::new(),
            pty: false,
            capture: true,
            raise_on_failure: true,
            timeout: None,
        }
    }

    /// Prepend the privilege-elevation prefix. `-E` keeps injected
    /// environment variables visible to the elevated command.
    pub fn sudo(mut self) -> Self {
        let mut args = vec!["sudo".to_string(), "-E".to_string()];
        args.append(&mut self.args);
        self.args = args;
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn principal<S: Into<String>>(mut self, principal: S) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn pty(mut self) -> Self {
        self.pty = true;
        self.capture = false;
        self
    }

    pub fn uncaptured(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.raise_on_failure = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check the pty/capture contract before a transport acts on the
    /// command.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.pty && self.capture {
            return Err(TransportError::PtyWithCapture);
        }
        Ok(())
    }

    /// The principal this command runs as on `node`.
    pub fn principal_for<'a>(&'a self, node: &'a NodeHandle) -> &'a str {
        self.principal.as_deref().unwrap_or(node.principal())
    }

    /// Apply the raise-on-failure policy to a finished result.
    pub fn finish(
        &self,
        result: CommandResult,
    ) -> Result<CommandResult, TransportError> {
        if self.raise_on_failure && !result.success() {
            return Err(TransportError::CommandFailed { result });
        }
        Ok(result)
    }
}

/// A live, still-running command: chunks of output as they arrive, then a
/// final [`CommandResult`].
pub struct CommandStream {
    output: mpsc::Receiver<Vec<u8>>,
    done: JoinHandle<Result<CommandResult, TransportError>>,
}

impl CommandStream {
    pub fn new(
        output: mpsc::Receiver<Vec<u8>>,
        done: JoinHandle<Result<CommandResult, TransportError>>,
    ) -> Self {
        CommandStream { output, done }
    }

    /// The next chunk of stdout, or `None` once the command's output is
    /// exhausted.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Wait for the command to finish, discarding any unread output.
    pub async fn wait(self) -> Result<CommandResult, TransportError> {
        self.done.await.expect("command stream task panicked")
    }
}

/// Remote-execution capability over one kind of machine.
///
/// Implementations are selected per [`NodeHandle`] through [`Transports`];
/// callers never branch on the concrete variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on `node` synchronously, capturing output per the
    /// command's settings.
    async fn run(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandResult, TransportError>;

    /// Start `command` on `node` and stream its stdout as it is produced.
    async fn open_pipe(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandStream, TransportError>;

    /// Copy a local file or directory to `node`. Directories are copied
    /// recursively.
    async fn send_file(
        &self,
        node: &NodeHandle,
        local: &Utf8Path,
        remote: &Utf8Path,
        principal: &str,
    ) -> Result<(), TransportError>;

    /// Copy a single remote file from `node` to a local path.
    async fn download_file(
        &self,
        node: &NodeHandle,
        remote: &Utf8Path,
        local: &Utf8Path,
        principal: &str,
    ) -> Result<(), TransportError>;
}

/// The set of registered transport implementations, keyed by kind.
#[derive(Clone, Default)]
pub struct Transports {
    map: BTreeMap<TransportKind, Arc<dyn Transport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        kind: TransportKind,
        transport: Arc<dyn Transport>,
    ) -> Self {
        self.map.insert(kind, transport);
        self
    }

    /// The transport for `node`'s default transport kind.
    pub fn for_node(
        &self,
        node: &NodeHandle,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.map
            .get(&node.transport_kind())
            .cloned()
            .ok_or(TransportError::UnregisteredKind(node.transport_kind()))
    }
}

/// Quote a word for a POSIX shell command line.
pub(crate) fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':')
        })
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Join argv into a single shell command line, quoting as needed.
pub(crate) fn shell_join(args: &[String]) -> String {
    args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}
