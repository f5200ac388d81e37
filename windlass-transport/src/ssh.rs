// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSH transport with a reusable authenticated session per node.
//!
//! Installation issues many sequential commands against each node, so the
//! handshake is negotiated once per (address, principal) and every
//! subsequent command opens a fresh channel on the cached session.

use crate::{
    shell_join, shell_quote, CommandResult, CommandStream, NodeHandle,
    RemoteCommand, Transport, TransportError, EXIT_TIMED_OUT,
    EXIT_TRANSPORT_FAILED,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use russh::client;
use russh::{ChannelMsg, Sig};
use slog::{debug, o, Logger};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Host keys are not verified: nodes are freshly provisioned by a backend
/// we just created them through, and their keys are not known ahead of
/// time.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

type Session = Arc<Mutex<client::Handle<AcceptingHandler>>>;

pub struct SshTransport {
    config: Arc<client::Config>,
    port: u16,
    sessions: Mutex<HashMap<(IpAddr, String), Session>>,
    log: Logger,
}

impl SshTransport {
    pub fn new(log: &Logger) -> Self {
        Self::with_port(log, 22)
    }

    pub fn with_port(log: &Logger, port: u16) -> Self {
        SshTransport {
            config: Arc::new(client::Config::default()),
            port,
            sessions: Mutex::new(HashMap::new()),
            log: log.new(o!("component" => "SshTransport")),
        }
    }

    async fn connect(
        &self,
        node: &NodeHandle,
        principal: &str,
    ) -> Result<client::Handle<AcceptingHandler>, TransportError> {
        let addr = node.public_ip();
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (addr, self.port),
            AcceptingHandler,
        )
        .await
        .map_err(|e| TransportError::Connect { addr, source: Box::new(e) })?;

        let key = russh_keys::load_secret_key(
            node.key_path().as_std_path(),
            None,
        )
        .map_err(|e| TransportError::Auth {
            addr,
            principal: principal.to_string(),
            source: Box::new(e),
        })?;
        let authenticated = handle
            .authenticate_publickey(principal, Arc::new(key))
            .await
            .map_err(|e| TransportError::Auth {
                addr,
                principal: principal.to_string(),
                source: Box::new(e),
            })?;
        if !authenticated {
            return Err(TransportError::AuthRejected {
                addr,
                principal: principal.to_string(),
            });
        }
        debug!(self.log, "negotiated session"; "node" => %addr, "principal" => principal);
        Ok(handle)
    }

    async fn session(
        &self,
        node: &NodeHandle,
        principal: &str,
    ) -> Result<Session, TransportError> {
        let key = (node.public_ip(), principal.to_string());
        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(&key) {
                return Ok(Arc::clone(session));
            }
        }
        // Connect outside the map lock so one slow handshake does not
        // stall commands against other nodes.
        let handle = self.connect(node, principal).await?;
        let session = Arc::new(Mutex::new(handle));
        self.sessions.lock().await.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Open a command channel on the node's cached session, renegotiating
    /// once if the cached session has died (e.g. the host rebooted between
    /// stages).
    async fn open_channel(
        &self,
        node: &NodeHandle,
        principal: &str,
    ) -> Result<russh::Channel<client::Msg>, TransportError> {
        let session = self.session(node, principal).await?;
        let mut guard = session.lock().await;
        match guard.channel_open_session().await {
            Ok(channel) => Ok(channel),
            Err(_) => {
                *guard = self.connect(node, principal).await?;
                guard.channel_open_session().await.map_err(|e| {
                    TransportError::Channel {
                        addr: node.public_ip(),
                        source: Box::new(e),
                    }
                })
            }
        }
    }

    async fn exec_channel(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<russh::Channel<client::Msg>, TransportError> {
        command.validate()?;
        let addr = node.public_ip();
        let mut channel =
            self.open_channel(node, command.principal_for(node)).await?;
        let channel_err = |e: russh::Error| TransportError::Channel {
            addr,
            source: Box::new(e),
        };

        if command.pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(channel_err)?;
        }
        // Environment injection goes through an `env` prefix on the command
        // line rather than the ssh env request, which sshd rejects for
        // variables outside AcceptEnv.
        let mut line = String::new();
        if !command.env.is_empty() {
            line.push_str("env ");
            for (k, v) in &command.env {
                line.push_str(&shell_quote(&format!("{k}={v}")));
                line.push(' ');
            }
        }
        line.push_str(&shell_join(&command.args));
        channel.exec(true, line).await.map_err(channel_err)?;
        Ok(channel)
    }

    async fn upload_one(
        &self,
        node: &NodeHandle,
        principal: &str,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), TransportError> {
        let addr = node.public_ip();
        let upload_err = |source: Box<dyn std::error::Error + Send + Sync>| {
            TransportError::Upload {
                addr,
                local: local.to_owned(),
                remote: remote.to_owned(),
                source,
            }
        };

        let data = tokio::fs::read(local)
            .await
            .map_err(|e| upload_err(Box::new(e)))?;
        let mode = file_mode(local).unwrap_or(0o644);

        let mut channel = self.open_channel(node, principal).await?;
        let parent = remote.parent().unwrap_or(Utf8Path::new("/"));
        let line = format!(
            "mkdir -p {} && cat > {} && chmod {:o} {}",
            shell_quote(parent.as_str()),
            shell_quote(remote.as_str()),
            mode,
            shell_quote(remote.as_str()),
        );
        channel.exec(true, line).await.map_err(|e| upload_err(Box::new(e)))?;
        channel.data(&data[..]).await.map_err(|e| upload_err(Box::new(e)))?;
        channel.eof().await.map_err(|e| upload_err(Box::new(e)))?;

        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                _ => {}
            }
        }
        match exit_code {
            Some(0) => Ok(()),
            code => Err(upload_err(
                format!(
                    "remote write exited with {:?}: {}",
                    code,
                    String::from_utf8_lossy(&stderr)
                )
                .into(),
            )),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandResult, TransportError> {
        let mut channel = self.exec_channel(node, command).await?;
        let deadline =
            command.timeout.map(|t| tokio::time::Instant::now() + t);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        loop {
            let msg = match deadline {
                Some(deadline) => {
                    let waited =
                        tokio::time::timeout_at(deadline, channel.wait())
                            .await;
                    match waited {
                        Ok(msg) => msg,
                        Err(_) => {
                            // Best effort: the session may already be gone.
                            let _ = channel.signal(Sig::KILL).await;
                            stderr.extend_from_slice(
                                format!(
                                    "\nkilled after {:?} timeout",
                                    command.timeout.unwrap()
                                )
                                .as_bytes(),
                            );
                            let result = CommandResult {
                                node: node.clone(),
                                args: command.args.clone(),
                                stdout,
                                stderr,
                                exit_code: EXIT_TIMED_OUT,
                                pid: None,
                            };
                            return command.finish(result);
                        }
                    }
                }
                None => channel.wait().await,
            };
            match msg {
                None => break,
                Some(ChannelMsg::Data { ref data }) => {
                    if command.capture {
                        stdout.extend_from_slice(data);
                    } else {
                        debug!(
                            self.log, "output";
                            "node" => %node,
                            "stdout" => String::from_utf8_lossy(data).trim_end(),
                        );
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    if command.capture {
                        stderr.extend_from_slice(data);
                    } else {
                        debug!(
                            self.log, "output";
                            "node" => %node,
                            "stderr" => String::from_utf8_lossy(data).trim_end(),
                        );
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status as i32);
                }
                Some(_) => {}
            }
        }

        let result = CommandResult {
            node: node.clone(),
            args: command.args.clone(),
            stdout,
            stderr,
            exit_code: exit_code.unwrap_or(EXIT_TRANSPORT_FAILED),
            pid: None,
        };
        command.finish(result)
    }

    async fn open_pipe(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandStream, TransportError> {
        let mut channel = self.exec_channel(node, command).await?;
        let (tx, rx) = mpsc::channel(16);
        let node = node.clone();
        let args = command.args.clone();
        let done = tokio::spawn(async move {
            let mut stderr = Vec::new();
            let mut exit_code = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        // A closed receiver just means the caller stopped
                        // listening; keep draining to collect the exit
                        // status.
                        let _ = tx.send(data.to_vec()).await;
                    }
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    _ => {}
                }
            }
            Ok(CommandResult {
                node,
                args,
                stdout: Vec::new(),
                stderr,
                exit_code: exit_code.unwrap_or(EXIT_TRANSPORT_FAILED),
                pid: None,
            })
        });
        Ok(CommandStream::new(rx, done))
    }

    async fn send_file(
        &self,
        node: &NodeHandle,
        local: &Utf8Path,
        remote: &Utf8Path,
        principal: &str,
    ) -> Result<(), TransportError> {
        let metadata = tokio::fs::metadata(local).await.map_err(|e| {
            TransportError::Upload {
                addr: node.public_ip(),
                local: local.to_owned(),
                remote: remote.to_owned(),
                source: Box::new(e),
            }
        })?;
        if !metadata.is_dir() {
            return self.upload_one(node, principal, local, remote).await;
        }

        // Recursive directory copy: walk the local tree and upload file by
        // file; `upload_one` creates intermediate remote directories.
        let mut pending = vec![(local.to_owned(), remote.to_owned())];
        while let Some((local_dir, remote_dir)) = pending.pop() {
            let mut entries =
                tokio::fs::read_dir(&local_dir).await.map_err(|e| {
                    TransportError::Upload {
                        addr: node.public_ip(),
                        local: local_dir.clone(),
                        remote: remote_dir.clone(),
                        source: Box::new(e),
                    }
                })?;
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        return Err(TransportError::Upload {
                            addr: node.public_ip(),
                            local: local_dir.clone(),
                            remote: remote_dir.clone(),
                            source: Box::new(e),
                        });
                    }
                };
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let local_child = local_dir.join(name.as_ref());
                let remote_child = remote_dir.join(name.as_ref());
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    pending.push((local_child, remote_child));
                } else {
                    self.upload_one(node, principal, &local_child, &remote_child)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn download_file(
        &self,
        node: &NodeHandle,
        remote: &Utf8Path,
        local: &Utf8Path,
        principal: &str,
    ) -> Result<(), TransportError> {
        let addr = node.public_ip();
        let download_err =
            |source: Box<dyn std::error::Error + Send + Sync>| {
                TransportError::Download {
                    addr,
                    remote: remote.to_owned(),
                    local: local.to_owned(),
                    source,
                }
            };

        let mut channel = self.open_channel(node, principal).await?;
        channel
            .exec(true, format!("cat {}", shell_quote(remote.as_str())))
            .await
            .map_err(|e| download_err(Box::new(e)))?;

        let mut data = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data: ref chunk } => {
                    data.extend_from_slice(chunk);
                }
                ChannelMsg::ExtendedData { data: ref chunk, ext: 1 } => {
                    stderr.extend_from_slice(chunk);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                _ => {}
            }
        }
        if exit_code != Some(0) {
            return Err(download_err(
                format!(
                    "remote read exited with {:?}: {}",
                    exit_code,
                    String::from_utf8_lossy(&stderr)
                )
                .into(),
            ));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| download_err(Box::new(e)))?;
        }
        tokio::fs::write(local, data)
            .await
            .map_err(|e| download_err(Box::new(e)))?;
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(path: &Utf8Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Utf8Path) -> Option<u32> {
    None
}
