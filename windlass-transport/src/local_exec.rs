// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport that execs directly into local containers.
//!
//! Backends that provision cluster nodes as containers on the
//! orchestrator's own host register the address of each node against its
//! container name here; commands then run through `docker exec` (or
//! another engine binary) with no network handshake at all.

use crate::{
    CommandResult, CommandStream, NodeHandle, RemoteCommand, Transport,
    TransportError, EXIT_TIMED_OUT, EXIT_TRANSPORT_FAILED,
};
use async_trait::async_trait;
use camino::Utf8Path;
use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

pub struct ContainerExecTransport {
    engine: String,
    containers: BTreeMap<IpAddr, String>,
    log: Logger,
}

impl ContainerExecTransport {
    pub fn new(
        log: &Logger,
        containers: BTreeMap<IpAddr, String>,
    ) -> Self {
        Self::with_engine(log, "docker", containers)
    }

    pub fn with_engine(
        log: &Logger,
        engine: impl Into<String>,
        containers: BTreeMap<IpAddr, String>,
    ) -> Self {
        ContainerExecTransport {
            engine: engine.into(),
            containers,
            log: log.new(o!("component" => "ContainerExecTransport")),
        }
    }

    fn container_for(
        &self,
        node: &NodeHandle,
    ) -> Result<&str, TransportError> {
        self.containers
            .get(&node.public_ip())
            .map(String::as_str)
            .ok_or(TransportError::UnknownContainer {
                addr: node.public_ip(),
            })
    }

    fn exec_command(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<tokio::process::Command, TransportError> {
        command.validate()?;
        let container = self.container_for(node)?;
        let mut cmd = tokio::process::Command::new(&self.engine);
        cmd.arg("exec");
        if command.pty {
            cmd.arg("--tty");
        }
        cmd.args(["--user", command.principal_for(node)]);
        for (k, v) in &command.env {
            cmd.arg("--env").arg(format!("{k}={v}"));
        }
        cmd.arg(container);
        cmd.args(&command.args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The per-operation timeout drops the wait future; the child
            // must die with it rather than linger.
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn_err(
        &self,
        node: &NodeHandle,
        e: std::io::Error,
    ) -> TransportError {
        TransportError::Connect {
            addr: node.public_ip(),
            source: Box::new(e),
        }
    }
}

#[async_trait]
impl Transport for ContainerExecTransport {
    async fn run(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandResult, TransportError> {
        let mut cmd = self.exec_command(node, command)?;
        let mut child =
            cmd.spawn().map_err(|e| self.spawn_err(node, e))?;
        let pid = child.id();
        debug!(self.log, "exec"; "node" => %node, "pid" => pid);

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let collect = async move {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stdout).await;
                    }
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stderr).await;
                    }
                },
            );
            (status, stdout, stderr)
        };

        let (status, stdout, stderr) = match command.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, collect).await {
                    Ok(finished) => finished,
                    Err(_) => {
                        // Dropping the future killed the child
                        // (kill_on_drop).
                        let mut result = CommandResult::timed_out(
                            node.clone(),
                            command.args.clone(),
                            timeout,
                        );
                        result.pid = pid;
                        return command.finish(result);
                    }
                }
            }
            None => collect.await,
        };
        let status = status.map_err(|e| self.spawn_err(node, e))?;

        let result = CommandResult {
            node: node.clone(),
            args: command.args.clone(),
            stdout: if command.capture { stdout } else { Vec::new() },
            stderr: if command.capture { stderr } else { Vec::new() },
            exit_code: status.code().unwrap_or(EXIT_TRANSPORT_FAILED),
            pid,
        };
        command.finish(result)
    }

    async fn open_pipe(
        &self,
        node: &NodeHandle,
        command: &RemoteCommand,
    ) -> Result<CommandStream, TransportError> {
        let mut cmd = self.exec_command(node, command)?;
        let mut child =
            cmd.spawn().map_err(|e| self.spawn_err(node, e))?;
        let pid = child.id();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let (tx, rx) = mpsc::channel(16);
        let node = node.clone();
        let args = command.args.clone();
        let done = tokio::spawn(async move {
            let mut stderr = Vec::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let mut buf = [0u8; 4096];
                        loop {
                            match pipe.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if tx.send(buf[..n].to_vec()).await.is_err()
                                    {
                                        // Caller stopped listening; drain
                                        // silently until exit.
                                        let mut sink = Vec::new();
                                        let _ = pipe
                                            .read_to_end(&mut sink)
                                            .await;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stderr).await;
                    }
                },
            );
            let exit_code = match status {
                Ok(status) => status.code().unwrap_or(EXIT_TRANSPORT_FAILED),
                Err(_) => EXIT_TRANSPORT_FAILED,
            };
            Ok(CommandResult {
                node,
                args,
                stdout: Vec::new(),
                stderr,
                exit_code,
                pid,
            })
        });
        Ok(CommandStream::new(rx, done))
    }

    async fn send_file(
        &self,
        node: &NodeHandle,
        local: &Utf8Path,
        remote: &Utf8Path,
        _principal: &str,
    ) -> Result<(), TransportError> {
        let container = self.container_for(node)?;
        // `<engine> cp` recurses over directories on its own.
        let output = tokio::process::Command::new(&self.engine)
            .args([
                "cp",
                local.as_str(),
                &format!("{container}:{remote}"),
            ])
            .output()
            .await
            .map_err(|e| self.spawn_err(node, e))?;
        if !output.status.success() {
            return Err(TransportError::Upload {
                addr: node.public_ip(),
                local: local.to_owned(),
                remote: remote.to_owned(),
                source: String::from_utf8_lossy(&output.stderr)
                    .into_owned()
                    .into(),
            });
        }
        Ok(())
    }

    async fn download_file(
        &self,
        node: &NodeHandle,
        remote: &Utf8Path,
        local: &Utf8Path,
        _principal: &str,
    ) -> Result<(), TransportError> {
        let container = self.container_for(node)?;
        let output = tokio::process::Command::new(&self.engine)
            .args([
                "cp",
                &format!("{container}:{remote}"),
                local.as_str(),
            ])
            .output()
            .await
            .map_err(|e| self.spawn_err(node, e))?;
        if !output.status.success() {
            return Err(TransportError::Download {
                addr: node.public_ip(),
                remote: remote.to_owned(),
                local: local.to_owned(),
                source: String::from_utf8_lossy(&output.stderr)
                    .into_owned()
                    .into(),
            });
        }
        Ok(())
    }
}
