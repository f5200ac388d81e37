// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded fan-out of one operation across many nodes.
//!
//! A dispatch runs the same logical operation against every target node on
//! its own tokio task, with at most `limit` transport sessions in flight at
//! once. The admission permit is acquired before the session opens and
//! released when the operation completes, so the bound holds for sessions,
//! not just spawned tasks.
//!
//! A dispatch never escalates: it always returns exactly one
//! [`CommandResult`] per target, with timeouts and transport failures
//! encoded as sentinel exit codes. Escalation policy belongs to the caller.

use camino::Utf8PathBuf;
use slog::{debug, o, warn, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use windlass_transport::{
    CommandResult, NodeHandle, RemoteCommand, Transports,
};

/// The operation a dispatch fans out.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Run a command on every target.
    Run(RemoteCommand),
    /// Copy a local path (file or directory) to every target.
    SendFile { local: Utf8PathBuf, remote: Utf8PathBuf },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Maximum simultaneously open transport sessions. Defaults to the
    /// target count; callers fanning out to hundreds of nodes must supply
    /// an explicit smaller limit.
    pub limit: Option<usize>,
    /// Per-target timeout. On expiry the in-flight remote process is
    /// killed and the target's result records [`EXIT_TIMED_OUT`]
    /// (windlass_transport) rather than hanging the whole dispatch.
    pub timeout: Option<Duration>,
}

pub struct Dispatcher {
    transports: Transports,
    log: Logger,
}

impl Dispatcher {
    pub fn new(transports: Transports, log: &Logger) -> Self {
        Dispatcher {
            transports,
            log: log.new(o!("component" => "Dispatcher")),
        }
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    /// Run `operation` against every node in `targets`.
    ///
    /// Returns one result per target. Results are unordered with respect to
    /// target submission; attribute per-target results through
    /// [`CommandResult::node`], never list position.
    pub async fn dispatch(
        &self,
        targets: &BTreeSet<NodeHandle>,
        operation: &Operation,
        options: &DispatchOptions,
    ) -> Vec<CommandResult> {
        let limit = options.limit.unwrap_or(targets.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set: JoinSet<CommandResult> = JoinSet::new();

        debug!(
            self.log, "dispatching";
            "targets" => targets.len(),
            "limit" => limit,
        );
        for node in targets {
            let node = node.clone();
            let operation = operation.clone();
            let timeout = options.timeout;
            let transports = self.transports.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("we never close the semaphore");
                let result =
                    run_one(&transports, node, operation, timeout).await;
                drop(permit);
                result
            });
        }

        let mut results = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            let result = joined.expect("dispatch task panicked");
            if !result.success() {
                warn!(
                    self.log, "target failed";
                    "node" => %result.node,
                    "exit_code" => result.exit_code,
                );
            }
            results.push(result);
        }
        results
    }
}

async fn run_one(
    transports: &Transports,
    node: NodeHandle,
    operation: Operation,
    timeout: Option<Duration>,
) -> CommandResult {
    let transport = match transports.for_node(&node) {
        Ok(transport) => transport,
        Err(e) => {
            return CommandResult::transport_failure(node, args_of(&operation), &e);
        }
    };
    match operation {
        Operation::Run(command) => {
            // The dispatcher reports failures through results; raising is
            // the caller's prerogative.
            let mut command = command.allow_failure();
            if command.timeout.is_none() {
                command.timeout = timeout;
            }
            // The transport gets the timeout so it can signal the remote
            // process to die; the outer timeout is the backstop in case the
            // session itself stops responding.
            let run = transport.run(&node, &command);
            let outcome = match command.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return CommandResult::timed_out(
                            node,
                            command.args.clone(),
                            limit,
                        );
                    }
                },
                None => run.await,
            };
            match outcome {
                Ok(result) => result,
                Err(e) => CommandResult::transport_failure(
                    node,
                    command.args.clone(),
                    &e,
                ),
            }
        }
        Operation::SendFile { local, remote } => {
            let args = vec![
                "send-file".to_string(),
                local.to_string(),
                remote.to_string(),
            ];
            let principal = node.principal().to_string();
            let copy = transport.send_file(&node, &local, &remote, &principal);
            let outcome = match timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, copy).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            return CommandResult::timed_out(
                                node, args, timeout,
                            );
                        }
                    }
                }
                None => copy.await,
            };
            match outcome {
                Ok(()) => CommandResult {
                    node,
                    args,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    exit_code: 0,
                    pid: None,
                },
                Err(e) => CommandResult::transport_failure(node, args, &e),
            }
        }
    }
}

fn args_of(operation: &Operation) -> Vec<String> {
    match operation {
        Operation::Run(command) => command.args.clone(),
        Operation::SendFile { local, remote } => vec![
            "send-file".to_string(),
            local.to_string(),
            remote.to_string(),
        ],
    }
}
