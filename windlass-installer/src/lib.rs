// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The installation orchestrator: drives role-partitioned node sets
//! through the fixed protocol Setup → Genconf → Preflight → Deploy →
//! Postflight, strictly forward-only, failing loudly with every per-node
//! result on the first stage that goes wrong.

use camino::Utf8PathBuf;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use windlass_transport::{CommandResult, TransportError};

pub mod genconf;
mod orchestrator;
pub mod stage;

pub use genconf::ExtraFile;
pub use orchestrator::{InstallConfig, Installer};
pub use stage::{InstallationStage, RemoteMarkerStore, StageStore};

/// One or more nodes failed an installation stage.
///
/// Carries every per-node result from the stage plus best-effort system
/// journal tails from the failing nodes, so a human can diagnose without
/// re-running.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: InstallationStage,
    /// All results from the stage, successes included.
    pub results: Vec<CommandResult>,
    /// System journal tail per failing node, where capture succeeded.
    pub diagnostics: BTreeMap<IpAddr, String>,
}

impl StageFailure {
    pub fn failed_results(&self) -> impl Iterator<Item = &CommandResult> {
        self.results.iter().filter(|result| !result.success())
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failed_results().count();
        write!(
            f,
            "stage {} failed on {} of {} nodes:",
            self.stage,
            failed,
            self.results.len(),
        )?;
        for result in self.failed_results() {
            write!(
                f,
                " [{} exited {}: {}]",
                result.node,
                result.exit_code,
                result.stderr_str().trim_end(),
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for StageFailure {}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("cluster has no master nodes")]
    NoMasters,

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("writing generated configuration at {path}")]
    Genconf {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serializing cluster configuration")]
    Config(#[source] serde_json::Error),

    #[error("creating local scratch directory")]
    Scratch(#[source] std::io::Error),

    #[error("reading or writing the stage marker")]
    StageStore(#[source] TransportError),
}
