// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installation stages and optional stage persistence.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use windlass_transport::{
    NodeHandle, RemoteCommand, Transport, TransportError,
};

/// One phase of the installation protocol. Ordered; the orchestrator only
/// ever moves forward through these within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallationStage {
    Setup,
    Genconf,
    Preflight,
    Deploy,
    Postflight,
}

impl InstallationStage {
    pub const ALL: [InstallationStage; 5] = [
        InstallationStage::Setup,
        InstallationStage::Genconf,
        InstallationStage::Preflight,
        InstallationStage::Deploy,
        InstallationStage::Postflight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationStage::Setup => "setup",
            InstallationStage::Genconf => "genconf",
            InstallationStage::Preflight => "preflight",
            InstallationStage::Deploy => "deploy",
            InstallationStage::Postflight => "postflight",
        }
    }

    pub fn next(&self) -> Option<InstallationStage> {
        let index =
            Self::ALL.iter().position(|stage| stage == self).unwrap();
        Self::ALL.get(index + 1).copied()
    }
}

impl fmt::Display for InstallationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown installation stage {0:?}")]
pub struct UnknownStage(String);

impl FromStr for InstallationStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Optional persistence of the last completed stage, so a re-invoked run
/// can skip work already done. Advisory: correctness within a single
/// uninterrupted run never depends on it.
#[async_trait]
pub trait StageStore: Send + Sync {
    async fn save(
        &self,
        stage: InstallationStage,
    ) -> Result<(), TransportError>;

    async fn load(
        &self,
    ) -> Result<Option<InstallationStage>, TransportError>;
}

/// Stage marker written to a file on a designated node, typically the
/// bootstrap node, at a caller-chosen stable path.
pub struct RemoteMarkerStore {
    transport: Arc<dyn Transport>,
    node: NodeHandle,
    path: Utf8PathBuf,
}

impl RemoteMarkerStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        node: NodeHandle,
        path: Utf8PathBuf,
    ) -> Self {
        RemoteMarkerStore { transport, node, path }
    }
}

#[async_trait]
impl StageStore for RemoteMarkerStore {
    async fn save(
        &self,
        stage: InstallationStage,
    ) -> Result<(), TransportError> {
        let command = RemoteCommand::new([
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {} && echo {} > {}", parent_of(&self.path), stage, self.path),
        ])
        .sudo();
        self.transport.run(&self.node, &command).await?;
        Ok(())
    }

    async fn load(
        &self,
    ) -> Result<Option<InstallationStage>, TransportError> {
        let command =
            RemoteCommand::new(["cat", self.path.as_str()]).allow_failure();
        let result = self.transport.run(&self.node, &command).await?;
        if !result.success() {
            // No marker yet.
            return Ok(None);
        }
        // A marker we cannot parse is treated as no marker; the store is
        // advisory and a full re-run is always safe.
        Ok(result.stdout_str().trim().parse().ok())
    }
}

fn parent_of(path: &Utf8PathBuf) -> &str {
    path.parent().map(|p| p.as_str()).unwrap_or("/")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(InstallationStage::Setup < InstallationStage::Genconf);
        assert!(InstallationStage::Deploy < InstallationStage::Postflight);
        assert_eq!(
            InstallationStage::Setup.next(),
            Some(InstallationStage::Genconf)
        );
        assert_eq!(InstallationStage::Postflight.next(), None);
    }

    #[test]
    fn test_stage_round_trips_through_marker_text() {
        for stage in InstallationStage::ALL {
            assert_eq!(
                stage.as_str().parse::<InstallationStage>().unwrap(),
                stage
            );
        }
        assert!("not-a-stage".parse::<InstallationStage>().is_err());
    }
}
