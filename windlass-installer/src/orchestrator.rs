// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::genconf::{self, ExtraFile};
use crate::stage::{InstallationStage, StageStore};
use crate::{InstallError, StageFailure};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use windlass_common::retry::RetryPolicy;
use windlass_dispatch::{DispatchOptions, Dispatcher, Operation};
use windlass_transport::{
    ClusterNodes, CommandResult, NodeHandle, RemoteCommand, Role,
};

/// Name the install bundle is staged under in the working directory.
pub const BUNDLE_FILENAME: &str = "install_bundle.sh";

/// Name of the per-node install script staged on every target node.
pub const NODE_SCRIPT_FILENAME: &str = "node_install.sh";

/// Where the bundle's generate-configuration mode leaves the per-node
/// script, relative to the working directory.
const GENERATED_NODE_SCRIPT: &str = "genconf/serve/node_install.sh";

/// Everything the caller supplies for one installation run. The
/// configuration map, extra files, and address-detection script come from
/// configuration/CLI layers outside this crate.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Local path to the self-extracting install bundle.
    pub artifact: Utf8PathBuf,
    /// Key/value configuration merged into the generated cluster
    /// configuration. Role lists are injected on top of this.
    pub config: serde_json::Map<String, serde_json::Value>,
    pub extra_files: Vec<ExtraFile>,
    /// Backend-appropriate script for a node to detect its own address.
    pub ip_detect: Utf8PathBuf,
    /// Stable run identifier; names the per-run working directory on the
    /// nodes. Callers that want to resume a failed run must pass the same
    /// id again. Defaults to a fresh UUID.
    pub run_id: Option<String>,
    /// Bound on simultaneously open transport sessions per stage.
    /// Defaults to the target count of each dispatch.
    pub concurrency: Option<usize>,
    /// Per-node timeout for each remote operation.
    pub operation_timeout: Option<Duration>,
    /// Retry policy for the per-node postflight poll.
    pub postflight_policy: RetryPolicy,
    /// Override for the node-local completion check. Defaults to invoking
    /// the staged node script in postflight mode.
    pub postflight_command: Option<Vec<String>>,
}

impl InstallConfig {
    pub fn new(
        artifact: impl Into<Utf8PathBuf>,
        ip_detect: impl Into<Utf8PathBuf>,
    ) -> Self {
        InstallConfig {
            artifact: artifact.into(),
            config: serde_json::Map::new(),
            extra_files: Vec::new(),
            ip_detect: ip_detect.into(),
            run_id: None,
            concurrency: None,
            operation_timeout: None,
            postflight_policy: RetryPolicy::service_start(),
            postflight_command: None,
        }
    }
}

pub struct Installer {
    dispatcher: Dispatcher,
    stage_store: Option<Box<dyn StageStore>>,
    log: Logger,
}

impl Installer {
    pub fn new(dispatcher: Dispatcher, log: &Logger) -> Self {
        Installer {
            dispatcher,
            stage_store: None,
            log: log.new(o!("component" => "Installer")),
        }
    }

    /// Persist completed stages, and skip stages a prior attempt already
    /// completed, through `store`.
    pub fn with_stage_store(mut self, store: Box<dyn StageStore>) -> Self {
        self.stage_store = Some(store);
        self
    }

    /// Run the full installation protocol against `nodes`.
    ///
    /// Stages run strictly in order and never re-run within one
    /// invocation; the first stage with any failing node aborts the run
    /// with a [`StageFailure`] carrying that stage's per-node results.
    pub async fn install(
        &self,
        nodes: &ClusterNodes,
        config: &InstallConfig,
    ) -> Result<(), InstallError> {
        if nodes.masters.is_empty() {
            return Err(InstallError::NoMasters);
        }
        let bootstrap = nodes
            .bootstrap_node()
            .cloned()
            .ok_or(InstallError::NoMasters)?;
        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let workdir = Utf8PathBuf::from(format!("/opt/windlass/{run_id}"));
        let log = self.log.new(o!("run" => run_id));

        let completed = match &self.stage_store {
            Some(store) => {
                store.load().await.map_err(InstallError::StageStore)?
            }
            None => None,
        };
        if let Some(stage) = completed {
            info!(log, "resuming prior run"; "last_completed" => %stage);
        }

        for stage in InstallationStage::ALL {
            if completed.is_some_and(|done| stage <= done) {
                info!(log, "skipping completed stage"; "stage" => %stage);
                continue;
            }
            info!(
                log, "stage starting";
                "stage" => %stage,
                "nodes" => nodes.all_nodes().len(),
            );
            match stage {
                InstallationStage::Setup => {
                    self.setup(nodes, &bootstrap, config, &workdir).await?
                }
                InstallationStage::Genconf => {
                    self.genconf(nodes, &bootstrap, config, &workdir).await?
                }
                InstallationStage::Preflight => {
                    self.preflight(nodes, config, &workdir).await?
                }
                InstallationStage::Deploy => {
                    self.deploy(nodes, config, &workdir).await?
                }
                InstallationStage::Postflight => {
                    self.postflight(nodes, config, &workdir).await?
                }
            }
            info!(log, "stage complete"; "stage" => %stage);
            if let Some(store) = &self.stage_store {
                store.save(stage).await.map_err(InstallError::StageStore)?;
            }
        }
        info!(log, "installation complete");
        Ok(())
    }

    fn options(&self, config: &InstallConfig) -> DispatchOptions {
        DispatchOptions {
            limit: config.concurrency,
            timeout: config.operation_timeout,
        }
    }

    /// Stage the install bundle: a private per-run working directory on
    /// every node (concurrent runs on the same hosts must not collide),
    /// the bundle itself on the bootstrap node only.
    async fn setup(
        &self,
        nodes: &ClusterNodes,
        bootstrap: &NodeHandle,
        config: &InstallConfig,
        workdir: &Utf8Path,
    ) -> Result<(), InstallError> {
        let all = nodes.all_nodes();
        let mkdir = RemoteCommand::new([
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "sudo mkdir -p {workdir} && sudo chown \"$(id -un)\" {workdir}"
            ),
        ]);
        let results = self
            .dispatcher
            .dispatch(&all, &Operation::Run(mkdir), &self.options(config))
            .await;
        self.ensure_stage(InstallationStage::Setup, results).await?;

        let send = Operation::SendFile {
            local: config.artifact.clone(),
            remote: workdir.join(BUNDLE_FILENAME),
        };
        let results = self
            .dispatcher
            .dispatch(
                &BTreeSet::from([bootstrap.clone()]),
                &send,
                &self.options(config),
            )
            .await;
        self.ensure_stage(InstallationStage::Setup, results).await?;
        Ok(())
    }

    /// Generate the cluster configuration on the bootstrap node, then
    /// stage the resulting per-node install script on every target node.
    async fn genconf(
        &self,
        nodes: &ClusterNodes,
        bootstrap: &NodeHandle,
        config: &InstallConfig,
        workdir: &Utf8Path,
    ) -> Result<(), InstallError> {
        let scratch =
            camino_tempfile::tempdir().map_err(InstallError::Scratch)?;
        let local_genconf = scratch.path().join("genconf");
        genconf::materialize(
            &local_genconf,
            &config.config,
            &config.ip_detect,
            &config.extra_files,
            nodes,
        )?;

        let bootstrap_only = BTreeSet::from([bootstrap.clone()]);
        let results = self
            .dispatcher
            .dispatch(
                &bootstrap_only,
                &Operation::SendFile {
                    local: local_genconf,
                    remote: workdir.join("genconf"),
                },
                &self.options(config),
            )
            .await;
        self.ensure_stage(InstallationStage::Genconf, results).await?;

        let generate = RemoteCommand::new([
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cd {workdir} && sudo bash {BUNDLE_FILENAME} --generate-config"
            ),
        ]);
        let results = self
            .dispatcher
            .dispatch(
                &bootstrap_only,
                &Operation::Run(generate),
                &self.options(config),
            )
            .await;
        self.ensure_stage(InstallationStage::Genconf, results).await?;

        // No artifact server is assumed: pull the generated script back
        // and push it to every node ourselves.
        let transport = self.dispatcher.transports().for_node(bootstrap)?;
        let local_script = scratch.path().join(NODE_SCRIPT_FILENAME);
        transport
            .download_file(
                bootstrap,
                &workdir.join(GENERATED_NODE_SCRIPT),
                &local_script,
                bootstrap.principal(),
            )
            .await?;
        let results = self
            .dispatcher
            .dispatch(
                &nodes.all_nodes(),
                &Operation::SendFile {
                    local: local_script,
                    remote: workdir.join(NODE_SCRIPT_FILENAME),
                },
                &self.options(config),
            )
            .await;
        self.ensure_stage(InstallationStage::Genconf, results).await?;
        Ok(())
    }

    /// Read-only validation on every node before anything is mutated.
    async fn preflight(
        &self,
        nodes: &ClusterNodes,
        config: &InstallConfig,
        workdir: &Utf8Path,
    ) -> Result<(), InstallError> {
        let script = workdir.join(NODE_SCRIPT_FILENAME);
        let command = RemoteCommand::new([
            "bash",
            script.as_str(),
            "--preflight",
        ])
        .sudo();
        let results = self
            .dispatcher
            .dispatch(
                &nodes.all_nodes(),
                &Operation::Run(command),
                &self.options(config),
            )
            .await;
        self.ensure_stage(InstallationStage::Preflight, results).await?;
        Ok(())
    }

    /// Run the role-specific install on each partition, concurrently
    /// across roles. Any single node failing fails the stage; there is no
    /// partial rollback.
    async fn deploy(
        &self,
        nodes: &ClusterNodes,
        config: &InstallConfig,
        workdir: &Utf8Path,
    ) -> Result<(), InstallError> {
        let script = workdir.join(NODE_SCRIPT_FILENAME);
        let options = self.options(config);
        let command_for = |role: Role| {
            Operation::Run(
                RemoteCommand::new([
                    "bash",
                    script.as_str(),
                    role.install_argument(),
                ])
                .sudo(),
            )
        };
        let master_command = command_for(Role::Master);
        let agent_command = command_for(Role::Agent);
        let public_agent_command = command_for(Role::PublicAgent);
        let (masters, agents, public_agents) = tokio::join!(
            self.dispatcher.dispatch(
                &nodes.masters,
                &master_command,
                &options,
            ),
            self.dispatcher.dispatch(
                &nodes.agents,
                &agent_command,
                &options,
            ),
            self.dispatcher.dispatch(
                &nodes.public_agents,
                &public_agent_command,
                &options,
            ),
        );
        let mut results = masters;
        results.extend(agents);
        results.extend(public_agents);
        self.ensure_stage(InstallationStage::Deploy, results).await?;
        Ok(())
    }

    /// Poll every node until it reports local installation completion.
    /// This is node-local only; network-facing readiness belongs to the
    /// prober.
    async fn postflight(
        &self,
        nodes: &ClusterNodes,
        config: &InstallConfig,
        workdir: &Utf8Path,
    ) -> Result<(), InstallError> {
        let script = workdir.join(NODE_SCRIPT_FILENAME);
        let command = match &config.postflight_command {
            Some(args) => RemoteCommand::new(args.clone()),
            None => RemoteCommand::new([
                "bash",
                script.as_str(),
                "--postflight",
            ])
            .sudo(),
        };
        let policy = config.postflight_policy;
        let start = Instant::now();
        let mut remaining = nodes.all_nodes();
        loop {
            let results = self
                .dispatcher
                .dispatch(
                    &remaining,
                    &Operation::Run(command.clone()),
                    &self.options(config),
                )
                .await;
            let still_failing: BTreeSet<NodeHandle> = results
                .iter()
                .filter(|result| !result.success())
                .map(|result| result.node.clone())
                .collect();
            if still_failing.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= policy.max_wait {
                // Guaranteed to fail: still_failing is non-empty.
                return self
                    .ensure_stage(InstallationStage::Postflight, results)
                    .await;
            }
            remaining = still_failing;
            tokio::time::sleep(policy.interval).await;
        }
    }

    /// Escalate a stage with failures into a [`StageFailure`], attaching
    /// best-effort journal tails from the failing nodes.
    async fn ensure_stage(
        &self,
        stage: InstallationStage,
        results: Vec<CommandResult>,
    ) -> Result<(), InstallError> {
        if results.iter().all(CommandResult::success) {
            return Ok(());
        }
        let failing: Vec<NodeHandle> = results
            .iter()
            .filter(|result| !result.success())
            .map(|result| result.node.clone())
            .collect();
        let diagnostics = self.capture_diagnostics(&failing).await;
        Err(StageFailure { stage, results, diagnostics }.into())
    }

    async fn capture_diagnostics(
        &self,
        failing: &[NodeHandle],
    ) -> BTreeMap<IpAddr, String> {
        let mut diagnostics = BTreeMap::new();
        for node in failing {
            let Ok(transport) = self.dispatcher.transports().for_node(node)
            else {
                continue;
            };
            let command = RemoteCommand::new([
                "journalctl",
                "-n",
                "100",
                "--no-pager",
            ])
            .sudo()
            .allow_failure()
            .timeout(Duration::from_secs(30));
            if let Ok(result) = transport.run(node, &command).await {
                if result.success() {
                    diagnostics.insert(
                        node.public_ip(),
                        result.stdout_str().into_owned(),
                    );
                }
            }
        }
        diagnostics
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stage::StageStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex;
    use windlass_transport::{
        CommandStream, Transport, TransportError, TransportKind, Transports,
    };

    /// Transport that records every operation and fails commands matching
    /// injected substrings.
    #[derive(Default)]
    struct ScriptedTransport {
        runs: Mutex<Vec<(IpAddr, Vec<String>)>>,
        copies: Mutex<Vec<(IpAddr, String, String)>>,
        fail_matching: Mutex<Vec<(String, Option<IpAddr>)>>,
    }

    impl ScriptedTransport {
        fn fail_on(&self, needle: &str, node: Option<IpAddr>) {
            self.fail_matching
                .lock()
                .unwrap()
                .push((needle.to_string(), node));
        }

        fn runs_matching(&self, needle: &str) -> Vec<(IpAddr, Vec<String>)> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, args)| args.join(" ").contains(needle))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn run(
            &self,
            node: &NodeHandle,
            command: &RemoteCommand,
        ) -> Result<CommandResult, TransportError> {
            self.runs
                .lock()
                .unwrap()
                .push((node.public_ip(), command.args.clone()));
            let line = command.args.join(" ");
            let failed = self.fail_matching.lock().unwrap().iter().any(
                |(needle, addr)| {
                    line.contains(needle)
                        && addr.map_or(true, |a| a == node.public_ip())
                },
            );
            let result = CommandResult {
                node: node.clone(),
                args: command.args.clone(),
                stdout: b"journal tail".to_vec(),
                stderr: if failed {
                    b"scripted failure".to_vec()
                } else {
                    Vec::new()
                },
                exit_code: if failed { 1 } else { 0 },
                pid: None,
            };
            command.finish(result)
        }

        async fn open_pipe(
            &self,
            _node: &NodeHandle,
            _command: &RemoteCommand,
        ) -> Result<CommandStream, TransportError> {
            unimplemented!("not exercised by installer tests")
        }

        async fn send_file(
            &self,
            node: &NodeHandle,
            local: &Utf8Path,
            remote: &Utf8Path,
            _principal: &str,
        ) -> Result<(), TransportError> {
            self.copies.lock().unwrap().push((
                node.public_ip(),
                local.to_string(),
                remote.to_string(),
            ));
            Ok(())
        }

        async fn download_file(
            &self,
            node: &NodeHandle,
            remote: &Utf8Path,
            local: &Utf8Path,
            _principal: &str,
        ) -> Result<(), TransportError> {
            self.copies.lock().unwrap().push((
                node.public_ip(),
                remote.to_string(),
                local.to_string(),
            ));
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct MemoryStageStore {
        resume_from: Option<InstallationStage>,
        saved: Arc<Mutex<Vec<InstallationStage>>>,
    }

    #[async_trait]
    impl StageStore for MemoryStageStore {
        async fn save(
            &self,
            stage: InstallationStage,
        ) -> Result<(), TransportError> {
            self.saved.lock().unwrap().push(stage);
            Ok(())
        }

        async fn load(
            &self,
        ) -> Result<Option<InstallationStage>, TransportError> {
            Ok(self.resume_from)
        }
    }

    fn node(last_octet: u8) -> NodeHandle {
        let addr: IpAddr =
            format!("10.0.0.{last_octet}").parse().unwrap();
        NodeHandle::for_testing(addr, addr)
    }

    fn cluster() -> ClusterNodes {
        ClusterNodes {
            masters: [node(1), node(2), node(3)].into_iter().collect(),
            agents: [node(11), node(12)].into_iter().collect(),
            public_agents: [node(21)].into_iter().collect(),
            bootstrap: None,
        }
    }

    fn test_config(scratch: &Utf8Path) -> InstallConfig {
        let artifact = scratch.join("bundle.sh");
        let ip_detect = scratch.join("ip-detect");
        std::fs::write(&artifact, "#!/bin/bash\n").unwrap();
        std::fs::write(&ip_detect, "#!/bin/sh\nhostname -i\n").unwrap();
        let mut config = InstallConfig::new(artifact, ip_detect);
        config.run_id = Some("test-run".to_string());
        config.postflight_policy = RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(50),
        );
        config
    }

    fn installer(
        transport: Arc<ScriptedTransport>,
        store: Option<Box<dyn StageStore>>,
    ) -> Installer {
        let transports = Transports::new()
            .register(TransportKind::Ssh, transport as Arc<dyn Transport>);
        let log = windlass_common::log::test_logger();
        let dispatcher = Dispatcher::new(transports, &log);
        let mut installer = Installer::new(dispatcher, &log);
        if let Some(store) = store {
            installer = installer.with_stage_store(store);
        }
        installer
    }

    #[tokio::test]
    async fn test_full_run_partitions_roles() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let installer = installer(Arc::clone(&transport), None);
        let nodes = cluster();

        installer
            .install(&nodes, &test_config(scratch.path()))
            .await
            .unwrap();

        // Genconf ran exactly once, on the bootstrap node (first master).
        let genconf = transport.runs_matching("--generate-config");
        assert_eq!(genconf.len(), 1);
        assert_eq!(genconf[0].0, "10.0.0.1".parse::<IpAddr>().unwrap());

        // Preflight and postflight hit all six nodes.
        assert_eq!(transport.runs_matching("--preflight").len(), 6);
        assert_eq!(transport.runs_matching("--postflight").len(), 6);

        // Deploy used the right script variant per role partition.
        let deploys =
            transport.runs_matching("node_install.sh master");
        assert_eq!(deploys.len(), 3);
        assert!(deploys.iter().all(|(addr, _)| {
            nodes.masters.iter().any(|n| n.public_ip() == *addr)
        }));
        assert_eq!(
            transport.runs_matching("node_install.sh agent").len(),
            2
        );
        assert_eq!(
            transport.runs_matching("node_install.sh public_agent").len(),
            1
        );

        // The install bundle went to the bootstrap node only; the node
        // script went everywhere.
        let copies = transport.copies.lock().unwrap();
        let bundle_copies: Vec<_> = copies
            .iter()
            .filter(|(_, _, dest)| dest.ends_with(BUNDLE_FILENAME))
            .collect();
        assert_eq!(bundle_copies.len(), 1);
        let staged_script =
            format!("/opt/windlass/test-run/{NODE_SCRIPT_FILENAME}");
        let script_copies: Vec<_> = copies
            .iter()
            .filter(|(_, _, dest)| dest == &staged_script)
            .collect();
        assert_eq!(script_copies.len(), 6);
    }

    #[tokio::test]
    async fn test_preflight_failure_aborts_before_deploy() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .fail_on("--preflight", Some("10.0.0.12".parse().unwrap()));
        let installer = installer(Arc::clone(&transport), None);

        let err = installer
            .install(&cluster(), &test_config(scratch.path()))
            .await
            .unwrap_err();
        let InstallError::Stage(failure) = err else {
            panic!("expected stage failure, got {err}");
        };
        assert_eq!(failure.stage, InstallationStage::Preflight);
        assert_eq!(failure.results.len(), 6);
        assert_eq!(failure.failed_results().count(), 1);
        // Journal capture ran for the failing node.
        assert!(failure
            .diagnostics
            .contains_key(&"10.0.0.12".parse::<IpAddr>().unwrap()));

        // Deploy was never invoked on any node.
        assert_eq!(
            transport.runs_matching("node_install.sh master").len(),
            0
        );
        assert_eq!(
            transport.runs_matching("node_install.sh agent").len(),
            0
        );
    }

    #[tokio::test]
    async fn test_deploy_failure_does_not_rerun_earlier_stages() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_on("node_install.sh agent", None);
        let store = Box::new(MemoryStageStore::default());
        let installer = installer(Arc::clone(&transport), Some(store));

        let err = installer
            .install(&cluster(), &test_config(scratch.path()))
            .await
            .unwrap_err();
        let InstallError::Stage(failure) = err else {
            panic!("expected stage failure, got {err}");
        };
        assert_eq!(failure.stage, InstallationStage::Deploy);

        // Genconf was not re-entered after the deploy failure.
        assert_eq!(transport.runs_matching("--generate-config").len(), 1);
        assert_eq!(transport.runs_matching("--preflight").len(), 6);
    }

    #[tokio::test]
    async fn test_stage_saves_advance_monotonically() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let store = MemoryStageStore::default();
        let installer =
            installer(Arc::clone(&transport), Some(Box::new(store.clone())));

        installer
            .install(&cluster(), &test_config(scratch.path()))
            .await
            .unwrap();

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved, InstallationStage::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_stages() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let store = Box::new(MemoryStageStore {
            resume_from: Some(InstallationStage::Preflight),
            ..Default::default()
        });
        let installer = installer(Arc::clone(&transport), Some(store));

        installer
            .install(&cluster(), &test_config(scratch.path()))
            .await
            .unwrap();

        // Setup, genconf, and preflight were all skipped.
        assert!(transport.copies.lock().unwrap().is_empty());
        assert_eq!(transport.runs_matching("--generate-config").len(), 0);
        assert_eq!(transport.runs_matching("--preflight").len(), 0);
        // Deploy and postflight still ran.
        assert_eq!(
            transport.runs_matching("node_install.sh master").len(),
            3
        );
        assert_eq!(transport.runs_matching("--postflight").len(), 6);
    }

    #[tokio::test]
    async fn test_postflight_retries_until_success() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_on("--postflight", None);
        let installer = installer(Arc::clone(&transport), None);

        let err = installer
            .install(&cluster(), &test_config(scratch.path()))
            .await
            .unwrap_err();
        let InstallError::Stage(failure) = err else {
            panic!("expected stage failure, got {err}");
        };
        assert_eq!(failure.stage, InstallationStage::Postflight);
        // The poll loop retried at least once before giving up.
        assert!(transport.runs_matching("--postflight").len() > 6);
    }
}
