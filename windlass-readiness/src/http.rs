// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The standard HTTP readiness sequence, probed through the cluster's
//! gateway on the first master's public address.

use crate::{CheckError, ReadinessCheck, ReadinessError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use windlass_common::retry::RetryPolicy;
use windlass_transport::ClusterNodes;

/// The bootstrap identity used for the very first login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials { username: username.into(), password: password.into() }
    }
}

/// What a healthy cluster must look like once installation finishes.
#[derive(Debug, Clone, Copy)]
pub struct Expectations {
    /// Exact number of quorum members.
    pub master_count: usize,
    /// Minimum number of registered agents (stale entries from prior runs
    /// are tolerated, so this is a floor rather than an exact count).
    pub agent_count: usize,
}

impl Expectations {
    pub fn from_nodes(nodes: &ClusterNodes) -> Self {
        Expectations {
            master_count: nodes.masters.len(),
            agent_count: nodes.expected_agent_count(),
        }
    }
}

/// An authenticated HTTP client for the cluster gateway.
///
/// The session token is populated by the login check and reused by every
/// later check, so the checks built by [`standard_checks`] share one client
/// behind an `Arc`.
pub struct ClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

impl ClusterClient {
    pub fn new(gateway: IpAddr) -> Result<Self, ReadinessError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ReadinessError::Client)?;
        Ok(ClusterClient {
            client,
            base_url: format!("http://{}", gateway),
            token: Mutex::new(None),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, CheckError> {
        let mut request = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(token) = self.token.lock().await.as_deref() {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value, CheckError> {
        let response = self.get(path).await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Any HTTP response at all means the gateway is up; an error status
    /// (e.g. 401 before login) still proves reachability.
    pub async fn gateway_reachable(&self) -> Result<(), CheckError> {
        self.get("/").await?;
        Ok(())
    }

    /// Authenticate the bootstrap identity, creating it first if this is
    /// the very first login (the identity provider accepts exactly one
    /// unauthenticated user creation).
    pub async fn login(&self, credentials: &Credentials) -> Result<(), CheckError> {
        let response = self.try_login(credentials).await?;
        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.client
                .put(format!(
                    "{}/acs/api/v1/users/{}",
                    self.base_url, credentials.username
                ))
                .json(&serde_json::json!({
                    "password": credentials.password,
                }))
                .send()
                .await?
                .error_for_status()?;
            self.try_login(credentials).await?
        } else {
            response
        };
        let body: LoginResponse = response.error_for_status()?.json().await?;
        *self.token.lock().await = Some(body.token);
        Ok(())
    }

    async fn try_login(
        &self,
        credentials: &Credentials,
    ) -> Result<reqwest::Response, CheckError> {
        Ok(self
            .client
            .post(format!("{}/acs/api/v1/auth/login", self.base_url))
            .json(&serde_json::json!({
                "uid": credentials.username,
                "password": credentials.password,
            }))
            .send()
            .await?)
    }

    pub async fn scheduler_answering(&self) -> Result<(), CheckError> {
        self.get("/service/marathon/v2/info").await?.error_for_status()?;
        Ok(())
    }

    pub async fn quorum_members(&self) -> Result<BTreeSet<String>, CheckError> {
        let body =
            self.get_json("/exhibitor/exhibitor/v1/cluster/status").await?;
        parse_quorum_members(&body)
    }

    pub async fn active_agents(&self) -> Result<BTreeSet<String>, CheckError> {
        let body = self.get_json("/mesos/master/slaves").await?;
        parse_active_agents(&body)
    }

    pub async fn history_agents(&self) -> Result<BTreeSet<String>, CheckError> {
        let body =
            self.get_json("/dcos-history-service/history/last").await?;
        parse_active_agents(&body)
    }

    pub async fn diagnostics_answering(&self) -> Result<(), CheckError> {
        self.get("/system/health/v1/").await?.error_for_status()?;
        Ok(())
    }

    pub async fn batch_scheduler_answering(&self) -> Result<(), CheckError> {
        self.get("/service/metronome/v1/jobs").await?.error_for_status()?;
        Ok(())
    }
}

/// Distinct quorum members from the configuration store's status document
/// (an array of per-member objects). A member only counts once it reports
/// the "serving" state code.
fn parse_quorum_members(body: &Value) -> Result<BTreeSet<String>, CheckError> {
    let members = body
        .as_array()
        .ok_or("quorum status body is not an array")?;
    let mut serving = BTreeSet::new();
    for member in members {
        let hostname = member
            .get("hostname")
            .and_then(Value::as_str)
            .ok_or("quorum member missing hostname")?;
        // Code 3 is "serving" in the status document.
        if member.get("code").and_then(Value::as_u64) == Some(3) {
            serving.insert(hostname.to_string());
        }
    }
    Ok(serving)
}

/// Hostnames of agents the resource manager reports as active. Used both
/// for the registration check and for the history service's view of the
/// same set.
fn parse_active_agents(body: &Value) -> Result<BTreeSet<String>, CheckError> {
    let slaves = body
        .get("slaves")
        .and_then(Value::as_array)
        .ok_or("agent listing missing slaves array")?;
    let mut active = BTreeSet::new();
    for slave in slaves {
        let hostname = slave
            .get("hostname")
            .and_then(Value::as_str)
            .ok_or("agent entry missing hostname")?;
        if slave.get("active").and_then(Value::as_bool) == Some(true) {
            active.insert(hostname.to_string());
        }
    }
    Ok(active)
}

/// Build the standard check sequence in dependency order. Each check
/// assumes everything before it already passed; the prober evaluates them
/// strictly in this order.
///
/// With `skip_network_checks` set, returns an empty sequence for hosts
/// that cannot route to the cluster's service network (local postflight
/// is then the only validation).
pub fn standard_checks(
    client: Arc<ClusterClient>,
    credentials: Credentials,
    expectations: Expectations,
    skip_network_checks: bool,
) -> Vec<ReadinessCheck> {
    if skip_network_checks {
        return Vec::new();
    }

    let mut checks = Vec::new();

    checks.push(ReadinessCheck::new("gateway-reachable", RetryPolicy::quick(), {
        let client = Arc::clone(&client);
        move || {
            let client = Arc::clone(&client);
            async move { client.gateway_reachable().await }
        }
    }));

    checks.push(ReadinessCheck::new("login", RetryPolicy::service_start(), {
        let client = Arc::clone(&client);
        move || {
            let client = Arc::clone(&client);
            let credentials = credentials.clone();
            async move { client.login(&credentials).await }
        }
    }));

    checks.push(ReadinessCheck::new(
        "scheduler-answering",
        RetryPolicy::service_start(),
        {
            let client = Arc::clone(&client);
            move || {
                let client = Arc::clone(&client);
                async move { client.scheduler_answering().await }
            }
        },
    ));

    checks.push(ReadinessCheck::new(
        "quorum-formed",
        RetryPolicy::service_start(),
        {
            let client = Arc::clone(&client);
            let want = expectations.master_count;
            move || {
                let client = Arc::clone(&client);
                async move {
                    let members = client.quorum_members().await?;
                    if members.len() == want {
                        Ok(())
                    } else {
                        Err(format!(
                            "quorum has {} serving members, want {}",
                            members.len(),
                            want
                        )
                        .into())
                    }
                }
            }
        },
    ));

    checks.push(ReadinessCheck::new(
        "agents-registered",
        RetryPolicy::service_start(),
        {
            let client = Arc::clone(&client);
            let want = expectations.agent_count;
            move || {
                let client = Arc::clone(&client);
                async move {
                    let agents = client.active_agents().await?;
                    if agents.len() >= want {
                        Ok(())
                    } else {
                        Err(format!(
                            "{} agents registered, want at least {}",
                            agents.len(),
                            want
                        )
                        .into())
                    }
                }
            }
        },
    ));

    checks.push(ReadinessCheck::new(
        "diagnostics-answering",
        RetryPolicy::backfill(),
        {
            let client = Arc::clone(&client);
            move || {
                let client = Arc::clone(&client);
                async move { client.diagnostics_answering().await }
            }
        },
    ));

    checks.push(ReadinessCheck::new(
        "batch-scheduler-answering",
        RetryPolicy::backfill(),
        {
            let client = Arc::clone(&client);
            move || {
                let client = Arc::clone(&client);
                async move { client.batch_scheduler_answering().await }
            }
        },
    ));

    // History back-fills asynchronously, so it gets the longest budget and
    // must converge on the resource manager's own view of the agent set.
    checks.push(ReadinessCheck::new(
        "history-reflects-agents",
        RetryPolicy::backfill(),
        {
            let client = Arc::clone(&client);
            move || {
                let client = Arc::clone(&client);
                async move {
                    let live = client.active_agents().await?;
                    let seen = client.history_agents().await?;
                    if seen.is_superset(&live) {
                        Ok(())
                    } else {
                        let missing: Vec<_> = live
                            .difference(&seen)
                            .cloned()
                            .collect();
                        Err(format!(
                            "history has not seen agents {:?}",
                            missing
                        )
                        .into())
                    }
                }
            }
        },
    ));

    checks
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quorum_counts_only_serving_members() {
        let body = json!([
            { "hostname": "10.0.0.1", "code": 3, "isLeader": true },
            { "hostname": "10.0.0.2", "code": 3, "isLeader": false },
            { "hostname": "10.0.0.3", "code": 1, "isLeader": false },
        ]);
        let members = parse_quorum_members(&body).unwrap();
        assert_eq!(members.len(), 2);
        assert!(!members.contains("10.0.0.3"));
    }

    #[test]
    fn test_quorum_rejects_malformed_body() {
        assert!(parse_quorum_members(&json!({"status": "ok"})).is_err());
        assert!(parse_quorum_members(&json!([{ "code": 3 }])).is_err());
    }

    #[test]
    fn test_active_agents_excludes_stale_entries() {
        let body = json!({
            "slaves": [
                { "hostname": "10.0.1.1", "active": true },
                { "hostname": "10.0.1.2", "active": true },
                { "hostname": "10.0.1.3", "active": false },
            ]
        });
        let agents = parse_active_agents(&body).unwrap();
        assert_eq!(
            agents.into_iter().collect::<Vec<_>>(),
            vec!["10.0.1.1", "10.0.1.2"]
        );
    }

    #[test]
    fn test_expectations_from_nodes() {
        use std::net::Ipv4Addr;
        use windlass_transport::NodeHandle;

        fn node(last: u8) -> NodeHandle {
            NodeHandle::for_testing(
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            )
        }

        let nodes = ClusterNodes {
            masters: [node(1), node(2), node(3)].into_iter().collect(),
            agents: [node(11), node(12)].into_iter().collect(),
            public_agents: [node(21)].into_iter().collect(),
            bootstrap: None,
        };
        let expectations = Expectations::from_nodes(&nodes);
        assert_eq!(expectations.master_count, 3);
        assert_eq!(expectations.agent_count, 3);
    }

    #[test]
    fn test_skip_network_checks_yields_no_checks() {
        let client = Arc::new(
            ClusterClient::new(IpAddr::from([192, 0, 2, 1])).unwrap(),
        );
        let checks = standard_checks(
            client,
            Credentials::new("bootstrap", "secret"),
            Expectations { master_count: 1, agent_count: 0 },
            true,
        );
        assert!(checks.is_empty());
    }

    #[test]
    fn test_standard_checks_are_dependency_ordered() {
        let client = Arc::new(
            ClusterClient::new(IpAddr::from([192, 0, 2, 1])).unwrap(),
        );
        let checks = standard_checks(
            client,
            Credentials::new("bootstrap", "secret"),
            Expectations { master_count: 3, agent_count: 3 },
            false,
        );
        let names: Vec<_> = checks.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            [
                "gateway-reachable",
                "login",
                "scheduler-answering",
                "quorum-formed",
                "agents-registered",
                "diagnostics-answering",
                "batch-scheduler-answering",
                "history-reflects-agents",
            ]
        );
    }
}
