// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node handles and role partitions.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// How a node's transport sessions are established.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// A secure shell session over the network.
    Ssh,
    /// Exec directly into a local container.
    ContainerExec,
}

/// The role a node plays in the installed cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Agent,
    PublicAgent,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Master, Role::Agent, Role::PublicAgent];

    /// The argument passed to the per-node install script for this role.
    pub fn install_argument(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "agent",
            Role::PublicAgent => "public_agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.install_argument())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("reading credential file {path}")]
    KeyFile {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "credential file {path} is accessible by other users (mode {mode:03o}); \
         it must be readable only by its owner"
    )]
    KeyFilePermissions { path: Utf8PathBuf, mode: u32 },
}

/// An addressable machine plus what is needed to reach it.
///
/// Equality and hashing cover only the address pair, so a set of handles
/// never silently duplicates a physical machine across role partitions.
/// Immutable for the lifetime of an orchestration run; the owning backend
/// is the only thing that can make a handle unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHandle {
    public_ip: IpAddr,
    private_ip: IpAddr,
    principal: String,
    key_path: Utf8PathBuf,
    transport_kind: TransportKind,
}

impl NodeHandle {
    /// Build a handle for a reachable machine, checking that the private
    /// key it references is readable only by its owner. A key readable by
    /// other users grants them root-equivalent access to the node.
    pub fn new(
        public_ip: IpAddr,
        private_ip: IpAddr,
        principal: impl Into<String>,
        key_path: impl Into<Utf8PathBuf>,
        transport_kind: TransportKind,
    ) -> Result<Self, NodeError> {
        let key_path = key_path.into();
        check_key_permissions(&key_path)?;
        Ok(NodeHandle {
            public_ip,
            private_ip,
            principal: principal.into(),
            key_path,
            transport_kind,
        })
    }

    /// Construct a handle without touching the filesystem. Test-only: the
    /// credential path is not checked or expected to exist.
    #[cfg(any(test, feature = "testing"))]
    pub fn for_testing(public_ip: IpAddr, private_ip: IpAddr) -> Self {
        NodeHandle {
            public_ip,
            private_ip,
            principal: "admin".to_string(),
            key_path: Utf8PathBuf::from("/nonexistent/key"),
            transport_kind: TransportKind::Ssh,
        }
    }

    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    /// The address cluster-internal components use for this node; may
    /// differ from the public address.
    pub fn private_ip(&self) -> IpAddr {
        self.private_ip
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn key_path(&self) -> &Utf8Path {
        &self.key_path
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.public_ip)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        (self.public_ip, self.private_ip)
            == (other.public_ip, other.private_ip)
    }
}

impl Eq for NodeHandle {}

impl PartialOrd for NodeHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.public_ip, self.private_ip)
            .cmp(&(other.public_ip, other.private_ip))
    }
}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.public_ip, self.private_ip).hash(state);
    }
}

#[cfg(unix)]
fn check_key_permissions(path: &Utf8Path) -> Result<(), NodeError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|source| {
        NodeError::KeyFile { path: path.to_owned(), source }
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(NodeError::KeyFilePermissions {
            path: path.to_owned(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &Utf8Path) -> Result<(), NodeError> {
    Ok(())
}

/// Role-partitioned node sets handed over by a backend once its machines
/// are reachable.
#[derive(Debug, Clone, Default)]
pub struct ClusterNodes {
    pub masters: BTreeSet<NodeHandle>,
    pub agents: BTreeSet<NodeHandle>,
    pub public_agents: BTreeSet<NodeHandle>,
    /// Optional dedicated node for staging the install artifact. When
    /// absent, the first master doubles as the bootstrap node.
    pub bootstrap: Option<NodeHandle>,
}

impl ClusterNodes {
    pub fn nodes_for_role(&self, role: Role) -> &BTreeSet<NodeHandle> {
        match role {
            Role::Master => &self.masters,
            Role::Agent => &self.agents,
            Role::PublicAgent => &self.public_agents,
        }
    }

    /// Every node that takes part in installation, across all roles.
    pub fn all_nodes(&self) -> BTreeSet<NodeHandle> {
        let mut all = BTreeSet::new();
        all.extend(self.masters.iter().cloned());
        all.extend(self.agents.iter().cloned());
        all.extend(self.public_agents.iter().cloned());
        all
    }

    /// The node used to stage the install artifact and generated
    /// configuration.
    pub fn bootstrap_node(&self) -> Option<&NodeHandle> {
        self.bootstrap.as_ref().or_else(|| self.masters.iter().next())
    }

    /// Expected worker registrations, derived only from the supplied
    /// partitions. Backends carrying separate count bookkeeping must
    /// reconcile it before handing partitions over.
    pub fn expected_agent_count(&self) -> usize {
        self.agents.len() + self.public_agents.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_equality_ignores_principal() {
        let mut a = NodeHandle::for_testing(addr("10.0.0.1"), addr("10.0.0.2"));
        let mut b = NodeHandle::for_testing(addr("10.0.0.1"), addr("10.0.0.2"));
        a.principal = "alice".to_string();
        b.principal = "bob".to_string();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_handles_with_distinct_addresses_differ() {
        let a = NodeHandle::for_testing(addr("10.0.0.1"), addr("10.0.0.2"));
        let b = NodeHandle::for_testing(addr("10.0.0.1"), addr("10.0.0.3"));
        assert_ne!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = camino_tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "not really a key").unwrap();

        std::fs::set_permissions(
            &key,
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();
        let err = NodeHandle::new(
            addr("10.0.0.1"),
            addr("10.0.0.1"),
            "admin",
            key.clone(),
            TransportKind::Ssh,
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::KeyFilePermissions { .. }));

        std::fs::set_permissions(
            &key,
            std::fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        NodeHandle::new(
            addr("10.0.0.1"),
            addr("10.0.0.1"),
            "admin",
            key,
            TransportKind::Ssh,
        )
        .unwrap();
    }

    #[test]
    fn test_bootstrap_defaults_to_first_master() {
        let master = NodeHandle::for_testing(addr("10.0.0.1"), addr("10.0.0.1"));
        let nodes = ClusterNodes {
            masters: [master.clone()].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(nodes.bootstrap_node(), Some(&master));
        assert_eq!(ClusterNodes::default().bootstrap_node(), None);
    }

    #[test]
    fn test_expected_agent_count() {
        let nodes = ClusterNodes {
            agents: [
                NodeHandle::for_testing(addr("10.0.1.1"), addr("10.0.1.1")),
                NodeHandle::for_testing(addr("10.0.1.2"), addr("10.0.1.2")),
            ]
            .into_iter()
            .collect(),
            public_agents: [NodeHandle::for_testing(
                addr("10.0.2.1"),
                addr("10.0.2.1"),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        assert_eq!(nodes.expected_agent_count(), 3);
    }
}
