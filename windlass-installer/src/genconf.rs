// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local materialization of the generated-configuration directory.

use crate::InstallError;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use std::collections::BTreeSet;
use windlass_transport::{ClusterNodes, NodeHandle};

/// Name the cluster configuration is written under inside the genconf
/// directory. The contents are JSON, which the bundle's YAML loader
/// accepts as-is.
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Name the address-detection script is installed under.
pub const IP_DETECT_FILENAME: &str = "ip-detect";

/// An extra file the caller wants inside the generated-configuration
/// directory. `install_path` is relative to the genconf directory root.
#[derive(Debug, Clone)]
pub struct ExtraFile {
    pub local: Utf8PathBuf,
    pub install_path: Utf8PathBuf,
}

/// Render the cluster configuration: the caller-supplied map with the
/// role lists injected from the node partitions (private addresses; these
/// are what cluster-internal components dial).
pub fn render_config(
    config: &serde_json::Map<String, Value>,
    nodes: &ClusterNodes,
) -> Result<String, InstallError> {
    let mut merged = config.clone();
    merged.insert(
        "master_list".to_string(),
        address_list(&nodes.masters),
    );
    merged.insert("agent_list".to_string(), address_list(&nodes.agents));
    merged.insert(
        "public_agent_list".to_string(),
        address_list(&nodes.public_agents),
    );
    serde_json::to_string_pretty(&Value::Object(merged))
        .map_err(InstallError::Config)
}

fn address_list(nodes: &BTreeSet<NodeHandle>) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|node| Value::String(node.private_ip().to_string()))
            .collect(),
    )
}

/// Write the genconf directory under `dir`: rendered configuration,
/// address-detection script, and the caller's extra files.
pub fn materialize(
    dir: &Utf8Path,
    config: &serde_json::Map<String, Value>,
    ip_detect: &Utf8Path,
    extra_files: &[ExtraFile],
    nodes: &ClusterNodes,
) -> Result<(), InstallError> {
    let io_err = |path: &Utf8Path| {
        let path = path.to_owned();
        move |source: std::io::Error| InstallError::Genconf { path, source }
    };

    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    let config_path = dir.join(CONFIG_FILENAME);
    std::fs::write(&config_path, render_config(config, nodes)?)
        .map_err(io_err(&config_path))?;
    let ip_detect_dest = dir.join(IP_DETECT_FILENAME);
    std::fs::copy(ip_detect, &ip_detect_dest)
        .map_err(io_err(ip_detect))?;

    for extra in extra_files {
        let dest = dir.join(&extra.install_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::copy(&extra.local, &dest).map_err(io_err(&extra.local))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::IpAddr;

    fn node(public: &str, private: &str) -> NodeHandle {
        NodeHandle::for_testing(
            public.parse::<IpAddr>().unwrap(),
            private.parse::<IpAddr>().unwrap(),
        )
    }

    fn three_master_cluster() -> ClusterNodes {
        ClusterNodes {
            masters: [
                node("203.0.113.1", "10.0.0.1"),
                node("203.0.113.2", "10.0.0.2"),
                node("203.0.113.3", "10.0.0.3"),
            ]
            .into_iter()
            .collect(),
            agents: [
                node("203.0.113.11", "10.0.1.1"),
                node("203.0.113.12", "10.0.1.2"),
            ]
            .into_iter()
            .collect(),
            public_agents: [node("203.0.113.21", "10.0.2.1")]
                .into_iter()
                .collect(),
            bootstrap: None,
        }
    }

    #[test]
    fn test_master_list_has_one_entry_per_master() {
        let mut config = serde_json::Map::new();
        config.insert(
            "cluster_name".to_string(),
            Value::String("test".to_string()),
        );

        let rendered =
            render_config(&config, &three_master_cluster()).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        let masters = parsed["master_list"].as_array().unwrap();
        assert_eq!(masters.len(), 3);
        // Private addresses, not public ones.
        assert!(masters.contains(&Value::String("10.0.0.1".to_string())));
        assert!(!rendered.contains("203.0.113.1"));
        assert_eq!(parsed["agent_list"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["public_agent_list"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["cluster_name"], "test");
    }

    #[test]
    fn test_materialize_writes_genconf_tree() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let ip_detect = tmp.path().join("my-ip-detect");
        std::fs::write(&ip_detect, "#!/bin/sh\nhostname -i\n").unwrap();
        let extra = tmp.path().join("ca.crt");
        std::fs::write(&extra, "certificate").unwrap();

        let genconf_dir = tmp.path().join("genconf");
        materialize(
            &genconf_dir,
            &serde_json::Map::new(),
            &ip_detect,
            &[ExtraFile {
                local: extra,
                install_path: Utf8PathBuf::from("certs/ca.crt"),
            }],
            &three_master_cluster(),
        )
        .unwrap();

        assert!(genconf_dir.join(CONFIG_FILENAME).is_file());
        assert!(genconf_dir.join(IP_DETECT_FILENAME).is_file());
        assert_eq!(
            std::fs::read_to_string(genconf_dir.join("certs/ca.crt"))
                .unwrap(),
            "certificate"
        );
    }
}
