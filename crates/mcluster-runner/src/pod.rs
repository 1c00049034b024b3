//! Pod specification builder for Kubernetes.
//!
//! This module provides helpers to construct the pod specs for a cluster's master and
//! agent nodes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use mcluster_config::ClusterConfig;
use mcluster_core::{ClusterId, NodeId};

use crate::probe::INFO_PATH;
use crate::types::{K8sBackendConfig, NodeRole};

/// Label selecting every pod created by mcluster.
pub const APP_LABEL: &str = "app=mcluster";

/// Label key holding the short cluster ID.
pub const CLUSTER_ID_LABEL: &str = "mcluster.io/cluster-id";

/// Label key holding the node ID.
pub const NODE_ID_LABEL: &str = "mcluster.io/node-id";

/// Label key holding the node role.
pub const ROLE_LABEL: &str = "mcluster.io/role";

/// Annotation key holding the full cluster ID.
pub const CLUSTER_ID_ANNOTATION: &str = "mcluster.io/cluster-id-full";

/// Everything needed to render one node's pod.
#[derive(Debug, Clone, Copy)]
pub struct NodePodParams<'a> {
    /// Cluster the node belongs to.
    pub cluster_id: ClusterId,
    /// Node being built.
    pub node_id: NodeId,
    /// Role of the node.
    pub role: &'a NodeRole,
    /// Cluster configuration.
    pub config: &'a ClusterConfig,
    /// Master URL agents connect to; unused for the master itself.
    pub master_url: Option<&'a str>,
}

/// Build the pod for one node.
///
/// Pods use restart policy `Never`: restarts are driven by the backend so that the
/// cluster's restart counter stays accurate.
#[must_use]
pub fn build_node_pod(params: &NodePodParams<'_>, backend: &K8sBackendConfig) -> Pod {
    let pod_name = pod_name_for_node(&params.cluster_id, params.node_id);

    Pod {
        metadata: build_metadata(&pod_name, params, backend),
        spec: Some(build_pod_spec(params, backend)),
        ..Default::default()
    }
}

/// Generate the pod name for a node.
///
/// Uses the short cluster ID so names stay well under the 63-character limit.
#[must_use]
pub fn pod_name_for_node(cluster_id: &ClusterId, node_id: NodeId) -> String {
    if node_id.is_master() {
        format!("mcluster-{}-master", cluster_id.short())
    } else {
        format!("mcluster-{}-agent-{}", cluster_id.short(), node_id.index())
    }
}

/// Label selector matching every pod of a cluster.
#[must_use]
pub fn cluster_selector(cluster_id: &ClusterId) -> String {
    format!("{APP_LABEL},{CLUSTER_ID_LABEL}={}", cluster_id.short())
}

fn build_metadata(
    pod_name: &str,
    params: &NodePodParams<'_>,
    backend: &K8sBackendConfig,
) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "mcluster".to_string());
    labels.insert(CLUSTER_ID_LABEL.to_string(), params.cluster_id.short());
    labels.insert(NODE_ID_LABEL.to_string(), params.node_id.to_string());
    labels.insert(ROLE_LABEL.to_string(), params.role.as_str().to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(CLUSTER_ID_ANNOTATION.to_string(), params.cluster_id.to_hex());
    annotations.insert(
        "mcluster.io/created-at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    ObjectMeta {
        name: Some(pod_name.to_string()),
        namespace: Some(backend.namespace.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn build_pod_spec(params: &NodePodParams<'_>, backend: &K8sBackendConfig) -> PodSpec {
    PodSpec {
        containers: vec![build_container(params, backend)],
        restart_policy: Some("Never".to_string()),
        termination_grace_period_seconds: Some(i64::from(backend.grace_period_secs)),
        ..Default::default()
    }
}

fn build_container(params: &NodePodParams<'_>, backend: &K8sBackendConfig) -> Container {
    let port = i32::from(params.config.master_port());

    match params.role {
        NodeRole::Master => Container {
            name: "master".to_string(),
            image: Some(backend.master_image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: port,
                name: Some("http".to_string()),
                ..Default::default()
            }]),
            env: Some(build_env_vars(params)),
            readiness_probe: Some(build_readiness_probe(port)),
            ..Default::default()
        },
        NodeRole::Agent { .. } => Container {
            name: "agent".to_string(),
            image: Some(backend.agent_image.clone()),
            env: Some(build_env_vars(params)),
            ..Default::default()
        },
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn build_env_vars(params: &NodePodParams<'_>) -> Vec<EnvVar> {
    let mut vars = vec![
        env("MCLUSTER_CLUSTER_ID", params.cluster_id.to_hex()),
        env("MCLUSTER_NODE_ID", params.node_id.to_string()),
    ];

    match params.role {
        NodeRole::Master => {
            vars.push(env(
                "MCLUSTER_MASTER_CONFIG",
                params.config.master_config_json().to_string(),
            ));
        }
        NodeRole::Agent { pool } => {
            vars.push(env("MCLUSTER_RESOURCE_POOL", pool.as_str()));
            if let Some(url) = params.master_url {
                vars.push(env("MCLUSTER_MASTER_URL", url));
            }
        }
    }

    vars
}

fn build_readiness_probe(port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(INFO_PATH.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(2),
        timeout_seconds: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcluster_config::ClusterConfigBuilder;
    use mcluster_core::Variant;

    fn test_cluster_id() -> ClusterId {
        ClusterId::from_bytes([0xab; 32])
    }

    fn test_config() -> ClusterConfig {
        ClusterConfigBuilder::default().build(Variant::K8s).unwrap()
    }

    #[test]
    fn pod_name_format() {
        let cluster_id = test_cluster_id();

        assert_eq!(
            pod_name_for_node(&cluster_id, NodeId::MASTER),
            "mcluster-abababababab-master"
        );
        assert_eq!(
            pod_name_for_node(&cluster_id, NodeId::new(2)),
            "mcluster-abababababab-agent-2"
        );
    }

    #[test]
    fn build_master_pod() {
        let config = test_config();
        let backend = K8sBackendConfig::default();
        let params = NodePodParams {
            cluster_id: test_cluster_id(),
            node_id: NodeId::MASTER,
            role: &NodeRole::Master,
            config: &config,
            master_url: None,
        };

        let pod = build_node_pod(&params, &backend);

        // Metadata
        let meta = &pod.metadata;
        assert_eq!(meta.namespace.as_deref(), Some("mcluster"));
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels.get("app"), Some(&"mcluster".to_string()));
        assert_eq!(labels.get(ROLE_LABEL), Some(&"master".to_string()));
        assert_eq!(labels.get(NODE_ID_LABEL), Some(&"0".to_string()));
        assert_eq!(
            meta.annotations.as_ref().unwrap().get(CLUSTER_ID_ANNOTATION),
            Some(&test_cluster_id().to_hex())
        );

        // Spec
        let pod_spec = pod.spec.as_ref().unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.termination_grace_period_seconds, Some(10));

        // Container
        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some(backend.master_image.as_str()));
        assert!(container.readiness_probe.is_some());
        let env_names: Vec<_> = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert!(env_names.contains(&"MCLUSTER_MASTER_CONFIG"));
        assert!(!env_names.contains(&"MCLUSTER_MASTER_URL"));
    }

    #[test]
    fn build_agent_pod() {
        let config = test_config();
        let backend = K8sBackendConfig::default();
        let role = NodeRole::Agent {
            pool: "default".to_string(),
        };
        let params = NodePodParams {
            cluster_id: test_cluster_id(),
            node_id: NodeId::new(1),
            role: &role,
            config: &config,
            master_url: Some("http://10.0.0.5:8080"),
        };

        let pod = build_node_pod(&params, &backend);
        let container = &pod.spec.as_ref().unwrap().containers[0];

        assert_eq!(container.name, "agent");
        assert!(container.readiness_probe.is_none());
        let env = container.env.as_ref().unwrap();
        let value_of = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(value_of("MCLUSTER_RESOURCE_POOL").as_deref(), Some("default"));
        assert_eq!(
            value_of("MCLUSTER_MASTER_URL").as_deref(),
            Some("http://10.0.0.5:8080")
        );
    }

    #[test]
    fn selector_matches_labels() {
        assert_eq!(
            cluster_selector(&test_cluster_id()),
            "app=mcluster,mcluster.io/cluster-id=abababababab"
        );
    }
}
