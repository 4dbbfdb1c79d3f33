//! Rendering of the agent manifest.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::{
    cluster::AgentEnvVar,
    remote::{AGENT_NAMESPACE, AUTH_DAEMONSET_NAME, CLUSTER_AGENT_NAME, NODE_AGENT_NAME},
    Result,
};

const TOKEN_SECRET_NAME: &str = "cluster-agent-token";
const WINDOWS_TOLERATION_KEY: &str = "agentdeployer.example.com/os";

/// Everything a manifest is rendered from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestInput {
    pub cluster: String,
    pub agent_image: String,
    /// Empty when the auth endpoint is disabled
    pub auth_image: String,
    /// Cluster token the agent authenticates with
    pub token: String,
    pub server_url: String,
    pub windows_preferred: bool,
    /// Whether the node agent DaemonSet is part of the manifest
    pub node_agent: bool,
    pub features: BTreeMap<String, bool>,
    pub taints: Vec<Taint>,
    pub env_vars: Vec<AgentEnvVar>,
}

#[cfg_attr(test, automock)]
pub trait ManifestRenderer: Send + Sync {
    /// Render a multi-document YAML manifest
    fn render(&self, input: &ManifestInput) -> Result<Vec<u8>>;
}

/// Renders the agent workloads as multi-document YAML
#[derive(Clone, Debug, Default)]
pub struct TemplateRenderer;

fn features_env(features: &BTreeMap<String, bool>) -> String {
    features
        .iter()
        .map(|(name, enabled)| format!("{name}={enabled}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn toleration(taint: &Taint) -> Value {
    match &taint.value {
        Some(value) => json!({
            "key": taint.key,
            "operator": "Equal",
            "value": value,
            "effect": taint.effect,
        }),
        None => json!({
            "key": taint.key,
            "operator": "Exists",
            "effect": taint.effect,
        }),
    }
}

impl TemplateRenderer {
    fn cluster_agent(input: &ManifestInput) -> Value {
        let mut env = vec![
            json!({"name": "AGENT_SERVER", "value": input.server_url}),
            json!({"name": "AGENT_CLUSTER", "value": input.cluster}),
            json!({"name": "AGENT_FEATURES", "value": features_env(&input.features)}),
            json!({
                "name": "AGENT_TOKEN",
                "valueFrom": {"secretKeyRef": {"name": TOKEN_SECRET_NAME, "key": "token"}},
            }),
        ];
        env.extend(
            input
                .env_vars
                .iter()
                .map(|var| json!({"name": var.name, "value": var.value.clone().unwrap_or_default()})),
        );

        let mut tolerations: Vec<Value> = input.taints.iter().map(toleration).collect();
        let mut pod_spec = json!({
            "serviceAccountName": CLUSTER_AGENT_NAME,
            "containers": [{
                "name": CLUSTER_AGENT_NAME,
                "image": input.agent_image,
                "imagePullPolicy": "IfNotPresent",
                "env": env,
            }],
        });
        if input.windows_preferred {
            tolerations.push(json!({
                "key": WINDOWS_TOLERATION_KEY,
                "operator": "Equal",
                "value": "linux",
                "effect": "NoSchedule",
            }));
            pod_spec["nodeSelector"] = json!({"kubernetes.io/os": "linux"});
        }
        pod_spec["tolerations"] = Value::Array(tolerations);

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": CLUSTER_AGENT_NAME, "namespace": AGENT_NAMESPACE},
            "spec": {
                "selector": {"matchLabels": {"app": CLUSTER_AGENT_NAME}},
                "template": {
                    "metadata": {"labels": {"app": CLUSTER_AGENT_NAME}},
                    "spec": pod_spec,
                },
            },
        })
    }

    /// A DaemonSet running on every node, control plane included
    fn daemonset(name: &str, image: &str, env: Vec<Value>) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": name, "namespace": AGENT_NAMESPACE},
            "spec": {
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {
                        "serviceAccountName": CLUSTER_AGENT_NAME,
                        "hostNetwork": true,
                        "tolerations": [{"operator": "Exists"}],
                        "containers": [{
                            "name": name,
                            "image": image,
                            "imagePullPolicy": "IfNotPresent",
                            "env": env,
                        }],
                    },
                },
            },
        })
    }
}

impl ManifestRenderer for TemplateRenderer {
    fn render(&self, input: &ManifestInput) -> Result<Vec<u8>> {
        let mut documents = vec![
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": AGENT_NAMESPACE},
            }),
            json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {"name": CLUSTER_AGENT_NAME, "namespace": AGENT_NAMESPACE},
            }),
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": {"name": CLUSTER_AGENT_NAME},
                "roleRef": {
                    "apiGroup": "rbac.authorization.k8s.io",
                    "kind": "ClusterRole",
                    "name": "cluster-admin",
                },
                "subjects": [{
                    "kind": "ServiceAccount",
                    "name": CLUSTER_AGENT_NAME,
                    "namespace": AGENT_NAMESPACE,
                }],
            }),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": TOKEN_SECRET_NAME, "namespace": AGENT_NAMESPACE},
                "stringData": {"url": input.server_url, "token": input.token},
            }),
            Self::cluster_agent(input),
        ];

        if input.node_agent {
            documents.push(Self::daemonset(
                NODE_AGENT_NAME,
                &input.agent_image,
                vec![
                    json!({"name": "AGENT_SERVER", "value": input.server_url}),
                    json!({"name": "AGENT_CLUSTER", "value": input.cluster}),
                    json!({"name": "AGENT_NODE", "value": "true"}),
                ],
            ));
        }
        if !input.auth_image.is_empty() {
            documents.push(Self::daemonset(
                AUTH_DAEMONSET_NAME,
                &input.auth_image,
                vec![json!({"name": "AGENT_CLUSTER", "value": input.cluster})],
            ));
        }

        let mut out = String::new();
        for document in &documents {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(document)?);
        }
        Ok(out.into_bytes())
    }
}
