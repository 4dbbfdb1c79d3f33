//! ManagedCluster custom resource and its condition helpers.

use std::{collections::BTreeMap, fmt, future::Future};

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const FORCE_DEPLOY_ANNOTATION: &str = "agentdeployer.example.com/force-deploy";
pub const NETWORK_POLICY_ANNOTATION: &str =
    "networking.agentdeployer.example.com/enable-network-policy";

/// Desired state of a cluster managed by the deployer.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "agentdeployer.example.com",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver"}"#,
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".status.agentImage"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub driver: ClusterDriver,

    /// Internal clusters never receive an agent
    #[serde(default)]
    pub internal: bool,

    /// Deploy the kube-api-auth companion alongside the agent
    #[serde(default)]
    pub local_cluster_auth_endpoint: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image_override: Option<String>,

    /// Agent image requested for the cluster; `fixed` pins the current default on first deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_agent_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_auth_image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_env_vars: Vec<AgentEnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_registries: Vec<PrivateRegistry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_plugin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_network_policy: Option<bool>,

    #[serde(default)]
    pub windows_preferred: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_strategy: Option<String>,
}

/// Observed state of a managed cluster, as last applied by the deployer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub agent_image: String,

    #[serde(default)]
    pub auth_image: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agent_features: BTreeMap<String, bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_agent_env_vars: Vec<AgentEnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_private_registry: Option<PrivateRegistry>,
}

/// How the cluster was created. Only `Rke` programs every node individually and therefore
/// runs the node agent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterDriver {
    #[default]
    Rke,
    Imported,
    K3s,
    Rke2,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ClusterDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rke => write!(f, "rke"),
            Self::Imported => write!(f, "imported"),
            Self::K3s => write!(f, "k3s"),
            Self::Rke2 => write!(f, "rke2"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AgentEnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateRegistry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Milestones of a cluster's agent rollout, evaluated in declaration order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    Provisioned,
    SystemAccountCreated,
    AgentDeployed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "Provisioned",
            Self::SystemAccountCreated => "SystemAccountCreated",
            Self::AgentDeployed => "AgentDeployed",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a condition still needs its action to run. `Satisfied` is sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionState {
    Pending,
    Satisfied,
}

impl ManagedCluster {
    pub fn condition(&self, condition: ConditionType) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == condition.as_str())
    }

    pub fn is_condition_true(&self, condition: ConditionType) -> bool {
        self.condition(condition)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn condition_state(&self, condition: ConditionType) -> ConditionState {
        if self.is_condition_true(condition) {
            ConditionState::Satisfied
        } else {
            ConditionState::Pending
        }
    }

    /// Set a condition's status and message. The transition time only moves when the
    /// status actually changes.
    pub fn set_condition(
        &mut self,
        condition: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        let conditions = &mut self.status.get_or_insert_with(Default::default).conditions;
        match conditions
            .iter_mut()
            .find(|c| c.type_ == condition.as_str())
        {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = Some(Utc::now());
                }
                existing.reason = reason.to_string();
                existing.message = message;
            }
            None => conditions.push(Condition {
                type_: condition.as_str().to_string(),
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: Some(Utc::now()),
            }),
        }
    }

    pub fn force_deploy_requested(&self) -> bool {
        self.annotations()
            .get(FORCE_DEPLOY_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// The registry flagged as default, else the first configured one
    pub fn primary_private_registry(&self) -> Option<&PrivateRegistry> {
        let registries = &self.spec.private_registries;
        registries
            .iter()
            .find(|r| r.is_default)
            .or_else(|| registries.first())
    }

    pub fn status_mut(&mut self) -> &mut ManagedClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Run `action` only while `condition` is pending. Once satisfied the action is never
/// invoked again.
pub async fn do_until_true<F, Fut>(
    cluster: &mut ManagedCluster,
    condition: ConditionType,
    action: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    if cluster.condition_state(condition) == ConditionState::Satisfied {
        return Ok(());
    }
    run(cluster, condition, action).await
}

/// Run `action` unconditionally. Success marks the condition true with the returned message,
/// failure marks it false with the error text so the outer framework retries the pass.
pub async fn run<F, Fut>(cluster: &mut ManagedCluster, condition: ConditionType, action: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    match action().await {
        Ok(message) => {
            cluster.set_condition(condition, ConditionStatus::True, "", message);
            Ok(())
        }
        Err(e) => {
            cluster.set_condition(condition, ConditionStatus::False, "Error", e.to_string());
            Err(e)
        }
    }
}
