//! Decides whether the agent of a cluster must be redeployed.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::api::core::v1::Taint;
use kube::ResourceExt;
use tracing::{info, trace};

use crate::{
    cache::{AgentImages, ImageCache, TaintCache},
    cluster::{AgentEnvVar, ClusterDriver, ConditionType, ManagedCluster, PrivateRegistry},
    taints::diff_taints,
    AGENT_REDEPLOYS_TOTAL,
};

/// Everything the agent manifest is rendered from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredAgentState {
    pub agent_image: String,
    /// Empty when the auth endpoint is disabled
    pub auth_image: String,
    pub features: BTreeMap<String, bool>,
    pub taints: Vec<Taint>,
    pub env_vars: Vec<AgentEnvVar>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeployReason {
    FirstDeploy,
    ForceDeploy,
    ImageChanged,
    PrivateRegistryChanged,
    FeaturesChanged,
    DownstreamImageMismatch,
    TaintMismatch,
    EnvVarsChanged,
}

impl RedeployReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstDeploy => "first_deploy",
            Self::ForceDeploy => "force_deploy",
            Self::ImageChanged => "image_changed",
            Self::PrivateRegistryChanged => "private_registry_changed",
            Self::FeaturesChanged => "features_changed",
            Self::DownstreamImageMismatch => "downstream_image_mismatch",
            Self::TaintMismatch => "taint_mismatch",
            Self::EnvVarsChanged => "env_vars_changed",
        }
    }
}

impl fmt::Display for RedeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compare feature flags, treating a missing key as `false` on either side.
///
/// Known quirk: because omission reads as `false`, a change is only seen
/// when a flag is set explicitly. A feature that is enabled by default on the agent cannot be
/// switched off by dropping it from the map, only by setting it to `false`. In exchange,
/// introducing new default-off features does not redeploy every agent.
pub fn agent_features_changed(
    desired: &BTreeMap<String, bool>,
    actual: &BTreeMap<String, bool>,
) -> bool {
    let flag = |map: &BTreeMap<String, bool>, key: &str| map.get(key).copied().unwrap_or(false);

    desired.iter().any(|(k, v)| flag(actual, k) != *v)
        || actual.iter().any(|(k, v)| flag(desired, k) != *v)
}

/// A registry appearing, disappearing, or changing all count as a change.
pub fn private_registry_changed(
    desired: Option<&PrivateRegistry>,
    applied: Option<&PrivateRegistry>,
) -> bool {
    desired != applied
}

/// Pure evaluation of the redeploy facets, in priority order.
///
/// `images` and `current_taints` are the cached observations; `None` compares as empty.
pub fn evaluate(
    cluster: &ManagedCluster,
    desired: &DesiredAgentState,
    images: Option<&AgentImages>,
    current_taints: Option<&[Taint]>,
) -> Option<RedeployReason> {
    let name = cluster.name_any();

    if !cluster.is_condition_true(ConditionType::AgentDeployed) {
        return Some(RedeployReason::FirstDeploy);
    }

    let status = cluster.status.clone().unwrap_or_default();

    let force_deploy = cluster.force_deploy_requested();
    let image_change =
        status.agent_image != desired.agent_image || status.auth_image != desired.auth_image;
    let features_change = agent_features_changed(&desired.features, &status.agent_features);
    let repo_change = private_registry_changed(
        cluster.primary_private_registry(),
        status.applied_private_registry.as_ref(),
    );

    if force_deploy || image_change || repo_change || features_change {
        info!(
            "Agent redeploy needed for cluster '{}': force_deploy={}, image_changed={}, private_registry_changed={}, features_changed={}",
            name, force_deploy, image_change, repo_change, features_change
        );
        trace!(
            "Cluster '{}' agent image '{}' -> '{}', auth image '{}' -> '{}', features {:?} -> {:?}",
            name,
            status.agent_image,
            desired.agent_image,
            status.auth_image,
            desired.auth_image,
            status.agent_features,
            desired.features
        );
        return Some(if force_deploy {
            RedeployReason::ForceDeploy
        } else if image_change {
            RedeployReason::ImageChanged
        } else if repo_change {
            RedeployReason::PrivateRegistryChanged
        } else {
            RedeployReason::FeaturesChanged
        });
    }

    let images = images.cloned().unwrap_or_default();
    let node_agent_stale =
        cluster.spec.driver == ClusterDriver::Rke && status.agent_image != images.node_agent;
    if node_agent_stale || status.agent_image != images.cluster_agent {
        info!(
            "Agent redeploy needed for cluster '{}': downstream agent image mismatch, node agent '{}', cluster agent '{}', expected '{}'",
            name, images.node_agent, images.cluster_agent, status.agent_image
        );
        return Some(RedeployReason::DownstreamImageMismatch);
    }

    let current_taints = current_taints.unwrap_or_default();
    trace!(
        "Cluster '{}' current taints {:?}, desired taints {:?}",
        name,
        current_taints,
        desired.taints
    );
    if !diff_taints(current_taints, &desired.taints).is_empty() {
        info!(
            "Agent redeploy needed for cluster '{}': toleration mismatch, was {:?} and will be {:?}",
            name, current_taints, desired.taints
        );
        return Some(RedeployReason::TaintMismatch);
    }

    if desired.env_vars != status.applied_agent_env_vars {
        info!(
            "Agent redeploy needed for cluster '{}': env vars changed, was {:?} and will be {:?}",
            name, status.applied_agent_env_vars, desired.env_vars
        );
        return Some(RedeployReason::EnvVarsChanged);
    }

    trace!("Agent of cluster '{}' is up to date", name);
    None
}

/// Evaluate the redeploy facets against the caches. A cache proven stale by the comparison is
/// cleared so that the next pass observes the remote cluster again.
pub fn redeploy_agent(
    cluster: &ManagedCluster,
    desired: &DesiredAgentState,
    image_cache: &ImageCache,
    taint_cache: &TaintCache,
) -> bool {
    let name = cluster.name_any();
    let images = image_cache.get(&name);
    let taints = taint_cache.get(&name);

    let Some(reason) = evaluate(cluster, desired, images.as_ref(), taints.as_deref()) else {
        return false;
    };

    match reason {
        RedeployReason::DownstreamImageMismatch => image_cache.clear(&name),
        RedeployReason::TaintMismatch => taint_cache.clear(&name),
        _ => {}
    }
    AGENT_REDEPLOYS_TOTAL
        .with_label_values(&[reason.as_str()])
        .inc();
    true
}
