//! Reconciliation of a single ManagedCluster.
//!
//! A pass works on a private copy of the cluster and walks the conditions in order:
//! Provisioned gates everything, SystemAccountCreated is driven once, AgentDeployed is
//! re-evaluated on every pass. The caller gets the mutated copy back together with a change flag
//! and decides whether to persist it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;
use tracing::{debug, info, trace};

use crate::{
    apply::{apply_agent, redact_output, remove_companions},
    cache::{AgentImages, ImageCache, SharedCache, TaintCache},
    cluster::{
        do_until_true, run, ClusterDriver, ConditionType, ManagedCluster, PrivateRegistry,
        FORCE_DEPLOY_ANNOTATION, NETWORK_POLICY_ANNOTATION,
    },
    decision::{redeploy_agent, DesiredAgentState},
    manifest::{ManifestInput, ManifestRenderer},
    remote::{
        ClusterStore, Companion, CredentialProvider, NodeSource, RemoteCluster, ServerUrlSource,
        StaticServerUrl,
    },
    settings::Settings,
    taints::control_plane_taints,
    Error, Result,
};

/// Requested image value meaning "pin whatever the current default is"
pub const FIXED_IMAGE: &str = "fixed";
pub const AUTH_STRATEGY_X509: &str = "x509";
pub const AUTH_STRATEGY_WEBHOOK: &str = "x509|webhook";
const CANAL_PLUGIN: &str = "canal";

/// Result of one reconciliation pass
#[derive(Debug)]
pub struct SyncOutcome {
    /// The working copy, including any mutation made before an error
    pub cluster: ManagedCluster,
    /// Whether `cluster` differs from the object the pass started from
    pub changed: bool,
    /// Whether the agent manifest was applied during this pass
    pub redeployed: bool,
    pub result: Result<()>,
}

pub struct Deployer {
    nodes: Arc<dyn NodeSource>,
    remote: Arc<dyn RemoteCluster>,
    renderer: Arc<dyn ManifestRenderer>,
    credentials: Arc<dyn CredentialProvider>,
    server_url: Arc<dyn ServerUrlSource>,
    image_cache: Arc<ImageCache>,
    taint_cache: Arc<TaintCache>,
    settings: Settings,
}

impl Deployer {
    pub fn new(
        nodes: Arc<dyn NodeSource>,
        remote: Arc<dyn RemoteCluster>,
        renderer: Arc<dyn ManifestRenderer>,
        credentials: Arc<dyn CredentialProvider>,
        settings: Settings,
    ) -> Self {
        Self {
            nodes,
            remote,
            renderer,
            credentials,
            server_url: Arc::new(StaticServerUrl(settings.server_url.clone())),
            image_cache: Arc::new(SharedCache::<AgentImages>::new()),
            taint_cache: Arc::new(SharedCache::<Vec<Taint>>::new()),
            settings,
        }
    }

    /// Replace the process-wide caches, e.g. to share them with another component
    pub fn with_caches(mut self, image_cache: Arc<ImageCache>, taint_cache: Arc<TaintCache>) -> Self {
        self.image_cache = image_cache;
        self.taint_cache = taint_cache;
        self
    }

    pub fn with_server_url_source(mut self, source: Arc<dyn ServerUrlSource>) -> Self {
        self.server_url = source;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reconcile `original` without touching it.
    pub async fn sync(&self, original: &ManagedCluster) -> SyncOutcome {
        let mut cluster = original.clone();
        let name = cluster.name_any();

        if cluster.spec.driver == ClusterDriver::Rke {
            let strategy = if cluster.spec.local_cluster_auth_endpoint {
                AUTH_STRATEGY_WEBHOOK
            } else {
                AUTH_STRATEGY_X509
            };
            cluster.spec.authentication_strategy = Some(strategy.to_string());
            trace!(
                "Authentication strategy of cluster '{}' set to '{}'",
                name,
                strategy
            );
        }

        let result = self.do_sync(&mut cluster).await;
        let changed = cluster != *original;
        if changed {
            trace!("Cluster '{}' changed during sync", name);
        }

        let redeployed = *result.as_ref().unwrap_or(&false);
        SyncOutcome {
            cluster,
            changed,
            redeployed,
            result: result.map(|_| ()),
        }
    }

    /// Returns whether the agent was (re)deployed
    async fn do_sync(&self, cluster: &mut ManagedCluster) -> Result<bool> {
        let name = cluster.name_any();

        if !cluster.is_condition_true(ConditionType::Provisioned) {
            trace!("Cluster '{}' is not provisioned yet", name);
            return Ok(false);
        }

        let nodes = self.nodes.list_nodes(&name).await?;
        trace!("Found {} nodes for cluster '{}'", nodes.len(), name);
        if nodes.is_empty() {
            return Ok(false);
        }

        do_until_true(cluster, ConditionType::SystemAccountCreated, || async {
            debug!("Creating system account for cluster '{}'", name);
            self.credentials.create_system_account(&name).await?;
            Ok(String::new())
        })
        .await?;

        let recorded_image = cluster
            .status
            .as_ref()
            .is_some_and(|s| !s.agent_image.is_empty());
        if recorded_image && self.image_cache.get(&name).is_none() {
            self.refresh_images(&name).await?;
        }

        if self.taint_cache.get(&name).is_none() {
            let taints = control_plane_taints(&nodes);
            debug!("Caching {} control-plane taints of cluster '{}'", taints.len(), name);
            self.taint_cache.set(&name, taints);
        }

        let redeployed = self.deploy_agent(cluster, &nodes).await?;
        set_network_policy_default(cluster);
        Ok(redeployed)
    }

    async fn deploy_agent(&self, cluster: &mut ManagedCluster, nodes: &[Node]) -> Result<bool> {
        let name = cluster.name_any();
        if cluster.spec.internal {
            return Ok(false);
        }

        let desired = self.desired_state(cluster, nodes);
        trace!("Desired agent state of cluster '{}': {:?}", name, desired);
        if !redeploy_agent(
            cluster,
            &desired,
            self.image_cache.as_ref(),
            self.taint_cache.as_ref(),
        ) {
            return Ok(false);
        }

        let companions = obsolete_companions(cluster);
        let windows_preferred = cluster.spec.windows_preferred;
        let node_agent = cluster.spec.driver == ClusterDriver::Rke;

        run(cluster, ConditionType::AgentDeployed, || async {
            let server_url = self.server_url.server_url().await?.ok_or_else(|| {
                Error::NotReady("waiting for server-url setting to be set".into())
            })?;
            let token = self.credentials.deploy_token(&name).await?;
            let manifest = self
                .render(&name, server_url, windows_preferred, node_agent, &desired)
                .await?;
            let output = apply_agent(
                self.remote.as_ref(),
                &name,
                &token,
                &manifest,
                &self.settings.apply_retry,
            )
            .await?;
            remove_companions(self.remote.as_ref(), &name, &token, &companions).await?;
            Ok(redact_output(&output))
        })
        .await?;

        commit_state(cluster, &desired);
        info!(
            "Deployed agent '{}' to cluster '{}'",
            desired.agent_image, name
        );

        self.refresh_images(&name).await?;
        Ok(true)
    }

    async fn render(
        &self,
        cluster: &str,
        server_url: String,
        windows_preferred: bool,
        node_agent: bool,
        desired: &DesiredAgentState,
    ) -> Result<Vec<u8>> {
        let token = self.credentials.cluster_token(cluster).await?;

        self.renderer.render(&ManifestInput {
            cluster: cluster.to_string(),
            agent_image: desired.agent_image.clone(),
            auth_image: desired.auth_image.clone(),
            token,
            server_url,
            windows_preferred,
            node_agent,
            features: desired.features.clone(),
            taints: desired.taints.clone(),
            env_vars: desired.env_vars.clone(),
        })
    }

    async fn refresh_images(&self, cluster: &str) -> Result<()> {
        let images = self.remote.agent_images(cluster).await?;
        self.image_cache.set(cluster, images);
        Ok(())
    }

    fn desired_state(&self, cluster: &ManagedCluster, nodes: &[Node]) -> DesiredAgentState {
        let registry = cluster.primary_private_registry();
        let requested = cluster
            .spec
            .agent_image_override
            .as_deref()
            .filter(|image| !image.is_empty())
            .or(cluster.spec.desired_agent_image.as_deref());

        let auth_image = if cluster.spec.local_cluster_auth_endpoint {
            resolve_image(
                cluster.spec.desired_auth_image.as_deref(),
                &self.settings.auth_image,
                registry,
            )
        } else {
            String::new()
        };

        DesiredAgentState {
            agent_image: resolve_image(requested, &self.settings.agent_image, registry),
            auth_image,
            features: self.settings.agent_features.clone(),
            taints: control_plane_taints(nodes),
            env_vars: cluster.spec.agent_env_vars.clone(),
        }
    }

    /// Forget everything known about a deleted cluster and remove its system account.
    pub async fn cleanup(&self, cluster: &str) -> Result<()> {
        self.image_cache.clear(cluster);
        self.taint_cache.clear(cluster);
        self.credentials.remove_system_account(cluster).await
    }
}

/// An explicitly requested image wins. An empty or `fixed` request falls back to `default`,
/// pulled through the primary private registry when one is configured.
pub fn resolve_image(
    requested: Option<&str>,
    default: &str,
    registry: Option<&PrivateRegistry>,
) -> String {
    match requested {
        Some(image) if !image.is_empty() && image != FIXED_IMAGE => image.to_string(),
        _ => match registry
            .map(|r| r.url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
        {
            Some(url) if !default.starts_with(url) => format!("{url}/{default}"),
            _ => default.to_string(),
        },
    }
}

fn obsolete_companions(cluster: &ManagedCluster) -> Vec<Companion> {
    let mut companions = Vec::new();
    if !cluster.spec.local_cluster_auth_endpoint {
        companions.push(Companion::AuthDaemonSet);
    }
    if cluster.spec.driver != ClusterDriver::Rke {
        companions.push(Companion::NodeAgentDaemonSet);
    }
    companions
}

/// Record what was just applied so the next pass compares against it.
fn commit_state(cluster: &mut ManagedCluster, desired: &DesiredAgentState) {
    let registry = cluster.primary_private_registry().cloned();

    if cluster.spec.desired_agent_image.as_deref() == Some(FIXED_IMAGE) {
        cluster.spec.desired_agent_image = Some(desired.agent_image.clone());
    }
    if cluster.spec.desired_auth_image.as_deref() == Some(FIXED_IMAGE) && !desired.auth_image.is_empty() {
        cluster.spec.desired_auth_image = Some(desired.auth_image.clone());
    }
    if cluster.force_deploy_requested() {
        cluster.annotations_mut().insert(
            FORCE_DEPLOY_ANNOTATION.to_string(),
            "false".to_string(),
        );
    }

    let status = cluster.status_mut();
    status.agent_image = desired.agent_image.clone();
    status.auth_image = desired.auth_image.clone();
    status.agent_features = desired.features.clone();
    status.applied_agent_env_vars = desired.env_vars.clone();
    status.applied_private_registry = registry;
}

/// Canal clusters created before network policies were configurable get them enabled.
fn set_network_policy_default(cluster: &mut ManagedCluster) {
    if cluster.spec.enable_network_policy.is_some() {
        return;
    }
    if cluster.spec.network_plugin.as_deref() == Some(CANAL_PLUGIN) {
        cluster.spec.enable_network_policy = Some(true);
        cluster
            .annotations_mut()
            .insert(NETWORK_POLICY_ANNOTATION.to_string(), "true".to_string());
    }
}

/// Write back a pass's working copy when it changed. A persistence failure does not hide the
/// deployment error; when both fail, both are reported.
pub async fn persist(
    store: &dyn ClusterStore,
    original: &ManagedCluster,
    outcome: SyncOutcome,
) -> Result<()> {
    let persisted = if outcome.changed {
        store.update(original, &outcome.cluster).await
    } else {
        Ok(())
    };

    match (outcome.result, persisted) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(deploy), Err(persist)) => Err(Error::Combined {
            deploy: Box::new(deploy),
            persist: Box::new(persist),
        }),
    }
}
