//! Collaborators the deployer talks to, and their Kubernetes-backed implementations.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment},
        authentication::v1::{TokenRequest, TokenRequestSpec},
        core::v1::{ConfigMap, Node, PodSpec, Secret, ServiceAccount},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{self, Scope},
    error::ErrorResponse,
    Client, Config,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace};

#[cfg(test)]
use mockall::automock;

use crate::{cache::AgentImages, cluster::ManagedCluster, Error, Result, SERVICE_NAME};

/// Namespace the agent workloads live in on the remote cluster
pub const AGENT_NAMESPACE: &str = "agent-system";
pub const CLUSTER_AGENT_NAME: &str = "cluster-agent";
pub const NODE_AGENT_NAME: &str = "node-agent";
pub const AUTH_DAEMONSET_NAME: &str = "kube-api-auth";
const KUBECONFIG_SECRET_KEY: &str = "value";
const ACCOUNT_CLUSTER_ANNOTATION: &str = "agentdeployer.example.com/cluster";
const DEPLOY_TOKEN_TTL_SECS: i64 = 600;
const SERVER_URL_KEY: &str = "server-url";

/// A remote command that failed, with whatever it printed before failing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandFailure {
    pub error: String,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(String),
    /// The resource did not exist
    NotFound(String),
}

/// Legacy workloads that may have to be removed after the agent is applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Companion {
    AuthDaemonSet,
    NodeAgentDaemonSet,
}

impl Companion {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthDaemonSet => AUTH_DAEMONSET_NAME,
            Self::NodeAgentDaemonSet => NODE_AGENT_NAME,
        }
    }
}

impl fmt::Display for Companion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemonset/{}", self.name())
    }
}

/// Read-only view of the nodes of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<Node>>;
}

/// The API of a managed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// Declaratively apply a multi-document manifest, returning the command output
    async fn apply_manifest(
        &self,
        cluster: &str,
        token: &str,
        manifest: &[u8],
    ) -> Result<String, CommandFailure>;

    async fn delete_companion(
        &self,
        cluster: &str,
        token: &str,
        companion: Companion,
    ) -> Result<DeleteOutcome, CommandFailure>;

    /// Images of the agent workloads actually running in the cluster
    async fn agent_images(&self, cluster: &str) -> Result<AgentImages>;
}

/// System identities and tokens for a managed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn create_system_account(&self, cluster: &str) -> Result<()>;
    async fn remove_system_account(&self, cluster: &str) -> Result<()>;
    /// Short-lived token used to push the agent manifest
    async fn deploy_token(&self, cluster: &str) -> Result<String>;
    /// Token embedded into the manifest for the agent itself
    async fn cluster_token(&self, cluster: &str) -> Result<String>;
}

/// Where the externally reachable URL agents dial back to comes from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerUrlSource: Send + Sync {
    /// `None` until the URL is configured
    async fn server_url(&self) -> Result<Option<String>>;
}

/// A server URL fixed when the process starts
pub struct StaticServerUrl(pub Option<String>);

#[async_trait]
impl ServerUrlSource for StaticServerUrl {
    async fn server_url(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Write-back of reconciled ManagedCluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn update(&self, original: &ManagedCluster, updated: &ManagedCluster) -> Result<()>;
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

/// Reaches managed clusters through the kubeconfig secrets stored next to the deployer.
pub struct KubeRemote {
    client: Client,
    namespace: String,
}

impl KubeRemote {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client for `cluster`. With a token, the kubeconfig credentials are replaced by it.
    async fn remote_client(&self, cluster: &str, token: Option<&str>) -> Result<Client> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret_name = format!("{cluster}-kubeconfig");
        let secret = secrets.get_opt(&secret_name).await?.ok_or_else(|| {
            Error::RemoteAccess(format!(
                "kubeconfig secret '{}/{}' not found",
                self.namespace, secret_name
            ))
        })?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::RemoteAccess(format!(
                    "secret '{}' has no '{}' key",
                    secret_name, KUBECONFIG_SECRET_KEY
                ))
            })?;
        let yaml = std::str::from_utf8(&raw.0)
            .map_err(|e| Error::RemoteAccess(format!("kubeconfig of '{cluster}': {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| Error::RemoteAccess(format!("kubeconfig of '{cluster}': {e}")))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::RemoteAccess(format!("kubeconfig of '{cluster}': {e}")))?;

        if let Some(token) = token {
            config.auth_info.token = Some(token.to_string().into());
            config.auth_info.client_certificate_data = None;
            config.auth_info.client_key_data = None;
        }

        Ok(Client::try_from(config)?)
    }

    async fn apply_document(client: &Client, object: DynamicObject) -> Result<String> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::Render("manifest document without apiVersion/kind".into()))?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| Error::Render(format!("invalid apiVersion '{}': {e}", types.api_version)))?;
        let name = object.name_any();
        let (resource, caps) = discovery::pinned_kind(client, &gvk).await?;

        let api: Api<DynamicObject> = if matches!(caps.scope, Scope::Namespaced) {
            let namespace = object.namespace().unwrap_or_else(|| "default".to_string());
            Api::namespaced_with(client.clone(), &namespace, &resource)
        } else {
            Api::all_with(client.clone(), &resource)
        };
        let params = PatchParams::apply(SERVICE_NAME).force();
        api.patch(&name, &params, &Patch::Apply(&object)).await?;

        let kind = if gvk.group.is_empty() {
            gvk.kind.to_lowercase()
        } else {
            format!("{}.{}", gvk.kind.to_lowercase(), gvk.group)
        };
        Ok(format!("{kind}/{name} serverside-applied"))
    }
}

/// Split a multi-document manifest into objects, skipping empty documents.
fn parse_manifest(manifest: &[u8]) -> Result<Vec<DynamicObject>, serde_yaml::Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(manifest) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

fn first_container_image(spec: Option<&PodSpec>, container: &str) -> String {
    spec.and_then(|spec| spec.containers.iter().find(|c| c.name == container))
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

#[async_trait]
impl NodeSource for KubeRemote {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<Node>> {
        let client = self.remote_client(cluster, None).await?;
        let nodes: Api<Node> = Api::all(client);
        Ok(nodes.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl RemoteCluster for KubeRemote {
    async fn apply_manifest(
        &self,
        cluster: &str,
        token: &str,
        manifest: &[u8],
    ) -> Result<String, CommandFailure> {
        let client = self
            .remote_client(cluster, Some(token))
            .await
            .map_err(|e| CommandFailure {
                error: e.to_string(),
                output: String::new(),
            })?;

        let mut output: Vec<String> = Vec::new();
        let fail = |output: &[String], error: String| CommandFailure {
            output: output
                .iter()
                .cloned()
                .chain(std::iter::once(format!("Error from server: {error}")))
                .collect::<Vec<_>>()
                .join("\n"),
            error,
        };

        let objects = parse_manifest(manifest).map_err(|e| fail(&output, e.to_string()))?;
        for object in objects {
            let line = Self::apply_document(&client, object)
                .await
                .map_err(|e| fail(&output, e.to_string()))?;
            trace!("Cluster '{}': {}", cluster, line);
            output.push(line);
        }

        Ok(output.join("\n"))
    }

    async fn delete_companion(
        &self,
        cluster: &str,
        token: &str,
        companion: Companion,
    ) -> Result<DeleteOutcome, CommandFailure> {
        let client = self
            .remote_client(cluster, Some(token))
            .await
            .map_err(|e| CommandFailure {
                error: e.to_string(),
                output: String::new(),
            })?;
        let daemonsets: Api<DaemonSet> = Api::namespaced(client, AGENT_NAMESPACE);

        match daemonsets
            .delete(companion.name(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted(format!(
                "daemonset.apps \"{}\" deleted",
                companion.name()
            ))),
            Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound(format!(
                "daemonsets.apps \"{}\" not found",
                companion.name()
            ))),
            Err(e) => Err(CommandFailure {
                output: format!("Error from server: {e}"),
                error: e.to_string(),
            }),
        }
    }

    async fn agent_images(&self, cluster: &str) -> Result<AgentImages> {
        let client = self.remote_client(cluster, None).await?;

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), AGENT_NAMESPACE);
        let cluster_agent = deployments
            .get_opt(CLUSTER_AGENT_NAME)
            .await?
            .map(|d| {
                first_container_image(
                    d.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
                    CLUSTER_AGENT_NAME,
                )
            })
            .unwrap_or_default();

        let daemonsets: Api<DaemonSet> = Api::namespaced(client, AGENT_NAMESPACE);
        let node_agent = daemonsets
            .get_opt(NODE_AGENT_NAME)
            .await?
            .map(|ds| {
                first_container_image(
                    ds.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
                    NODE_AGENT_NAME,
                )
            })
            .unwrap_or_default();

        debug!(
            "Cluster '{}' runs cluster agent '{}' and node agent '{}'",
            cluster, cluster_agent, node_agent
        );
        Ok(AgentImages {
            node_agent,
            cluster_agent,
        })
    }
}

/// Generates the system account name for a cluster.
/// The cluster name is hashed so the account and its token secrets stay within
/// Kubernetes' name length limit.
pub fn system_account_name(cluster: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cluster.as_bytes());
    format!("system-account-{}", hex::encode(hasher.finalize()))
}

/// System accounts backed by ServiceAccounts in the deployer's namespace
pub struct ServiceAccountCredentials {
    client: Client,
    namespace: String,
}

impl ServiceAccountCredentials {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn accounts(&self) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cluster_token_secret(cluster: &str) -> String {
        format!("{}-cluster", system_account_name(cluster))
    }
}

#[async_trait]
impl CredentialProvider for ServiceAccountCredentials {
    async fn create_system_account(&self, cluster: &str) -> Result<()> {
        let name = system_account_name(cluster);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    ACCOUNT_CLUSTER_ANNOTATION.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        let params = PatchParams::apply(SERVICE_NAME).force();
        self.accounts()
            .patch(&name, &params, &Patch::Apply(&account))
            .await?;
        info!("Created system account '{}' for cluster '{}'", name, cluster);
        Ok(())
    }

    async fn remove_system_account(&self, cluster: &str) -> Result<()> {
        let name = system_account_name(cluster);
        match self
            .secrets()
            .delete(&Self::cluster_token_secret(cluster), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        match self.accounts().delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Removed system account '{}' of cluster '{}'", name, cluster),
            Err(e) if is_not_found(&e) => {
                debug!("System account of cluster '{}' already gone", cluster)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn deploy_token(&self, cluster: &str) -> Result<String> {
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(DEPLOY_TOKEN_TTL_SECS),
                ..Default::default()
            },
            ..Default::default()
        };
        let response: TokenRequest = self
            .accounts()
            .create_subresource(
                "token",
                &system_account_name(cluster),
                &PostParams::default(),
                serde_json::to_vec(&request)?,
            )
            .await?;
        response
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Credentials(format!("no deploy token issued for cluster '{cluster}'"))
            })
    }

    async fn cluster_token(&self, cluster: &str) -> Result<String> {
        let secret_name = Self::cluster_token_secret(cluster);
        let secret = match self.secrets().get_opt(&secret_name).await? {
            Some(secret) => secret,
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(secret_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        annotations: Some(BTreeMap::from([(
                            "kubernetes.io/service-account.name".to_string(),
                            system_account_name(cluster),
                        )])),
                        ..Default::default()
                    },
                    type_: Some("kubernetes.io/service-account-token".to_string()),
                    ..Default::default()
                };
                self.secrets().create(&PostParams::default(), &secret).await?
            }
        };

        secret
            .data
            .as_ref()
            .and_then(|data| data.get("token"))
            .and_then(|token| String::from_utf8(token.0.clone()).ok())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Credentials(format!(
                    "token secret '{secret_name}' of cluster '{cluster}' is not populated yet"
                ))
            })
    }
}

/// Reads the `server-url` key of the settings ConfigMap on every call, so the URL can be set
/// while the deployer is running. Falls back to the value given at startup.
pub struct ConfigMapServerUrl {
    client: Client,
    namespace: String,
    name: String,
    fallback: Option<String>,
}

impl ConfigMapServerUrl {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        fallback: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            fallback,
        }
    }
}

#[async_trait]
impl ServerUrlSource for ConfigMapServerUrl {
    async fn server_url(&self) -> Result<Option<String>> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let configured = configmaps
            .get_opt(&self.name)
            .await?
            .and_then(|cm| server_url_from(&cm));
        if configured.is_none() {
            trace!(
                "ConfigMap '{}/{}' has no {}, using fallback",
                self.namespace,
                self.name,
                SERVER_URL_KEY
            );
        }
        Ok(configured.or_else(|| self.fallback.clone()))
    }
}

fn server_url_from(configmap: &ConfigMap) -> Option<String> {
    configmap
        .data
        .as_ref()
        .and_then(|data| data.get(SERVER_URL_KEY))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

/// Persists ManagedCluster changes: spec and metadata through a replace (optimistic
/// concurrency on resourceVersion), status through a server-side apply of the status subresource.
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn update(&self, original: &ManagedCluster, updated: &ManagedCluster) -> Result<()> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        let name = updated.name_any();

        if original.metadata != updated.metadata || original.spec != updated.spec {
            debug!("Updating spec of cluster '{}'", name);
            api.replace(&name, &PostParams::default(), updated).await?;
        }

        if original.status != updated.status {
            debug!("Updating status of cluster '{}'", name);
            let patch = serde_json::json!({
                "apiVersion": "agentdeployer.example.com/v1",
                "kind": "ManagedCluster",
                "status": updated.status,
            });
            let params = PatchParams::apply(SERVICE_NAME).force();
            api.patch_status(&name, &params, &Patch::Apply(&patch))
                .await?;
        }
        Ok(())
    }
}
