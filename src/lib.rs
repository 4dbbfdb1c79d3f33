pub mod apply;
pub mod cache;
pub mod cluster;
pub mod decision;
pub mod deploy;
pub mod manifest;
pub mod remote;
pub mod settings;
pub mod taints;

use k8s_openapi::{
    api::core::v1::{Event, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{
    api::{Api, PostParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Client, Resource,
};
use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::ManagedCluster,
    deploy::{persist, Deployer},
    manifest::TemplateRenderer,
    remote::{
        ClusterStore, ConfigMapServerUrl, KubeClusterStore, KubeRemote, ServiceAccountCredentials,
    },
    settings::Settings,
};

pub const FINALIZER_NAME: &str = "agentdeployer.example.com/finalizer";
pub const SERVICE_NAME: &str = "agent-deployer";
const REQUEUE_TIME: Duration = Duration::from_secs(2);
const MAX_RETRY_TIME: Duration = Duration::from_secs(3600);
const NOT_READY_REQUEUE: Duration = Duration::from_secs(1);
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

lazy_static! {
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();
    static ref CLUSTERS_RECONCILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("clusters_reconciled_total", "Total number of clusters reconciled"),
        &["phase"]
    )
    .unwrap();
    pub(crate) static ref AGENT_REDEPLOYS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agent_redeploys_total", "Total number of agent redeploy decisions"),
        &["reason"]
    )
    .unwrap();
    pub(crate) static ref APPLY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agent_apply_attempts_total", "Total number of agent manifest apply attempts"),
        &["outcome"]
    )
    .unwrap();
    static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("errors_total", "Total number of errors"),
        &["kind", "reason"]
    )
    .unwrap();
}

/// Initialize Prometheus metrics
pub fn init_metrics() {
    PROMETHEUS_REGISTRY
        .register(Box::new(CLUSTERS_RECONCILED_TOTAL.clone()))
        .ok();
    PROMETHEUS_REGISTRY
        .register(Box::new(AGENT_REDEPLOYS_TOTAL.clone()))
        .ok();
    PROMETHEUS_REGISTRY
        .register(Box::new(APPLY_ATTEMPTS_TOTAL.clone()))
        .ok();
    PROMETHEUS_REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .ok();
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get cluster name: {0:?}")]
    MissingClusterName(Box<ManagedCluster>),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Finalizer error: {0}")]
    Finalizer(String),
    /// A prerequisite is not configured yet; checked again shortly
    #[error("{0}")]
    NotReady(String),
    #[error("Failed to render agent manifest: {0}")]
    Render(String),
    #[error("Credential error: {0}")]
    Credentials(String),
    #[error("Remote cluster access error: {0}")]
    RemoteAccess(String),
    /// A remote command failed; `output` is already redacted
    #[error("{context}: {error}, output: {output}")]
    Command {
        context: String,
        error: String,
        output: String,
    },
    #[error("{deploy}; persisting cluster failed: {persist}")]
    Combined {
        deploy: Box<Error>,
        persist: Box<Error>,
    },
}

impl Error {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }

    /// Value of the `reason` label on `errors_total`
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::MissingClusterName(_) => "missing_name",
            Error::Kube(_) => "kube_error",
            Error::Serialization(_) | Error::Yaml(_) => "serialization_error",
            Error::Finalizer(_) => "finalizer_error",
            Error::NotReady(_) => "not_ready",
            Error::Render(_) => "render_error",
            Error::Credentials(_) => "credentials_error",
            Error::RemoteAccess(_) => "remote_access_error",
            Error::Command { .. } => "command_error",
            Error::Combined { .. } => "persist_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Passed to the reconciler
pub struct Context {
    client: Client,
    deployer: Deployer,
    store: Arc<dyn ClusterStore>,
    failures: FailureCounts,
}

/// Consecutive reconcile failures per cluster
#[derive(Default)]
struct FailureCounts(Mutex<HashMap<String, u32>>);

impl FailureCounts {
    /// Count one more failure of `cluster` and return its new total
    fn record(&self, cluster: &str) -> u32 {
        let mut counts = self.0.lock();
        let count = counts.entry(cluster.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset(&self, cluster: &str) {
        self.0.lock().remove(cluster);
    }
}

impl Context {
    /// Create a new Context backed by the cluster `client` points at
    pub fn new(client: Client) -> Self {
        let settings = Settings::from_env();
        let namespace = settings.system_namespace.clone();

        init_metrics();

        let remote = Arc::new(KubeRemote::new(client.clone(), &namespace));
        let server_url = Arc::new(ConfigMapServerUrl::new(
            client.clone(),
            &namespace,
            &settings.settings_configmap,
            settings.server_url.clone(),
        ));
        let deployer = Deployer::new(
            remote.clone(),
            remote,
            Arc::new(TemplateRenderer),
            Arc::new(ServiceAccountCredentials::new(client.clone(), &namespace)),
            settings,
        )
        .with_server_url_source(server_url);

        Self {
            store: Arc::new(KubeClusterStore::new(client.clone())),
            client,
            deployer,
            failures: FailureCounts::default(),
        }
    }

    pub fn system_namespace(&self) -> &str {
        &self.deployer.settings().system_namespace
    }
}

/// Action to take on ManagedCluster events
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let cluster_name = cluster
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::MissingClusterName(Box::new(cluster.as_ref().clone())))?
        .to_string();
    let cluster_api: Api<ManagedCluster> = Api::all(ctx.client.clone());

    finalizer(&cluster_api, FINALIZER_NAME, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply_cluster(cluster, ctx.clone()).await,
            FinalizerEvent::Cleanup(cluster) => cleanup_cluster(cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| {
        warn!("Finalizer error for cluster {}: {:?}", cluster_name, e);
        ERRORS_TOTAL
            .with_label_values(&["finalizer", "finalizer_error"])
            .inc();
        Error::Finalizer(e.to_string())
    })
}

/// Handle ManagedCluster creation/update
async fn apply_cluster(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let cluster_name = cluster.name_any();
    debug!("Reconciling cluster '{}' (Apply)", cluster_name);

    let outcome = ctx.deployer.sync(&cluster).await;
    let phase = match &outcome.result {
        Ok(()) if outcome.redeployed => "redeployed",
        Ok(()) => "synced",
        Err(e) if e.is_not_ready() => "not_ready",
        Err(_) => "failed",
    };
    CLUSTERS_RECONCILED_TOTAL.with_label_values(&[phase]).inc();

    if outcome.redeployed {
        let image = outcome
            .cluster
            .status
            .as_ref()
            .map(|s| s.agent_image.as_str())
            .unwrap_or_default();
        let message = format!("Deployed agent {image}");
        emit_event(&ctx, &cluster, "AgentDeployed", &message, "Normal").await;
        info!("Cluster '{}': {}", cluster_name, message);
    } else if let Err(e @ Error::Command { .. }) = &outcome.result {
        emit_event(&ctx, &cluster, "AgentDeployFailed", &e.to_string(), "Warning").await;
    }

    match persist(ctx.store.as_ref(), &cluster, outcome).await {
        Ok(()) => {
            ctx.failures.reset(&cluster_name);
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) if e.is_not_ready() => {
            debug!("Cluster '{}': {}", cluster_name, e);
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
        Err(e) => {
            ERRORS_TOTAL
                .with_label_values(&["reconcile", e.metric_label()])
                .inc();
            Err(e)
        }
    }
}

/// Handle ManagedCluster deletion
async fn cleanup_cluster(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let cluster_name = cluster.name_any();
    info!("Cleaning up cluster '{}' (Cleanup)", cluster_name);
    CLUSTERS_RECONCILED_TOTAL
        .with_label_values(&["cleanup"])
        .inc();

    // Check if deletion has been pending for too long
    if let Some(Time(deletion_time)) = cluster.metadata.deletion_timestamp {
        let deletion_system_time: SystemTime = deletion_time.into();
        if SystemTime::now()
            .duration_since(deletion_system_time)
            .unwrap_or_default()
            > MAX_RETRY_TIME
        {
            warn!(
                "Cluster '{}' cleanup failed for over {}s. Forcing finalizer removal.",
                cluster_name,
                MAX_RETRY_TIME.as_secs()
            );
            ERRORS_TOTAL
                .with_label_values(&["cleanup", "timeout"])
                .inc();
            return Ok(Action::await_change());
        }
    }

    ctx.deployer.cleanup(&cluster_name).await.map_err(|e| {
        ERRORS_TOTAL
            .with_label_values(&["cleanup", e.metric_label()])
            .inc();
        e
    })?;
    ctx.failures.reset(&cluster_name);

    Ok(Action::await_change())
}

/// Emit a Kubernetes Event about a ManagedCluster
async fn emit_event(
    ctx: &Context,
    cluster: &ManagedCluster,
    reason: &str,
    message: &str,
    event_type: &str,
) {
    let namespace = ctx.system_namespace();
    let events_api: Api<Event> = Api::namespaced(ctx.client.clone(), namespace);
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let event_name = format!("{}.{}", cluster.name_any(), timestamp);

    let event = Event {
        metadata: ObjectMeta {
            name: Some(event_name),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(ManagedCluster::api_version(&()).to_string()),
            kind: Some(ManagedCluster::kind(&()).to_string()),
            name: Some(cluster.name_any()),
            uid: cluster.uid(),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some(event_type.to_string()),
        action: Some("Reconcile".to_string()),
        reporting_component: Some(SERVICE_NAME.to_string()),
        reporting_instance: Some(
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        ),
        ..Default::default()
    };

    if let Err(e) = events_api.create(&PostParams::default(), &event).await {
        warn!("Failed to create event: {:?}", e);
    }
}

/// Exponential backoff on error, per cluster
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let cluster_name = cluster.name_any();
    error!("Reconciliation of cluster '{}' failed: {:?}", cluster_name, error);
    let attempt = ctx.failures.record(&cluster_name);
    Action::requeue(backoff(attempt))
}

fn backoff(attempt: u32) -> Duration {
    let base_secs = REQUEUE_TIME.as_secs();
    let max_secs = MAX_RETRY_TIME.as_secs();
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(base_secs.saturating_mul(factor).min(max_secs))
}
