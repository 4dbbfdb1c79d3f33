#[cfg(test)]
mod tests {
    use agent_deployer::{
        apply::RetryPolicy,
        cache::{AgentImages, ClusterCache, SharedCache},
        cluster::{
            ClusterDriver, ConditionStatus, ConditionType, ManagedCluster, ManagedClusterSpec,
        },
        deploy::{persist, Deployer},
        manifest::TemplateRenderer,
        remote::{
            ClusterStore, CommandFailure, Companion, CredentialProvider, DeleteOutcome,
            NodeSource, RemoteCluster, ServerUrlSource, CLUSTER_AGENT_NAME, NODE_AGENT_NAME,
        },
        settings::Settings,
        Error, Result,
    };
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rand::{distr::Alphanumeric, rng, Rng};
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };
    use std::time::Duration;

    const AGENT_IMAGE: &str = "registry.example.com/agent:v2.9.0";

    /// Generate a random cluster name
    fn random_cluster_name(length: usize) -> String {
        let suffix: String = rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("c-{suffix}")
    }

    /// Nodes of every cluster, shared by all clusters of a test
    #[derive(Default)]
    struct FakeNodes {
        nodes: Mutex<Vec<Node>>,
    }

    #[async_trait]
    impl NodeSource for FakeNodes {
        async fn list_nodes(&self, _cluster: &str) -> Result<Vec<Node>> {
            Ok(self.nodes.lock().unwrap().clone())
        }
    }

    /// A remote cluster that runs whatever images the last applied manifest asked for
    #[derive(Default)]
    struct FakeRemote {
        failures_left: AtomicU32,
        applies: AtomicU32,
        manifests: Mutex<Vec<String>>,
        deleted: Mutex<Vec<Companion>>,
        running: Mutex<AgentImages>,
    }

    impl FakeRemote {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Default::default()
            }
        }

        fn last_manifest(&self) -> String {
            self.manifests.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    /// Image of the named workload's container in a multi-document manifest
    fn workload_image(manifest: &[u8], name: &str) -> String {
        serde_yaml::Deserializer::from_slice(manifest)
            .filter_map(|doc| serde_yaml::Value::deserialize(doc).ok())
            .find(|doc| doc["metadata"]["name"].as_str() == Some(name) && doc["spec"].is_mapping())
            .and_then(|doc| {
                doc["spec"]["template"]["spec"]["containers"][0]["image"]
                    .as_str()
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    #[async_trait]
    impl RemoteCluster for FakeRemote {
        async fn apply_manifest(
            &self,
            _cluster: &str,
            _token: &str,
            manifest: &[u8],
        ) -> Result<String, CommandFailure> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(CommandFailure {
                    error: "exit status 1".to_string(),
                    output: "Error from server (Forbidden): namespaces \"agent-system\" is forbidden\n{\"token\":\"leaked\"}".to_string(),
                });
            }

            self.manifests
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(manifest).into_owned());
            *self.running.lock().unwrap() = AgentImages {
                node_agent: workload_image(manifest, NODE_AGENT_NAME),
                cluster_agent: workload_image(manifest, CLUSTER_AGENT_NAME),
            };
            Ok("deployment.apps/cluster-agent serverside-applied".to_string())
        }

        async fn delete_companion(
            &self,
            _cluster: &str,
            _token: &str,
            companion: Companion,
        ) -> Result<DeleteOutcome, CommandFailure> {
            self.deleted.lock().unwrap().push(companion);
            Ok(DeleteOutcome::NotFound(format!(
                "daemonsets.apps \"{}\" not found",
                companion.name()
            )))
        }

        async fn agent_images(&self, _cluster: &str) -> Result<AgentImages> {
            Ok(self.running.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeCredentials {
        created: AtomicU32,
        removed: AtomicU32,
        deploy_tokens: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for FakeCredentials {
        async fn create_system_account(&self, _cluster: &str) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_system_account(&self, _cluster: &str) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deploy_token(&self, cluster: &str) -> Result<String> {
            self.deploy_tokens.fetch_add(1, Ordering::SeqCst);
            Ok(format!("deploy-{cluster}"))
        }

        async fn cluster_token(&self, cluster: &str) -> Result<String> {
            Ok(format!("cluster-{cluster}"))
        }
    }

    /// A server URL an operator sets while the deployer is running
    #[derive(Default)]
    struct FakeServerUrl {
        url: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ServerUrlSource for FakeServerUrl {
        async fn server_url(&self) -> Result<Option<String>> {
            Ok(self.url.lock().unwrap().clone())
        }
    }

    /// Keeps every persisted revision
    #[derive(Default)]
    struct FakeStore {
        revisions: Mutex<Vec<ManagedCluster>>,
    }

    #[async_trait]
    impl ClusterStore for FakeStore {
        async fn update(&self, _original: &ManagedCluster, updated: &ManagedCluster) -> Result<()> {
            self.revisions.lock().unwrap().push(updated.clone());
            Ok(())
        }
    }

    struct Harness {
        nodes: Arc<FakeNodes>,
        remote: Arc<FakeRemote>,
        credentials: Arc<FakeCredentials>,
        image_cache: Arc<SharedCache<AgentImages>>,
        taint_cache: Arc<SharedCache<Vec<Taint>>>,
        deployer: Deployer,
    }

    /// Wire a Deployer with fakes, the real renderer and inspectable caches
    fn harness(remote: FakeRemote, settings: Settings) -> Harness {
        let nodes = Arc::new(FakeNodes::default());
        nodes.nodes.lock().unwrap().push(control_plane_node(
            "cp-0",
            vec![taint("node-role.kubernetes.io/control-plane", None, "NoSchedule")],
        ));
        let remote = Arc::new(remote);
        let credentials = Arc::new(FakeCredentials::default());
        let image_cache: Arc<SharedCache<AgentImages>> = Arc::new(SharedCache::new());
        let taint_cache: Arc<SharedCache<Vec<Taint>>> = Arc::new(SharedCache::new());
        let deployer = Deployer::new(
            nodes.clone(),
            remote.clone(),
            Arc::new(TemplateRenderer),
            credentials.clone(),
            settings,
        )
        .with_caches(image_cache.clone(), taint_cache.clone());

        Harness {
            nodes,
            remote,
            credentials,
            image_cache,
            taint_cache,
            deployer,
        }
    }

    fn settings() -> Settings {
        Settings {
            server_url: Some("https://deployer.example.com".to_string()),
            agent_image: AGENT_IMAGE.to_string(),
            agent_features: BTreeMap::from([("fleet".to_string(), true)]),
            apply_retry: RetryPolicy {
                max_attempts: 5,
                delay: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    fn taint(key: &str, value: Option<&str>, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.map(str::to_string),
            effect: effect.to_string(),
            ..Default::default()
        }
    }

    fn control_plane_node(name: &str, taints: Vec<Taint>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "node-role.kubernetes.io/control-plane".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(taints),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A provisioned imported cluster that has never received an agent
    fn provisioned_cluster(name: &str) -> ManagedCluster {
        let mut cluster = ManagedCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                driver: ClusterDriver::Imported,
                ..Default::default()
            },
            status: None,
        };
        cluster.set_condition(ConditionType::Provisioned, ConditionStatus::True, "", "");
        cluster
    }

    /// Test 1: First deploy survives transient apply failures and is persisted
    #[tokio::test]
    async fn test_first_deploy_with_transient_failures() {
        let h = harness(FakeRemote::failing(2), settings());
        let store = FakeStore::default();
        let name = random_cluster_name(8);
        let cluster = provisioned_cluster(&name);

        let outcome = h.deployer.sync(&cluster).await;
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);
        assert!(outcome.redeployed);
        assert_eq!(h.remote.applies.load(Ordering::SeqCst), 3);
        assert_eq!(h.credentials.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.remote.deleted.lock().unwrap(),
            vec![Companion::AuthDaemonSet, Companion::NodeAgentDaemonSet]
        );

        let manifest = h.remote.last_manifest();
        assert!(manifest.contains(AGENT_IMAGE));
        assert!(manifest.contains("fleet=true"));
        assert!(manifest.contains(&format!("cluster-{name}")));
        assert!(!manifest.contains(NODE_AGENT_NAME));

        persist(&store, &cluster, outcome).await.unwrap();
        let revisions = store.revisions.lock().unwrap();
        assert_eq!(revisions.len(), 1);
        let status = revisions[0].status.as_ref().unwrap();
        assert_eq!(status.agent_image, AGENT_IMAGE);
        assert_eq!(status.agent_features.get("fleet"), Some(&true));
        assert!(revisions[0].is_condition_true(ConditionType::AgentDeployed));
        assert_eq!(
            h.image_cache.get(&name).map(|i| i.cluster_agent),
            Some(AGENT_IMAGE.to_string())
        );
    }

    /// Test 2: A converged cluster is neither redeployed nor persisted
    #[tokio::test]
    async fn test_converged_cluster_is_stable() {
        let h = harness(FakeRemote::default(), settings());
        let store = FakeStore::default();
        let first = h
            .deployer
            .sync(&provisioned_cluster(&random_cluster_name(8)))
            .await;
        let deployed = first.cluster.clone();

        for _ in 0..3 {
            let outcome = h.deployer.sync(&deployed).await;
            assert!(!outcome.redeployed);
            assert!(!outcome.changed);
            persist(&store, &deployed, outcome).await.unwrap();
        }
        assert_eq!(h.remote.applies.load(Ordering::SeqCst), 1);
        assert!(store.revisions.lock().unwrap().is_empty());
        assert_eq!(h.credentials.created.load(Ordering::SeqCst), 1);
    }

    /// Test 3: A drifted downstream image is detected through the cache and repaired
    #[tokio::test]
    async fn test_downstream_drift_redeploys() {
        let h = harness(FakeRemote::default(), settings());
        let name = random_cluster_name(8);
        let deployed = h.deployer.sync(&provisioned_cluster(&name)).await.cluster;

        // someone edited the workload behind our back, and a restart emptied the cache
        h.remote.running.lock().unwrap().cluster_agent = "registry.example.com/agent:v2.8.0".into();
        h.image_cache.clear(&name);

        let outcome = h.deployer.sync(&deployed).await;
        assert!(outcome.result.is_ok());
        assert!(outcome.redeployed);
        assert_eq!(h.remote.applies.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.image_cache.get(&name).map(|i| i.cluster_agent),
            Some(AGENT_IMAGE.to_string())
        );
    }

    /// Test 4: A new control-plane taint is tolerated after a redeploy
    #[tokio::test]
    async fn test_new_control_plane_taint_redeploys() {
        let h = harness(FakeRemote::default(), settings());
        let name = random_cluster_name(8);
        let deployed = h.deployer.sync(&provisioned_cluster(&name)).await.cluster;

        h.nodes.nodes.lock().unwrap().push(control_plane_node(
            "cp-1",
            vec![
                taint("dedicated", Some("control"), "NoExecute"),
                taint("node.kubernetes.io/unreachable", None, "NoExecute"),
            ],
        ));

        let outcome = h.deployer.sync(&deployed).await;
        assert!(outcome.redeployed);
        let manifest = h.remote.last_manifest();
        assert!(manifest.contains("dedicated"));
        assert!(!manifest.contains("node.kubernetes.io/unreachable"));
        // proven stale, re-read on the next pass
        assert!(h.taint_cache.get(&name).is_none());

        let again = h.deployer.sync(&outcome.cluster).await;
        assert!(!again.redeployed);
        assert_eq!(h.taint_cache.get(&name).map(|t| t.len()), Some(2));
    }

    /// Test 5: Exhausted retries surface a redacted error and still persist progress
    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let mut settings = settings();
        settings.apply_retry.max_attempts = 3;
        let h = harness(FakeRemote::failing(10), settings);
        let store = FakeStore::default();
        let cluster = provisioned_cluster(&random_cluster_name(8));

        let outcome = h.deployer.sync(&cluster).await;
        assert!(!outcome.redeployed);
        assert!(matches!(outcome.result, Err(Error::Command { .. })));
        assert_eq!(h.remote.applies.load(Ordering::SeqCst), 3);
        assert!(h.remote.deleted.lock().unwrap().is_empty());

        let err = persist(&store, &cluster, outcome).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("it will be retried automatically"));
        assert!(message.contains("forbidden"));
        assert!(!message.contains("leaked"));

        let revisions = store.revisions.lock().unwrap();
        assert_eq!(revisions.len(), 1);
        assert!(revisions[0].is_condition_true(ConditionType::SystemAccountCreated));
        let condition = revisions[0]
            .condition(ConditionType::AgentDeployed)
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(!condition.message.contains("leaked"));
    }

    /// Test 6: Without a server URL the pass is not ready and nothing is applied
    #[tokio::test]
    async fn test_not_ready_without_server_url() {
        let mut settings = settings();
        settings.server_url = None;
        let h = harness(FakeRemote::default(), settings);

        let outcome = h
            .deployer
            .sync(&provisioned_cluster(&random_cluster_name(8)))
            .await;
        assert!(outcome.result.as_ref().unwrap_err().is_not_ready());
        assert_eq!(h.remote.applies.load(Ordering::SeqCst), 0);
    }

    /// Test 7: Deleting a cluster forgets its caches and system account
    #[tokio::test]
    async fn test_cleanup_after_deploy() {
        let h = harness(FakeRemote::default(), settings());
        let name = random_cluster_name(8);
        h.deployer.sync(&provisioned_cluster(&name)).await;
        assert!(h.image_cache.get(&name).is_some());
        assert!(h.taint_cache.get(&name).is_some());

        h.deployer.cleanup(&name).await.unwrap();
        assert!(h.image_cache.get(&name).is_none());
        assert!(h.taint_cache.get(&name).is_none());
        assert_eq!(h.credentials.removed.load(Ordering::SeqCst), 1);
    }

    /// Test 8: Rke clusters get the node agent and keep it
    #[tokio::test]
    async fn test_rke_cluster_runs_node_agent() {
        let h = harness(FakeRemote::default(), settings());
        let mut cluster = provisioned_cluster(&random_cluster_name(8));
        cluster.spec.driver = ClusterDriver::Rke;

        let outcome = h.deployer.sync(&cluster).await;
        assert!(outcome.redeployed);
        assert!(h.remote.last_manifest().contains(NODE_AGENT_NAME));
        assert_eq!(*h.remote.deleted.lock().unwrap(), vec![Companion::AuthDaemonSet]);
        assert_eq!(
            outcome.cluster.spec.authentication_strategy.as_deref(),
            Some("x509")
        );

        let again = h.deployer.sync(&outcome.cluster).await;
        assert!(!again.redeployed);
        assert!(!again.changed);
    }

    /// Test 9: A server URL configured while the cluster waits is picked up by the next pass
    #[tokio::test]
    async fn test_server_url_set_while_not_ready() {
        let mut settings = settings();
        settings.server_url = None;
        let Harness {
            remote,
            credentials,
            deployer,
            ..
        } = harness(FakeRemote::default(), settings);
        let server_url = Arc::new(FakeServerUrl::default());
        let deployer = deployer.with_server_url_source(server_url.clone());
        let cluster = provisioned_cluster(&random_cluster_name(8));

        let waiting = deployer.sync(&cluster).await;
        assert!(waiting.result.as_ref().unwrap_err().is_not_ready());
        assert_eq!(credentials.deploy_tokens.load(Ordering::SeqCst), 0);
        assert_eq!(remote.applies.load(Ordering::SeqCst), 0);

        *server_url.url.lock().unwrap() = Some("https://late.example.com".to_string());
        let outcome = deployer.sync(&waiting.cluster).await;
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);
        assert!(outcome.redeployed);
        assert_eq!(credentials.deploy_tokens.load(Ordering::SeqCst), 1);
        assert!(remote.last_manifest().contains("https://late.example.com"));
    }
}
