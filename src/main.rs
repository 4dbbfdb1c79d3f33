use agent_deployer::{cluster::ManagedCluster, error_policy, reconcile, Context};
use futures::stream::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Controller, watcher},
    Client, CustomResourceExt,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{filter::Targets, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `agent-deployer crd` prints the CustomResourceDefinition and exits
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml::to_string(&ManagedCluster::crd())?);
        return Ok(());
    }

    let env_filter = std::env::var("RUST_LOG").ok().map(EnvFilter::new);
    let targets = env_filter
        .is_none()
        .then(|| Targets::new().with_target("agent_deployer", tracing::Level::DEBUG));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .with(env_filter)
        .init();

    let client = Client::try_default().await?;
    let cluster_api: Api<ManagedCluster> = Api::all(client.clone());
    let context = Arc::new(Context::new(client.clone()));

    info!(
        "Starting agent deployer controller, system namespace {}...",
        context.system_namespace()
    );

    Controller::new(cluster_api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => info!("Reconciled ManagedCluster '{}'", obj.name),
                Err(e) => warn!("Reconciliation error: {:?}", e),
            }
        })
        .await;
    Ok(())
}
