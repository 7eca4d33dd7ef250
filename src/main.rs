use std::sync::Arc;

use envconfig::Envconfig;
use kube::Client;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use karpenter::cloudprovider::kwok::KwokProvider;
use karpenter::cloudprovider::{CloudProvider, InstanceTypeCache, UnavailableOfferings};
use karpenter::config::Settings;
use karpenter::events::EventRecorder;
use karpenter::informers;
use karpenter::lifecycle;
use karpenter::metrics::Metrics;
use karpenter::provisioner::Provisioner;
use karpenter::scheduling::batcher::Batcher;
use karpenter::server;
use karpenter::state::ClusterState;
use karpenter::termination::eviction::{EvictionQueue, PodEvictor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::init_from_env()?;
    let client = Client::try_default().await?;

    let state = Arc::new(ClusterState::new());
    let metrics = Arc::new(Metrics::new());
    let events = EventRecorder::new(client.clone());
    let provider = Arc::new(CloudProvider::Kwok(KwokProvider::new(client.clone())));
    let unavailable_offerings = Arc::new(UnavailableOfferings::new(
        settings.unavailable_offering_ttl(),
    ));
    let instance_types = Arc::new(InstanceTypeCache::new(settings.instance_type_ttl()));
    let eviction_queue = EvictionQueue::new(metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trigger, batcher) = Batcher::new(settings.batch_idle(), settings.batch_max());

    let mut tasks = informers::spawn_all(
        client.clone(),
        state.clone(),
        trigger.clone(),
        shutdown_rx.clone(),
    );

    tasks.push(tokio::spawn(eviction_queue.clone().run(
        PodEvictor::Kube(client.clone()),
        events.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(server::serve(
        settings.listen_addr.clone(),
        metrics.clone(),
        state.clone(),
        shutdown_rx.clone(),
    )));

    let lifecycle_ctx = Arc::new(lifecycle::Context {
        client: client.clone(),
        provider: provider.clone(),
        state: state.clone(),
        events: events.clone(),
        metrics: metrics.clone(),
        eviction_queue: eviction_queue.clone(),
        unavailable_offerings: unavailable_offerings.clone(),
        settings: settings.clone(),
    });
    tasks.push(tokio::spawn(lifecycle::run_garbage_collection(
        lifecycle_ctx.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(lifecycle::run(lifecycle_ctx)));

    let provisioner = Provisioner::new(
        client,
        provider,
        state,
        events,
        metrics,
        instance_types,
        unavailable_offerings,
        settings,
    );
    tasks.push(tokio::spawn(provisioner.run(batcher, shutdown_rx)));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        task.abort();
    }
    Ok(())
}
