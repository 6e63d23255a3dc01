//! Service ingress controller
//!
//! Watches Services and Ingresses and keeps one Ingress per Service
//! annotated with `ingress/http`.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{join_watches, spawn_derived_watch, spawn_source_watch, Context, WorkerPool};
use crate::adapters::Informer;
use crate::error::Result;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::service_ingress::ServiceIngress;
use crate::reconcilers::{DependentResource, Reconciler};

const QUEUE_NAME: &str = "service-ingress";

/// Run the Service ingress controller until `shutdown` fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    ctx.verify_api::<Service>().await?;
    ctx.verify_api::<Ingress>().await?;

    info!("Starting Service ingress controller");

    let queue = Arc::new(WorkQueue::new(QUEUE_NAME, Box::new(ctx.config.rate_limiter())));

    let services = Informer::new(ctx.api::<Service>(), ctx.watcher_config());
    let ingresses = Informer::new(ctx.api::<Ingress>(), ctx.watcher_config());
    let service_cache = services.cache();
    let ingress_cache = ingresses.cache();

    let mut watches = JoinSet::new();
    spawn_source_watch(&mut watches, services, queue.clone(), shutdown.clone());
    spawn_derived_watch(
        &mut watches,
        ingresses,
        Service::kind(&()).to_string(),
        queue.clone(),
        shutdown.clone(),
    );

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown before caches synced");
            join_watches(watches).await;
            return Ok(());
        }
        synced = async {
            tokio::try_join!(service_cache.wait_for_sync(), ingress_cache.wait_for_sync())
        } => {
            synced?;
        }
    }
    metrics::CONTROLLERS_SYNCING.dec();
    info!("Service ingress caches synced");

    let reconciler = Reconciler::new(Arc::new(service_cache), ctx.cleanup_policy::<Service>())
        .with_dependent(DependentResource::new(
            ServiceIngress::from_config(&ctx.config),
            Arc::new(ingress_cache),
            ctx.cluster_client(),
        ));

    WorkerPool::new(queue, Arc::new(reconciler), ctx.config.max_retries)
        .run(ctx.config.workers, shutdown)
        .await;
    join_watches(watches).await;

    info!("Service ingress controller stopped");
    Ok(())
}
