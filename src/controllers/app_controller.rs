//! App controller
//!
//! Watches Apps and the Deployments, Services and Ingresses they own.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{join_watches, spawn_derived_watch, spawn_source_watch, Context, WorkerPool};
use crate::adapters::Informer;
use crate::crd::App;
use crate::error::Result;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::app::{AppDeployment, AppIngress, AppService};
use crate::reconcilers::{DependentResource, Reconciler};

const QUEUE_NAME: &str = "app";

/// Run the App controller until `shutdown` fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    // Verify CRD is installed
    ctx.verify_api::<App>().await?;
    ctx.verify_api::<Deployment>().await?;
    ctx.verify_api::<Service>().await?;
    ctx.verify_api::<Ingress>().await?;

    info!("Starting App controller");

    let queue = Arc::new(WorkQueue::new(QUEUE_NAME, Box::new(ctx.config.rate_limiter())));
    let owner_kind = App::kind(&()).to_string();

    let apps = Informer::new(ctx.api::<App>(), ctx.watcher_config());
    let deployments = Informer::new(ctx.api::<Deployment>(), ctx.watcher_config());
    let services = Informer::new(ctx.api::<Service>(), ctx.watcher_config());
    let ingresses = Informer::new(ctx.api::<Ingress>(), ctx.watcher_config());
    let app_cache = apps.cache();
    let deployment_cache = deployments.cache();
    let service_cache = services.cache();
    let ingress_cache = ingresses.cache();

    let mut watches = JoinSet::new();
    spawn_source_watch(&mut watches, apps, queue.clone(), shutdown.clone());
    spawn_derived_watch(
        &mut watches,
        deployments,
        owner_kind.clone(),
        queue.clone(),
        shutdown.clone(),
    );
    spawn_derived_watch(
        &mut watches,
        services,
        owner_kind.clone(),
        queue.clone(),
        shutdown.clone(),
    );
    spawn_derived_watch(&mut watches, ingresses, owner_kind, queue.clone(), shutdown.clone());

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown before caches synced");
            join_watches(watches).await;
            return Ok(());
        }
        synced = async {
            tokio::try_join!(
                app_cache.wait_for_sync(),
                deployment_cache.wait_for_sync(),
                service_cache.wait_for_sync(),
                ingress_cache.wait_for_sync(),
            )
        } => {
            synced?;
        }
    }
    metrics::CONTROLLERS_SYNCING.dec();
    info!("App caches synced");

    let client = ctx.cluster_client();
    let reconciler = Reconciler::new(Arc::new(app_cache), ctx.cleanup_policy::<App>())
        .with_dependent(DependentResource::new(
            AppDeployment,
            Arc::new(deployment_cache),
            client.clone(),
        ))
        .with_dependent(DependentResource::new(
            AppService,
            Arc::new(service_cache),
            client.clone(),
        ))
        .with_dependent(DependentResource::new(
            AppIngress::from_config(&ctx.config),
            Arc::new(ingress_cache),
            client,
        ));

    WorkerPool::new(queue, Arc::new(reconciler), ctx.config.max_retries)
        .run(ctx.config.workers, shutdown)
        .await;
    join_watches(watches).await;

    info!("App controller stopped");
    Ok(())
}
