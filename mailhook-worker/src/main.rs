//! Receive mail change notifications, resolve them into records and fan them out to consumers.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use mailhook_common::dedup::Deduplicator;
use mailhook_common::metrics::{serve, setup_metrics_routes};
use mailhook_common::retry::RetryPolicy;
use mailhook_worker::config::{Config, LogFormat};
use mailhook_worker::delivery::HttpDelivery;
use mailhook_worker::dispatcher::Dispatcher;
use mailhook_worker::error::WorkerError;
use mailhook_worker::events::TracingSink;
use mailhook_worker::handlers::{add_routes, IngressState};
use mailhook_worker::pipeline::Pipeline;
use mailhook_worker::provider::{GraphClient, GraphCredentials};
use mailhook_worker::targets::TargetStore;
use mailhook_worker::worker::{sweep_dedup, NotificationWorker};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down...");
}

fn setup_tracing(format: LogFormat) {
    let log_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    setup_tracing(config.log_format);

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .max_attempts(config.max_delivery_attempts)
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let dispatcher = Dispatcher::new(
        Arc::new(HttpDelivery::new()?),
        config.max_concurrent_deliveries,
        retry_policy,
    );

    let graph = Arc::new(GraphClient::new(
        GraphCredentials {
            tenant_id: config.graph.tenant_id.0.clone(),
            client_id: config.graph.client_id.0.clone(),
            client_secret: config.graph.client_secret.0.clone(),
        },
        config.graph.api_base_url.as_str(),
        config.graph.login_base_url.as_str(),
        config.graph.request_timeout.0,
    )?);

    let deduplicator = Arc::new(Deduplicator::new(config.dedup_ttl.0));
    let targets = Arc::new(TargetStore::new(
        config.targets_path.as_str(),
        config.targets_cache_ttl.0,
    ));

    let pipeline = Pipeline::new(
        deduplicator.clone(),
        graph.clone(),
        graph,
        targets,
        dispatcher,
        Arc::new(TracingSink),
    );

    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let worker = NotificationWorker::new("mailhook-worker", rx, pipeline);

    let router = add_routes(
        Router::new(),
        IngressState::new(config.client_state.as_str(), tx),
        config.max_body_size,
        config.max_concurrent_requests,
    );
    let router = setup_metrics_routes(router);

    tokio::spawn(sweep_dedup(deduplicator, config.dedup_sweep_interval.0));

    let bind = config.bind();
    info!(%bind, "starting mailhook worker");

    let mut worker_handle = tokio::spawn(worker.run());

    // The router owns the only sender: once the server has shut down the queue closes and the
    // worker finishes every batch that was already acknowledged.
    tokio::select! {
        served = serve(router, &bind, shutdown()) => served?,
        _ = &mut worker_handle => return Err(WorkerError::WorkerStopped),
    }

    info!("ingress stopped, draining accepted notifications");
    if let Err(e) = worker_handle.await {
        error!("notification worker failed while draining: {}", e);
        return Err(WorkerError::WorkerStopped);
    }

    info!("all accepted notifications processed, exiting");
    Ok(())
}
