use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use socketioxide::SocketIo;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod commands;
mod config;
mod events;
mod gateway;
mod matching;
mod models;
mod moderation;
mod premium;
mod routes;
mod schema;
mod store;
#[cfg(test)]
mod testing;

use anonchat_shared::clients::db::create_pool;
use anonchat_shared::clients::rabbitmq::RabbitMQClient;
use anonchat_shared::clients::redis::RedisClient;
use anonchat_shared::middleware::metrics_middleware;

use commands::CommandDispatcher;
use config::{AppConfig, StoreBackend};
use events::{EventPublisher, EventSink, PgArchive, RabbitSink};
use gateway::{socket, Gateway, Localizer, SocketGateway};
use matching::MatchmakingEngine;
use moderation::ModerationWorkflow;
use store::{InstanceLease, MemoryStore, RedisStore};

pub struct AppState {
    pub config: AppConfig,
    pub dispatcher: CommandDispatcher,
    /// Set when Redis backs the store; pinged by `/health`.
    pub redis: Option<RedisClient>,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    anonchat_shared::middleware::init_tracing("anonchat-matching");
    let metrics_handle = anonchat_shared::middleware::init_metrics();

    let config = AppConfig::load()?;
    let port = config.port;

    let localizer = Arc::new(Localizer::from_file(&config.lang_file, &config.default_language)?);
    let events = EventPublisher::new(build_sinks(&config).await?);

    let socket_gateway = Arc::new(SocketGateway::new(localizer.clone()));
    let gateway: Arc<dyn Gateway> = socket_gateway.clone();
    let search_poll = Duration::from_secs(config.search_poll_secs);

    let (engine, redis, lease) = match config.store {
        StoreBackend::Redis => {
            let redis = RedisClient::connect(&config.redis_url).await?;
            let lease = InstanceLease::acquire(redis.clone(), Duration::from_secs(config.lease_ttl_secs))
                .await?
                .ok_or_else(|| anyhow::anyhow!("another anonchat-matching instance holds the Redis lease"))?;
            let store = Arc::new(RedisStore::new(redis.clone(), config.default_language.clone()));
            let engine = MatchmakingEngine::new(store, gateway, events, config.matching(), search_poll);
            (engine, Some(redis), Some(lease))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-process store, state is lost on restart");
            let store = Arc::new(MemoryStore::new(config.default_language.clone()));
            let engine = MatchmakingEngine::new(store, gateway, events, config.matching(), search_poll);
            (engine, None, None)
        }
    };

    let moderation = ModerationWorkflow::new(engine.clone());
    let dispatcher = CommandDispatcher::new(engine.clone(), moderation, localizer);
    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs);

    let state = Arc::new(AppState {
        config,
        dispatcher,
        redis,
        metrics_handle,
    });

    let (sio_layer, io) = SocketIo::builder().with_state(state.clone()).build_layer();
    socket_gateway.attach(io.clone());
    io.ns("/", socket::on_connect);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(matching::sweeper::run(engine, cleanup_interval, shutdown.clone()));
    let lease_keeper = lease.map(|lease| tokio::spawn(lease.keep_alive(shutdown.clone())));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route("/stats", get(routes::stats::get_stats))
        .layer(sio_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics_middleware))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "anonchat-matching starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    if let Some(keeper) = lease_keeper {
        keeper.await?;
    }
    tracing::info!("anonchat-matching stopped");

    Ok(())
}

/// Event sinks enabled by configuration. A sink whose backend is down at
/// startup is skipped rather than failing the service.
async fn build_sinks(config: &AppConfig) -> anyhow::Result<Vec<Arc<dyn EventSink>>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();

    if config.events_enabled {
        match RabbitMQClient::connect(&config.rabbitmq_url).await {
            Ok(client) => sinks.push(Arc::new(RabbitSink::new(client))),
            Err(e) => tracing::error!(error = %e, "RabbitMQ unavailable, domain events will not be published"),
        }
    }

    if config.archive_enabled {
        let pool = create_pool(&config.database_url, 5)?;
        sinks.push(Arc::new(PgArchive::new(pool)));
    }

    tracing::info!(sinks = sinks.len(), "event sinks configured");
    Ok(sinks)
}

/// Resolves on ctrl-c, or when something else (a lost instance lease)
/// cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown requested"),
        _ = shutdown.cancelled() => tracing::info!("shutdown triggered internally"),
    }
    shutdown.cancel();
}
