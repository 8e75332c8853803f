use edge_node::{
    config::Config,
    coordinator::{CoordinatorClient, NodeIdentity, CLIENT_BUILD},
    disk_cache::DiskCache,
    image_server::{HttpServingEngine, ImageServer, CACHE_FORMAT_VERSION, VALUE_COUNT},
    lifecycle::{LifecycleConfig, NodeLifecycleController, RequestActivity, SessionHandle},
    logging::LoggerManager,
    shutdown::ShutdownCoordinator,
    statistics::{self, Statistics},
    Result,
};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = LoggerManager::new(config.logging.clone(), hostname);
    logger.initialize()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads)
        .thread_name("edge-node-worker")
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {

    info!(
        "Starting edge node v{} build {} (built: {})",
        env!("CARGO_PKG_VERSION"),
        CLIENT_BUILD,
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Listening on {}:{} (advertised port {})",
        config.server.client_hostname,
        config.server.client_port,
        config.advertised_port()
    );
    info!(
        "Disk cache: dir={}, max_size={}MiB",
        config.cache.cache_dir.display(),
        config.cache.max_cache_size_mib
    );

    let cache = DiskCache::open(
        config.cache.cache_dir.clone(),
        VALUE_COUNT,
        CACHE_FORMAT_VERSION,
        config.cache.max_cache_size_bytes(),
    )?;

    let statistics = match statistics::load(&cache) {
        Ok(Some(snapshot)) => {
            info!(
                "Restored statistics: requests_served={}",
                snapshot.requests_served
            );
            Arc::new(Statistics::from_snapshot(&snapshot))
        }
        Ok(None) => Arc::new(Statistics::new()),
        Err(e) => {
            warn!("Failed to restore statistics, starting fresh: {}", e);
            Arc::new(Statistics::new())
        }
    };

    let identity = NodeIdentity {
        secret: config.coordinator.client_secret.clone(),
        port: config.advertised_port(),
        disk_space: config.cache.max_cache_size_bytes(),
        network_speed: config.network_speed_bytes_per_second(),
        build_version: CLIENT_BUILD,
    };
    let coordinator = Arc::new(CoordinatorClient::new(
        &config.coordinator.url,
        identity,
        config.coordinator.request_timeout,
    )?);

    let activity = RequestActivity::new();
    let session = SessionHandle::new();
    let image_server = Arc::new(ImageServer::new(
        Arc::clone(&cache),
        Arc::clone(&statistics),
        activity.clone(),
        session.clone(),
        config.server.threads,
        config.coordinator.request_timeout,
    )?
    .with_allowed_referers(config.server.allowed_referer_domains.clone()));
    let engine = HttpServingEngine::new(
        image_server,
        config.server.client_hostname.clone(),
        config.server.client_port,
    );

    let lifecycle_config = LifecycleConfig::from_config(&config);
    let shutdown_timeout =
        config.server.graceful_shutdown_wait + lifecycle_config.tick_interval * 2;
    let (mut controller, handle) = NodeLifecycleController::new(
        lifecycle_config,
        coordinator,
        engine,
        cache,
        statistics,
        activity,
        session,
    );

    if let Err(e) = controller.start().await {
        error!("Failed to start edge node: {}", e);
        controller.begin_shutdown().await;
        return Err(e);
    }

    let controller_task = tokio::spawn(controller.run());

    let shutdown_coordinator = ShutdownCoordinator::new(handle, shutdown_timeout);
    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
        controller_task.abort();
    }

    if let Err(e) = controller_task.await {
        if !e.is_cancelled() {
            error!("Lifecycle task failed: {}", e);
        }
    }

    info!("Edge node shutdown complete");
    Ok(())
}
