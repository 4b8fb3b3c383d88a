use crate::{
    cache::CacheManager,
    config::Config,
    error::AppError,
    gateway::{Gateway, relay::Backoff},
    health::HealthService,
    jobs::{JobScheduler, build_jobs},
    metrics,
    routes::{
        analytics::service_banner, create_analytics_routes, create_gateway_routes,
        create_health_routes,
    },
    shutdown::{ShutdownCoordinator, ShutdownManager},
    storage::{RecordStore, StorageFactory, StoreHealthChecker},
};
use axum::{Router, middleware, routing::get};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::RwLock, time::timeout};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub cache: CacheManager,
    pub health_service: Arc<HealthService>,
    pub gateway: Gateway,
    pub shutdown_coordinator: Arc<ShutdownCoordinator>,
    pub job_scheduler: Arc<RwLock<JobScheduler>>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        if config.metrics.enabled {
            metrics::init_metrics(config.metrics.port).map_err(|e| {
                error!(
                    "Failed to start metrics server on port {}: {}",
                    config.metrics.port, e
                );
                AppError::Internal(format!("Failed to start metrics server: {}", e))
            })?;
            info!("Metrics server started on port {}", config.metrics.port);
        }

        let store = StorageFactory::create_record_store(&config.store)?;
        let cache = CacheManager::new_from_config(&config.cache).await?;

        Ok(Self::with_components(config, store, cache).await)
    }

    /// Assemble a server around already-built backends
    pub async fn with_components(
        config: Config,
        store: Arc<dyn RecordStore>,
        cache: CacheManager,
    ) -> Self {
        let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
        let gateway = Gateway::new(config.gateway.clone(), cache.clone());
        let job_scheduler = Arc::new(RwLock::new(JobScheduler::with_shutdown_coordinator(
            config.analysis.clone(),
            shutdown_coordinator.subscribe(),
        )));

        let health_service = Arc::new(HealthService::new());
        health_service
            .register(Arc::new(StoreHealthChecker::new(store.clone())))
            .await;
        health_service.register(Arc::new(cache.clone())).await;
        health_service.register(gateway.relay.clone()).await;

        Self {
            config: Arc::new(config),
            store,
            cache,
            health_service,
            gateway,
            shutdown_coordinator,
            job_scheduler,
        }
    }

    /// Start the relay and the analysis scheduler without serving HTTP
    pub async fn start_background(&self) -> Result<(), AppError> {
        let backoff = Backoff {
            initial: self.config.gateway.relay_initial_backoff(),
            max: self.config.gateway.relay_max_backoff(),
        };
        self.gateway
            .relay
            .start(
                self.cache.clone(),
                backoff,
                self.shutdown_coordinator.subscribe(),
            )
            .await;

        let jobs = build_jobs(&self.config.analysis, self.store.clone(), self.cache.clone());
        self.job_scheduler.write().await.start(jobs).await
    }

    pub async fn run(&self) -> Result<(), AppError> {
        let mut shutdown_manager =
            ShutdownManager::new(Duration::from_secs(self.config.shutdown.timeout_seconds));
        shutdown_manager.register_server_components(self);

        self.start_background().await?;

        let app = self.create_app();

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to bind to address: {}", e)))?;

        info!("Server listening on http://{}", addr);

        let shutdown_coordinator = self.shutdown_coordinator.clone();
        tokio::spawn(async move {
            shutdown_coordinator.wait_for_shutdown_signal().await;
        });

        let graceful = self.shutdown_coordinator.clone();
        let serve_future = axum::serve(listener, app).with_graceful_shutdown(async move {
            graceful.wait_for_shutdown().await;
            info!("Graceful shutdown initiated");
        });
        let mut serve_task = tokio::spawn(async move { serve_future.await });

        tokio::select! {
            result = &mut serve_task => {
                match result {
                    Ok(Err(e)) => error!("Server error: {}", e),
                    Err(e) => error!("Server task failed: {}", e),
                    Ok(Ok(())) => {}
                }
                self.shutdown_coordinator.initiate_shutdown();
            }
            _ = self.shutdown_coordinator.wait_for_shutdown() => {}
        }

        // Open WebSocket sessions are closed by the manager, after which the
        // HTTP listener can finish draining
        shutdown_manager.shutdown_all().await;

        if !serve_task.is_finished() {
            let drain = Duration::from_secs(self.config.shutdown.timeout_seconds);
            if timeout(drain, serve_task).await.is_err() {
                error!("HTTP server did not drain within {:?}", drain);
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }

    pub fn create_app(&self) -> Router {
        let mut app = Router::new()
            .route("/", get(service_banner))
            .nest("/api", create_analytics_routes())
            .merge(create_gateway_routes())
            .with_state(self.clone())
            .nest(
                "/health",
                create_health_routes().with_state(self.health_service.clone()),
            )
            .layer(CorsLayer::permissive());

        if self.config.metrics.enabled {
            app = app.layer(middleware::from_fn(metrics::metrics_middleware));
        }
        app
    }
}
