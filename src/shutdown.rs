use crate::{
    cache::CacheManager,
    gateway::{ConnectionRegistry, NotificationRelay},
    jobs::JobScheduler,
    storage::RecordStore,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    signal,
    sync::{RwLock, watch},
    time::timeout,
};
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a receiver for shutdown notifications
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Initiate graceful shutdown. Only the first call broadcasts.
    pub fn initiate_shutdown(&self) {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            if let Err(e) = self.shutdown_tx.send(true) {
                error!("Failed to broadcast shutdown signal: {}", e);
            }
        }
    }

    /// Resolves once shutdown has been initiated, by a signal or programmatically
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Wait for SIGINT/SIGTERM, then initiate shutdown.
    ///
    /// A handler that cannot be installed is logged and never fires, so the
    /// other signal (or a programmatic shutdown) still works.
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            },
            _ = terminate => {
                info!("Received terminate signal");
            },
            _ = self.wait_for_shutdown() => {
                return;
            }
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait GracefulShutdown {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Stops registered components one after another, each under a timeout
pub struct ShutdownManager {
    components: Vec<Box<dyn GracefulShutdown + Send + Sync>>,
    timeout_duration: Duration,
}

impl ShutdownManager {
    pub fn new(timeout_duration: Duration) -> Self {
        Self {
            components: Vec::new(),
            timeout_duration,
        }
    }

    pub fn register<T>(&mut self, component: T)
    where
        T: GracefulShutdown + Send + Sync + 'static,
    {
        self.components.push(Box::new(component));
    }

    /// Register all server components in shutdown order: stop producing
    /// artifacts, drain connections, stop relaying, then release backends.
    pub fn register_server_components(&mut self, server: &crate::server::Server) {
        self.register(JobSchedulerShutdown::new(server.job_scheduler.clone()));
        self.register(GatewayShutdown::new(
            server.gateway.registry.clone(),
            server.config.shutdown.connections_timeout_seconds,
        ));
        self.register(RelayShutdown::new(server.gateway.relay.clone()));
        self.register(CacheShutdown::new(server.cache.clone()));
        self.register(StoreShutdown::new(server.store.clone()));
        self.register(HttpServerShutdown::new("HTTP Server".to_string()));
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Shutdown all registered components
    pub async fn shutdown_all(&self) {
        info!("Shutting down {} components...", self.components.len());

        for component in &self.components {
            let component_name = component.name();

            match timeout(self.timeout_duration, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Successfully shut down component: {}", component_name);
                }
                Ok(Err(e)) => {
                    error!("Error shutting down component {}: {}", component_name, e);
                }
                Err(_) => {
                    error!("Timeout shutting down component: {}", component_name);
                }
            }
        }

        info!("Shutdown complete");
    }
}

pub struct StoreShutdown {
    store: Arc<dyn RecordStore>,
}

impl StoreShutdown {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for StoreShutdown {
    fn name(&self) -> &str {
        "Record Store"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Pooled connections close when the last store handle drops
        info!(
            backend = self.store.backend_name(),
            "Record store shutdown completed"
        );
        Ok(())
    }
}

pub struct CacheShutdown {
    cache: CacheManager,
}

impl CacheShutdown {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for CacheShutdown {
    fn name(&self) -> &str {
        "Cache"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            backend = %self.cache.config().backend,
            "Cache shutdown completed"
        );
        Ok(())
    }
}

/// HTTP server shutdown wrapper. Axum's graceful shutdown does the work.
pub struct HttpServerShutdown {
    name: String,
}

impl HttpServerShutdown {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for HttpServerShutdown {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("HTTP server shutdown initiated");
        Ok(())
    }
}

pub struct RelayShutdown {
    relay: Arc<NotificationRelay>,
}

impl RelayShutdown {
    pub fn new(relay: Arc<NotificationRelay>) -> Self {
        Self { relay }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for RelayShutdown {
    fn name(&self) -> &str {
        "Notification Relay"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.relay.stop().await;
        info!("Notification relay shutdown completed");
        Ok(())
    }
}

/// Signals every gateway connection to close, then waits for them to drain
pub struct GatewayShutdown {
    registry: Arc<ConnectionRegistry>,
    timeout_seconds: u64,
}

impl GatewayShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, timeout_seconds: u64) -> Self {
        Self {
            registry,
            timeout_seconds,
        }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for GatewayShutdown {
    fn name(&self) -> &str {
        "Gateway Connections"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Shutting down gateway connections...");
        self.registry.signal_all_to_close().await;

        let completed = self
            .registry
            .wait_for_all(Duration::from_secs(self.timeout_seconds))
            .await;

        if !completed {
            warn!("Some gateway connections did not close within timeout");
        }
        Ok(())
    }
}

pub struct JobSchedulerShutdown {
    job_scheduler: Arc<RwLock<JobScheduler>>,
}

impl JobSchedulerShutdown {
    pub fn new(job_scheduler: Arc<RwLock<JobScheduler>>) -> Self {
        Self { job_scheduler }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for JobSchedulerShutdown {
    fn name(&self) -> &str {
        "Job Scheduler"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Shutting down job scheduler...");

        let mut scheduler = self.job_scheduler.write().await;
        scheduler.stop().await;

        info!("Job scheduler shutdown completed");
        Ok(())
    }
}
