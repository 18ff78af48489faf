//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build the registry, then start probing, then the admin API
//! - Bind the proxy listener last, so traffic only arrives when ready
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Reload replaces only the upstream set; other sections apply on restart

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::{validate_config, ProxyConfig, ValidationError};
use crate::health::HealthMonitor;
use crate::http::HttpServer;
use crate::lifecycle::Shutdown;
use crate::net::listener::{Listener, ListenerError};
use crate::registry::{Registry, RegistryError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to bind admin listener: {0}")]
    AdminBind(#[source] std::io::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Handle to a started router.
pub struct RunningProxy {
    local_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
    server: JoinHandle<Result<(), ListenerError>>,
    background: Vec<JoinHandle<()>>,
}

/// Start every subsystem in dependency order.
pub async fn start(config: ProxyConfig) -> Result<RunningProxy, StartupError> {
    validate_config(&config).map_err(StartupError::Validation)?;

    let registry = Arc::new(Registry::from_config(&config)?);
    tracing::info!(
        upstreams = registry.list().len(),
        algorithm = ?config.balancer.algorithm,
        "Registry initialized"
    );

    let shutdown = Shutdown::new();
    let mut background = Vec::new();

    let monitor = HealthMonitor::new(registry.clone(), config.health_check.clone());
    background.push(tokio::spawn(monitor.run(shutdown.subscribe())));

    let admin_addr = if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address)
            .await
            .map_err(StartupError::AdminBind)?;
        let addr = listener.local_addr().map_err(StartupError::AdminBind)?;
        let app = setup_admin_router(AdminState::new(registry.clone(), &config.admin.api_key));
        let mut admin_shutdown = shutdown.subscribe();
        background.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
        tracing::info!(address = %addr, "Admin API listening");
        Some(addr)
    } else {
        None
    };

    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
    let server = HttpServer::new(config, registry.clone());
    let server = tokio::spawn(server.run(listener, shutdown.subscribe()));

    Ok(RunningProxy {
        local_addr,
        admin_addr,
        registry,
        shutdown,
        server,
        background,
    })
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Apply a new upstream set without dropping traffic.
    pub fn reload(&self, config: &ProxyConfig) -> Result<(), StartupError> {
        validate_config(config).map_err(StartupError::Validation)?;
        self.registry.replace(&config.upstreams)?;
        Ok(())
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Wait until shutdown is triggered elsewhere and every task has finished.
    pub async fn wait(self) -> Result<(), ListenerError> {
        let result = match self.server.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "HTTP server task panicked");
                Ok(())
            }
        };
        for task in self.background {
            let _ = task.await;
        }
        result
    }

    /// Stop accepting, drain open connections and stop background tasks.
    pub async fn stop(self) -> Result<(), ListenerError> {
        self.shutdown.trigger();
        self.wait().await
    }
}
