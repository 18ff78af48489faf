//! Active health checking.
//!
//! # Responsibilities
//! - Probe every upstream on a fixed interval, one task per upstream
//! - Report outcomes to the registry
//! - Follow registry reloads (spawn for new upstreams, stop removed ones)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::state::ProbeOutcome;
use crate::observability::metrics;
use crate::registry::{Registry, RegistryError};

const USER_AGENT: &str = "upstream-router-health-check";

/// Supervises one probe task per registered upstream.
pub struct HealthMonitor {
    prober: Prober,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, config: HealthCheckConfig) -> Self {
        Self {
            prober: Prober::new(registry, config),
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.prober.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.prober.config.interval_ms,
            timeout_ms = self.prober.config.timeout_ms,
            path = %self.prober.config.path,
            "Health monitor starting"
        );

        let mut changes = self.prober.registry.subscribe();
        let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();
        self.sync_tasks(&mut tasks);

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.sync_tasks(&mut tasks);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    /// Make the running tasks match the registry's current upstream set.
    fn sync_tasks(&self, tasks: &mut HashMap<String, JoinHandle<()>>) {
        let snapshot = self.prober.registry.list();

        tasks.retain(|id, task| {
            let keep = snapshot.get(id).is_some() && !task.is_finished();
            if !keep {
                tracing::debug!(upstream = %id, "Stopping probe");
                task.abort();
            }
            keep
        });

        for upstream in snapshot.iter() {
            if tasks.contains_key(upstream.id()) {
                continue;
            }
            let prober = self.prober.clone();
            let id = upstream.id().to_string();
            tracing::debug!(upstream = %id, "Starting probe");
            tasks.insert(id.clone(), tokio::spawn(async move { prober.probe_loop(id).await }));
        }
    }
}

/// Shared, cloneable probing context.
#[derive(Clone)]
pub struct Prober {
    registry: Arc<Registry>,
    config: Arc<HealthCheckConfig>,
    client: Client<HttpConnector, Body>,
}

impl Prober {
    pub fn new(registry: Arc<Registry>, config: HealthCheckConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout()));
        connector.set_nodelay(true);

        // Probes hold no pooled connections so every check exercises connect.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            registry,
            config: Arc::new(config),
            client,
        }
    }

    async fn probe_loop(self, id: String) {
        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcome = self.probe(&id).await;
            match self.registry.mark(&id, outcome) {
                Ok(_) => {}
                Err(RegistryError::UnknownUpstream(_)) => {
                    // Removed by a reload; the supervisor aborts this task shortly.
                    return;
                }
                Err(e) => tracing::error!(upstream = %id, error = %e, "Failed to record probe"),
            }

            if let Some(upstream) = self.registry.get(&id) {
                metrics::record_upstream_health(&id, upstream.state());
            }
        }
    }

    /// Issue one liveness check against an upstream.
    pub async fn probe(&self, id: &str) -> ProbeOutcome {
        let uri = format!("http://{}{}", id, self.config.path);
        let request = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::USER_AGENT, USER_AGENT)
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(upstream = %id, error = %e, "Failed to build health check request");
                return ProbeOutcome::Failure;
            }
        };

        let timeout: Duration = self.config.timeout();
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => {
                tracing::trace!(upstream = %id, status = %response.status(), "Health check passed");
                ProbeOutcome::Success
            }
            Ok(Ok(response)) => {
                tracing::debug!(upstream = %id, status = %response.status(), "Health check failed: non-success status");
                ProbeOutcome::Failure
            }
            Ok(Err(e)) => {
                tracing::debug!(upstream = %id, error = %e, "Health check failed: connection error");
                ProbeOutcome::Failure
            }
            Err(_) => {
                tracing::debug!(upstream = %id, "Health check failed: timeout");
                ProbeOutcome::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::health::state::{HealthPolicy, HealthState};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every connection with the given status line.
    async fn status_backend(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr.to_string()
    }

    /// Accepts connections and never answers.
    async fn stuck_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr.to_string()
    }

    fn fast_config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval_ms: 100,
            timeout_ms: 50,
            ..HealthCheckConfig::default()
        }
    }

    fn registry(addrs: &[&str]) -> Arc<Registry> {
        let configs: Vec<_> = addrs.iter().map(|a| UpstreamConfig::new(*a)).collect();
        Arc::new(Registry::new(&configs, HealthPolicy::default()).unwrap())
    }

    #[tokio::test]
    async fn classifies_responses() {
        let ok = status_backend("200 OK").await;
        let broken = status_backend("503 Service Unavailable").await;
        let stuck = stuck_backend().await;
        let registry = registry(&[ok.as_str(), broken.as_str(), stuck.as_str()]);
        let prober = Prober::new(registry, fast_config());

        assert_eq!(prober.probe(&ok).await, ProbeOutcome::Success);
        assert_eq!(prober.probe(&broken).await, ProbeOutcome::Failure);
        assert_eq!(prober.probe(&stuck).await, ProbeOutcome::Failure);
    }

    #[tokio::test]
    async fn stuck_upstream_does_not_block_others() {
        let stuck = stuck_backend().await;
        let broken = status_backend("500 Internal Server Error").await;
        let registry = registry(&[stuck.as_str(), broken.as_str()]);

        let (tx, rx) = broadcast::channel(1);
        let monitor = HealthMonitor::new(registry.clone(), fast_config());
        let handle = tokio::spawn(monitor.run(rx));

        // Three failed probes at 100ms intervals for both upstreams.
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.get(&broken).unwrap().state(), HealthState::Unhealthy);
        assert_eq!(registry.get(&stuck).unwrap().state(), HealthState::Unhealthy);

        let _ = tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn follows_registry_reload() {
        let first = status_backend("500 Internal Server Error").await;
        let second = status_backend("500 Internal Server Error").await;
        let registry = registry(&[first.as_str()]);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(HealthMonitor::new(registry.clone(), fast_config()).run(rx));

        registry.replace(&[UpstreamConfig::new(second.clone())]).unwrap();
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.get(&second).unwrap().state(), HealthState::Unhealthy);

        let _ = tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_monitor_returns_immediately() {
        let registry = registry(&["127.0.0.1:1"]);
        let config = HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        };
        let (_tx, rx) = broadcast::channel(1);
        HealthMonitor::new(registry.clone(), config).run(rx).await;
        assert_eq!(registry.get("127.0.0.1:1").unwrap().state(), HealthState::Healthy);
    }
}
