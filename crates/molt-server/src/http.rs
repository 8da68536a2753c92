//! The HTTP application served by child processes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use molt_ecdysis::listener::adopt_or_bind;
use molt_ecdysis::{
    ListenerEntry, ListenerGroup, ListenerSnapshot, ManagedListener, Result, ServiceHost,
    ServiceRegistry,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::config::ListenSpec;

/// Service name under which HTTP listeners appear in snapshots.
pub const SERVICE_NAME: &str = "http";

#[derive(Debug, Clone, Serialize)]
struct ServerInfo {
    service: &'static str,
    version: &'static str,
    pid: u32,
}

pub fn create_router() -> Router {
    let info = Arc::new(ServerInfo {
        service: "molt-server",
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    });

    Router::new()
        .route("/", get(server_info_handler))
        .route("/healthz", get(health_handler))
        .with_state(info)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Which process answered; useful for watching a restart hand over traffic.
async fn server_info_handler(State(info): State<Arc<ServerInfo>>) -> impl IntoResponse {
    (StatusCode::OK, Json(info.as_ref().clone()))
}

/// Simple health check endpoint (for load balancers)
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

async fn serve(listener: TcpListener, router: Router, stop: CancellationToken) {
    let addr = listener.local_addr().ok();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            info!(addr = ?addr, "HTTP server received shutdown signal, draining connections");
        })
        .await;
    if let Err(e) = result {
        warn!(addr = ?addr, error = %e, "HTTP server failed");
    }
}

/// Serves [`create_router`] on every configured or inherited listener.
pub struct HttpHost {
    listeners: Vec<ListenSpec>,
    drain_timeout: Duration,
    services: Arc<ServiceRegistry>,
}

impl HttpHost {
    pub fn new(
        listeners: Vec<ListenSpec>,
        drain_timeout: Duration,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            listeners,
            drain_timeout,
            services,
        }
    }

    /// Inherited entries first, then configured listeners the snapshot lacks.
    fn wanted(&self, snapshot: &ListenerSnapshot) -> BTreeMap<String, ListenerEntry> {
        let mut wanted = BTreeMap::new();
        for (service, name, entry) in snapshot.iter() {
            if service != SERVICE_NAME {
                warn!(service, listener = name, "Ignoring inherited listener of unknown service");
                continue;
            }
            wanted.insert(name.to_string(), entry.clone());
        }
        for spec in &self.listeners {
            wanted
                .entry(spec.name.clone())
                .or_insert_with(|| ListenerEntry::new(spec.addr.clone(), None));
        }
        wanted
    }
}

#[async_trait]
impl ServiceHost for HttpHost {
    async fn start(&self, snapshot: ListenerSnapshot) -> Result<()> {
        let group = Arc::new(ListenerGroup::new(SERVICE_NAME));
        // Registered up front so a partial start is still drained on shutdown.
        self.services.register(group.clone());

        let router = create_router();
        for (name, entry) in self.wanted(&snapshot) {
            let listener = adopt_or_bind(&entry).await?;
            let router = router.clone();
            let managed = ManagedListener::spawn(name, listener, self.drain_timeout, move |l, stop| {
                serve(l, router, stop)
            })?;
            group.add(managed);
        }

        info!(
            listeners = group.managed().len(),
            inherited = !snapshot.is_empty(),
            "HTTP service started"
        );
        Ok(())
    }

    fn snapshot(&self) -> ListenerSnapshot {
        self.services.snapshot()
    }
}
