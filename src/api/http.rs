//! HTTP API Server
//!
//! `GET /health` reports whether the replica's store answers; `GET /stats`
//! reports its delivery counters and applied ledger.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::Result;
use crate::replica::{Replica, StatsSnapshot};

/// Shared application state
pub struct AppState {
    /// Replica being reported on
    pub replica: Arc<Replica>,
    /// Server start time
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, replica: Arc<Replica>) -> Self {
        let state = Arc::new(AppState {
            replica,
            started: Instant::now(),
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub replica_id: String,
    pub store: String,
    pub error: Option<String>,
}

/// Stats response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub replica_id: String,
    pub queue: String,
    pub uptime_seconds: u64,
    pub received: u64,
    pub writes_applied: u64,
    pub reads_answered: u64,
    pub duplicates_skipped: u64,
    pub discarded: u64,
    pub requeued: u64,
    pub ledger_entries: Option<u64>,
    pub last_applied_id: Option<String>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let replica = &state.replica;
    let result = replica.store().health_check().await;

    let status = if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy: result.is_ok(),
            replica_id: replica.id().to_string(),
            store: replica.store().kind().to_string(),
            error: result.err().map(|e| e.to_string()),
        }),
    )
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let replica = &state.replica;
    let StatsSnapshot {
        received,
        writes_applied,
        reads_answered,
        duplicates_skipped,
        discarded,
        requeued,
    } = replica.stats().snapshot();

    let ledger_entries = replica.ledger().applied_count().await.ok();
    let last_applied = replica.ledger().last_applied().await.ok().flatten();

    Json(StatsResponse {
        replica_id: replica.id().to_string(),
        queue: replica.queue_name().to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        received,
        writes_applied,
        reads_answered,
        duplicates_skipped,
        discarded,
        requeued,
        ledger_entries,
        last_applied_id: last_applied.as_ref().map(|(id, _)| id.to_string()),
        last_applied_at: last_applied.map(|(_, at)| at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Broker;
    use crate::config::ReplicaConfig;
    use crate::protocol::CommandId;
    use crate::state::AppliedLedger;
    use crate::store::SqliteStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn server() -> (HttpServer, Arc<AppliedLedger>) {
        let broker = Broker::new();
        let ledger = Arc::new(AppliedLedger::in_memory("replica1").unwrap());
        let replica = Replica::new(
            &ReplicaConfig::default(),
            Arc::new(broker.connect()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::clone(&ledger),
        );
        (HttpServer::new(ApiConfig::default(), Arc::new(replica)), ledger)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(router: Router, uri: &str) -> (StatusCode, T) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _) = server().await;
        let (status, body): (_, HealthResponse) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.healthy);
        assert_eq!(body.replica_id, "replica1");
        assert_eq!(body.store, "sqlite");
    }

    #[tokio::test]
    async fn test_stats() {
        let (server, ledger) = server().await;
        ledger.record_applied(&CommandId::from("w1"), "writer").await.unwrap();

        let (status, body): (_, StatsResponse) = get_json(server.router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.queue, "replica_replica1");
        assert_eq!(body.ledger_entries, Some(1));
        assert_eq!(body.last_applied_id.as_deref(), Some("w1"));
        assert_eq!(body.received, 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (server, _) = server().await;
        let response = server
            .router()
            .oneshot(Request::builder().uri("/cluster").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
