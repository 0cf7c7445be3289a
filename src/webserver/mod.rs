//! HTTP API for watching a running pipeline.
//!
//! - `GET /status`: the latest status each operator published, as
//!   JSON. Operators that haven't published anything show up as
//!   `null`.
//! - `GET /metrics`: everything in the default Prometheus registry,
//!   in the text exposition format.

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::checkpoint::SourceStatus;
use crate::config::ApiConfig;
use crate::errors::TelemetryError;
use crate::replication::IngressStatus;

/// Receivers for whatever operators should be reported on.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    pub ingress: Option<watch::Receiver<Option<IngressStatus>>>,
    pub source: Option<watch::Receiver<Option<SourceStatus>>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ingress: Option<IngressStatus>,
    source: Option<SourceStatus>,
}

impl StatusBoard {
    fn snapshot(&self) -> StatusResponse {
        StatusResponse {
            ingress: self.ingress.as_ref().and_then(|rx| rx.borrow().clone()),
            source: self.source.as_ref().and_then(|rx| rx.borrow().clone()),
        }
    }
}

pub async fn run_webserver(port: u16, board: StatusBoard) -> Result<(), TelemetryError> {
    let shared_state = Arc::new(board);

    let app = Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            TelemetryError::Server(format!(
                "Unable to create local webserver at port {port}: {err}"
            ))
        })
}

async fn get_status(Extension(board): Extension<Arc<StatusBoard>>) -> impl IntoResponse {
    Json(board.snapshot())
}

async fn get_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Start the API server on its own runtime if it's enabled.
///
/// The server lives as long as the returned runtime.
pub fn start_server_runtime(
    config: &ApiConfig,
    board: StatusBoard,
) -> Result<Option<Runtime>, TelemetryError> {
    if !config.enabled {
        return Ok(None);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()?;
    let port = config.port;
    rt.spawn(async move {
        if let Err(err) = run_webserver(port, board).await {
            tracing::error!("{err}");
        }
    });
    Ok(Some(rt))
}

#[test]
fn snapshot_reports_latest_and_missing() {
    use crate::model::ReplicaId;
    use crate::model::SeqNum;

    let (tx, rx) = crate::runtime::status_channel();
    let board = StatusBoard {
        ingress: Some(rx),
        source: None,
    };
    assert!(board.snapshot().ingress.is_none());

    tx.send_replace(Some(IngressStatus {
        next_seq: SeqNum(4),
        pending: 1,
        replicas: vec![ReplicaId(0)],
        replica_epoch: 1,
    }));
    let json = serde_json::to_value(board.snapshot()).unwrap();
    assert_eq!(json["ingress"]["next_seq"], 4);
    assert_eq!(json["ingress"]["replicas"][0], 0);
    assert!(json["source"].is_null());
}

#[tokio::test]
async fn metrics_endpoint_serves_text_format() {
    let response = get_metrics().await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[test]
fn disabled_api_starts_nothing() {
    let rt = start_server_runtime(&ApiConfig::default(), StatusBoard::default()).unwrap();
    assert!(rt.is_none());
}
