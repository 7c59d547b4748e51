//! Here we expose prometheus metrics about the relay
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
	extract::State,
	http::{header::CONTENT_TYPE, StatusCode},
	response::{IntoResponse, Response},
	routing::get,
	Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::RelayMetrics;

async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> Response {
	let mut buffer = vec![];
	let encoder = TextEncoder::new();
	let metric_families = metrics.registry.gather();

	if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
		tracing::error!("failed to encode metrics: {err}");
		return StatusCode::INTERNAL_SERVER_ERROR.into_response();
	}

	([(CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response()
}

pub fn router(metrics: Arc<RelayMetrics>) -> Router {
	Router::new().route("/metrics", get(metrics_handler)).with_state(metrics)
}

pub async fn run_telemetry_endpoint(addr: SocketAddr, metrics: Arc<RelayMetrics>) -> Result<()> {
	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind telemetry endpoint to {addr}"))?;

	axum::serve(listener, router(metrics)).await.context("telemetry endpoint crashed")?;

	Ok(())
}
