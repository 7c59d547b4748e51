//! http endpoint receiving grafana/alertmanager webhooks
//!
//! `POST /` sends to the configured default bot, `POST /{bot}` to the named one.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
	extract::{rejection::JsonRejection, Json, Path, Request, State},
	http::{header, HeaderMap, StatusCode},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::post,
	Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{
	alert::Notification,
	card::{CardEmitter, CardPayload},
	enrichment::Enricher,
	interpreter::{self, ProcessingMode},
	metrics::RelayMetrics,
	settings::{BasicAuth, Settings},
};

/// Error failing an incoming request
#[derive(Error, Debug)]
pub enum RelayError {
	#[error(transparent)]
	Payload(#[from] JsonRejection),
	#[error("no bot in request path and no default bot configured")]
	MissingBot,
	#[error("failed to deliver card: {0}")]
	Delivery(#[from] reqwest::Error),
}

impl IntoResponse for RelayError {
	fn into_response(self) -> Response {
		match self {
			RelayError::Payload(rejection) => rejection.into_response(),
			RelayError::MissingBot => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
			RelayError::Delivery(_) => (StatusCode::BAD_GATEWAY, self.to_string()).into_response(),
		}
	}
}

pub struct ReceiverState {
	mode: ProcessingMode,
	default_bot: Option<String>,
	auth: Option<BasicAuth>,
	enricher: Option<Enricher>,
	emitter: CardEmitter,
	metrics: Arc<RelayMetrics>,
}

impl ReceiverState {
	pub fn new(settings: &Settings, metrics: Arc<RelayMetrics>) -> Result<Self> {
		let destination = &settings.destination;

		let emitter =
			CardEmitter::new(destination.base_url.clone(), destination.timeout, metrics.clone())?;

		let enricher = settings
			.enrichment
			.clone()
			.map(|enrichment| Enricher::new(enrichment, metrics.clone()))
			.transpose()?;

		Ok(Self {
			mode: settings.processing_mode,
			default_bot: destination.default_bot.clone(),
			auth: settings.auth.clone(),
			enricher,
			emitter,
			metrics,
		})
	}

	/// interprets the notification and sends one card per resulting [interpreter::CardContent]
	async fn relay(&self, bot: Option<String>, notification: Notification) -> Result<(), RelayError> {
		self.metrics.record_notification(self.mode.as_str());

		let cards = interpreter::interpret(&notification, self.mode);
		if cards.is_empty() {
			tracing::debug!("notification without alerts, nothing to relay");
			return Ok(());
		}

		let bot = bot
			.filter(|bot| !bot.is_empty())
			.or_else(|| self.default_bot.clone())
			.ok_or(RelayError::MissingBot)?;

		tracing::info!("relaying {} card(s) to bot {bot}", cards.len());

		for mut content in cards {
			if let Some(enricher) = &self.enricher {
				content.description = enricher.enrich(content.description).await;
			}

			self.emitter.send(&bot, &CardPayload::from(content)).await?;
		}

		Ok(())
	}
}

/// checks `Authorization: Basic ...` against the configured credentials
fn authorized(auth: &BasicAuth, headers: &HeaderMap) -> bool {
	let credentials = headers
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		// the scheme is case insensitive
		.and_then(|value| match (value.get(..6), value.get(6..)) {
			(Some(scheme), Some(encoded)) if scheme.eq_ignore_ascii_case("basic ") => Some(encoded),
			_ => None,
		})
		.and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
		.and_then(|decoded| String::from_utf8(decoded).ok());

	match credentials.as_deref().and_then(|credentials| credentials.split_once(':')) {
		Some((username, password)) => username == auth.username && password == auth.password,
		None => false,
	}
}

async fn basic_auth(
	State(state): State<Arc<ReceiverState>>,
	request: Request,
	next: Next,
) -> Response {
	match &state.auth {
		Some(auth) if !authorized(auth, request.headers()) => {
			tracing::debug!("rejected request with missing or invalid credentials");
			(
				StatusCode::UNAUTHORIZED,
				[(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
			)
				.into_response()
		}
		_ => next.run(request).await,
	}
}

async fn receive(
	state: &ReceiverState,
	bot: Option<String>,
	notification: Result<Json<Notification>, JsonRejection>,
) -> Result<StatusCode, RelayError> {
	let Json(notification) = notification.map_err(|err| {
		tracing::debug!("failed to deserialize notification: {:?}", err);
		err
	})?;

	state.relay(bot, notification).await.map_err(|err| {
		tracing::error!("{err}");
		err
	})?;

	Ok(StatusCode::NO_CONTENT)
}

async fn receive_default(
	State(state): State<Arc<ReceiverState>>,
	notification: Result<Json<Notification>, JsonRejection>,
) -> Result<StatusCode, RelayError> {
	receive(&state, None, notification).await
}

async fn receive_for_bot(
	State(state): State<Arc<ReceiverState>>,
	Path(bot): Path<String>,
	notification: Result<Json<Notification>, JsonRejection>,
) -> Result<StatusCode, RelayError> {
	receive(&state, Some(bot), notification).await
}

pub fn router(state: Arc<ReceiverState>) -> Router {
	Router::new()
		.route("/", post(receive_default))
		.route("/:bot", post(receive_for_bot))
		.route_layer(middleware::from_fn_with_state(state.clone(), basic_auth))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

pub async fn run_webhook_receiver(settings: &Settings, metrics: Arc<RelayMetrics>) -> Result<()> {
	let state = Arc::new(ReceiverState::new(settings, metrics)?);
	let addr = settings.listen_address;

	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind webhook receiver to {addr}"))?;
	tracing::info!("listening for webhooks on {addr}");

	axum::serve(listener, router(state)).await.context("webhook endpoint crashed")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use axum::body::{to_bytes, Body};
	use serde_json::{json, Value};
	use tower::ServiceExt;
	use wiremock::{
		matchers::{method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;
	use crate::{enrichment::EnrichmentFallback, settings::RawSettings};

	const BODY: &str = r#"{"status":"firing","commonAnnotations":{"summary":"CPU high","description":"load avg 8.2"},"alerts":[]}"#;

	fn raw(destination: &MockServer) -> RawSettings {
		RawSettings {
			feishu_webhook_base: Some(format!("{}/hook", destination.uri())),
			..Default::default()
		}
	}

	fn app(raw: RawSettings) -> (Router, Arc<RelayMetrics>) {
		let settings = Settings::resolve(raw).unwrap();
		let metrics = Arc::new(RelayMetrics::new().unwrap());
		let state = Arc::new(ReceiverState::new(&settings, metrics.clone()).unwrap());

		(router(state), metrics)
	}

	fn post(uri: &str, body: &str) -> Request {
		axum::http::Request::builder()
			.method("POST")
			.uri(uri)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_owned()))
			.unwrap()
	}

	async fn card_bodies(server: &MockServer) -> Vec<Value> {
		server
			.received_requests()
			.await
			.unwrap()
			.iter()
			.map(|request| serde_json::from_slice(&request.body).unwrap())
			.collect()
	}

	async fn mount_destination(server: &MockServer, bot_path: &str, expected: u64) {
		Mock::given(method("POST"))
			.and(path(bot_path))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
			.expect(expected)
			.mount(server)
			.await;
	}

	#[tokio::test]
	async fn firing_notification_is_relayed() {
		let destination = MockServer::start().await;
		let ai = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 1).await;
		Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).expect(0).mount(&ai).await;

		let (app, _) = app(RawSettings {
			// without an api key the base url is never used
			openai_base_url: Some(ai.uri()),
			..raw(&destination)
		});
		let response = app.oneshot(post("/abc", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert!(to_bytes(response.into_body(), 1024).await.unwrap().is_empty());

		let cards = card_bodies(&destination).await;
		assert_eq!(cards.len(), 1);
		assert_eq!(cards[0]["card"]["header"]["title"]["content"], "CPU high");
		assert_eq!(cards[0]["card"]["header"]["template"], "red");
		assert_eq!(cards[0]["card"]["elements"][0]["text"]["content"], "load avg 8.2");

		let raw_body = String::from_utf8(destination.received_requests().await.unwrap()[0].body.clone()).unwrap();
		assert!(raw_body.contains(r#""content":"CPU high""#));
		assert!(raw_body.contains(r#""template":"red""#));
	}

	#[tokio::test]
	async fn resolved_notification_is_green() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 1).await;

		let (app, _) = app(raw(&destination));
		let body = BODY.replace("firing", "resolved");
		let response = app.oneshot(post("/abc", &body)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert_eq!(card_bodies(&destination).await[0]["card"]["header"]["template"], "green");
	}

	#[tokio::test]
	async fn default_bot_is_used_without_path() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/default-bot", 1).await;

		let (app, _) = app(RawSettings {
			feishu_webhook_uuid: Some("default-bot".to_owned()),
			..raw(&destination)
		});
		let response = app.oneshot(post("/", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
	}

	#[tokio::test]
	async fn missing_bot_fails_fast() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/", 0).await;

		let (app, _) = app(raw(&destination));
		let response = app.oneshot(post("/", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn malformed_json_is_rejected() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 0).await;

		let (app, _) = app(raw(&destination));
		let response = app.oneshot(post("/abc", "{\"status\": ")).await.unwrap();

		assert!(response.status().is_client_error());
	}

	#[tokio::test]
	async fn per_alert_without_alerts_needs_no_bot() {
		let destination = MockServer::start().await;
		Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&destination).await;

		let (app, _) = app(RawSettings {
			processing_mode: Some(ProcessingMode::PerAlert),
			..raw(&destination)
		});
		let response = app.oneshot(post("/", r#"{"status":"firing","alerts":[]}"#)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
	}

	#[tokio::test]
	async fn per_alert_mode() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 2).await;

		let (app, metrics) = app(RawSettings {
			processing_mode: Some(ProcessingMode::PerAlert),
			..raw(&destination)
		});

		let response = app.clone().oneshot(post("/abc", BODY)).await.unwrap();
		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert!(card_bodies(&destination).await.is_empty());

		let body = json!({
			"status": "firing",
			"alerts": [
				{"status": "firing", "labels": {"alertname": "HighCPU"}},
				{"status": "resolved", "labels": {"alertname": "DiskFull"}, "annotations": {"description": "disk ok"}}
			]
		});
		let response = app.oneshot(post("/abc", &body.to_string())).await.unwrap();
		assert_eq!(response.status(), StatusCode::NO_CONTENT);

		let cards = card_bodies(&destination).await;
		assert_eq!(cards.len(), 2);
		assert_eq!(cards[0]["card"]["header"]["title"]["content"], "HighCPU");
		assert_eq!(cards[0]["card"]["elements"][0]["text"]["content"], "[No description]");
		assert_eq!(cards[1]["card"]["header"]["title"]["content"], "DiskFull");
		assert_eq!(cards[1]["card"]["header"]["template"], "green");
		assert_eq!(metrics.delivered("200"), 2);
	}

	#[tokio::test]
	async fn destination_error_status_still_succeeds() {
		let destination = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(404).set_body_string("bot not found"))
			.expect(1)
			.mount(&destination)
			.await;

		let (app, _) = app(raw(&destination));
		let response = app.oneshot(post("/abc", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
	}

	#[tokio::test]
	async fn unreachable_destination_is_bad_gateway() {
		let (app, _) = app(RawSettings {
			feishu_webhook_base: Some("http://127.0.0.1:9/hook".to_owned()),
			delivery_timeout: Some(Duration::from_secs(2)),
			..Default::default()
		});
		let response = app.oneshot(post("/abc", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		let body = to_bytes(response.into_body(), 4096).await.unwrap();
		assert!(String::from_utf8_lossy(&body).starts_with("failed to deliver card"));
	}

	#[tokio::test]
	async fn slow_destination_is_bad_gateway() {
		let destination = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
			.mount(&destination)
			.await;

		let (app, metrics) = app(RawSettings {
			delivery_timeout: Some(Duration::from_millis(100)),
			..raw(&destination)
		});
		let response = app.oneshot(post("/abc", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		assert_eq!(metrics.delivered("200"), 0);
	}

	#[tokio::test]
	async fn enriched_description() {
		let destination = MockServer::start().await;
		let ai = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 1).await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"choices": [{"message": {"role": "assistant", "content": "```markdown\n### Analysis\n```"}}]
			})))
			.expect(1)
			.mount(&ai)
			.await;

		let (app, _) = app(RawSettings {
			openai_api_key: Some("sk-test".to_owned()),
			openai_base_url: Some(format!("{}/v1", ai.uri())),
			..raw(&destination)
		});
		let response = app.oneshot(post("/abc", BODY)).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		let cards = card_bodies(&destination).await;
		assert_eq!(cards[0]["card"]["header"]["title"]["content"], "CPU high");
		assert_eq!(cards[0]["card"]["elements"][0]["text"]["content"], "### Analysis");
	}

	#[tokio::test]
	async fn enrichment_failure_policies() {
		for (fallback, expected_prefix) in [
			(EnrichmentFallback::Diagnostic, "AI enrichment failed: "),
			(EnrichmentFallback::KeepOriginal, "load avg 8.2"),
		] {
			let destination = MockServer::start().await;
			let ai = MockServer::start().await;
			mount_destination(&destination, "/hook/abc", 1).await;
			Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&ai).await;

			let (app, _) = app(RawSettings {
				openai_api_key: Some("sk-test".to_owned()),
				openai_base_url: Some(ai.uri()),
				enrichment_fallback: Some(fallback),
				..raw(&destination)
			});
			let response = app.oneshot(post("/abc", BODY)).await.unwrap();

			assert_eq!(response.status(), StatusCode::NO_CONTENT);
			let cards = card_bodies(&destination).await;
			let description = cards[0]["card"]["elements"][0]["text"]["content"].as_str().unwrap();
			assert!(description.starts_with(expected_prefix), "{description}");
		}
	}

	#[tokio::test]
	async fn basic_auth_is_enforced() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 1).await;

		let (app, _) = app(RawSettings { webhook_auth: Some("grafana:secret".to_owned()), ..raw(&destination) });

		let response = app.clone().oneshot(post("/abc", BODY)).await.unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
		assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

		let mut request = post("/abc", BODY);
		let wrong = format!("Basic {}", STANDARD.encode("grafana:wrong"));
		request.headers_mut().insert(header::AUTHORIZATION, wrong.parse().unwrap());
		assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::UNAUTHORIZED);

		let mut request = post("/abc", BODY);
		let valid = format!("Basic {}", STANDARD.encode("grafana:secret"));
		request.headers_mut().insert(header::AUTHORIZATION, valid.parse().unwrap());
		assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::NO_CONTENT);
	}

	#[tokio::test]
	async fn basic_scheme_is_case_insensitive() {
		let destination = MockServer::start().await;
		mount_destination(&destination, "/hook/abc", 2).await;

		let (app, _) = app(RawSettings { webhook_auth: Some("grafana:secret".to_owned()), ..raw(&destination) });

		for scheme in ["basic", "BASIC"] {
			let mut request = post("/abc", BODY);
			let credentials = format!("{scheme} {}", STANDARD.encode("grafana:secret"));
			request.headers_mut().insert(header::AUTHORIZATION, credentials.parse().unwrap());
			assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::NO_CONTENT);
		}

		let mut request = post("/abc", BODY);
		let credentials = format!("Bearer {}", STANDARD.encode("grafana:secret"));
		request.headers_mut().insert(header::AUTHORIZATION, credentials.parse().unwrap());
		assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::UNAUTHORIZED);
	}
}
