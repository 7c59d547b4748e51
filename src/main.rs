//! grafana/alertmanager webhook receiver that forwards alerts into lark/feishu
//! group chats as interactive cards
//!
//! Features:
//! - forwards different webhook url paths to different bots
//! - one card per notification or one card per alert
//! - optional alert analysis via an openai compatible chat completion api
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::RelayMetrics;
use settings::Settings;

mod alert;
mod alertmanager_webhook_receiver;
mod card;
mod enrichment;
mod interpreter;
mod log;
mod metrics;
mod settings;
mod telemetry_endpoint;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	let settings = Settings::load().context("failed to load config and command line arguments")?;

	log::setup_logging(&settings.log_level).context("could not setup logging")?;

	if settings.destination.default_bot.is_none() {
		tracing::warn!("no default bot configured, webhooks must name a bot in their path");
	}
	if settings.auth.is_some() {
		tracing::info!("enabling basic auth");
	}
	if let Some(enrichment) = &settings.enrichment {
		tracing::info!("alert analysis enabled using {}", enrichment.model);
	}

	let metrics = Arc::new(RelayMetrics::new().context("failed to register metrics")?);

	let telemetry_address = settings.telemetry_address;
	let telemetry_metrics = metrics.clone();
	tokio::spawn(async move {
		#[allow(clippy::expect_used)]
		telemetry_endpoint::run_telemetry_endpoint(telemetry_address, telemetry_metrics)
			.await
			.expect("telemetry endpoint failed to start or crashed");
	});

	alertmanager_webhook_receiver::run_webhook_receiver(&settings, metrics).await
}
