use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Arg, Command};
use config::Config;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use url::Url;

use crate::{
	enrichment::{self, EnrichmentFallback, EnrichmentSettings},
	interpreter::ProcessingMode,
};

/// webhook base used if neither `feishu_webhook` nor `feishu_webhook_base` are set
pub const DEFAULT_WEBHOOK_BASE: &str = "https://open.feishu.cn/open-apis/bot/v2/hook";

/// settings as read from the config file and the environment, empty strings
/// are treated like missing values
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSettings {
	pub feishu_webhook: Option<String>,
	pub feishu_webhook_base: Option<String>,
	pub feishu_webhook_uuid: Option<String>,
	pub webhook_auth: Option<String>,
	pub openai_api_key: Option<String>,
	pub openai_base_url: Option<String>,
	pub openai_model_name: Option<String>,
	pub openai_response_language: Option<String>,
	#[serde_as(as = "Option<DurationSeconds<f64>>")]
	pub ai_timeout: Option<Duration>,
	#[serde_as(as = "Option<DurationSeconds<f64>>")]
	pub delivery_timeout: Option<Duration>,
	pub enrichment_fallback: Option<EnrichmentFallback>,
	pub processing_mode: Option<ProcessingMode>,
	pub bind_address: Option<IpAddr>,
	pub port: Option<u16>,
	pub telemetry_bind_address: Option<IpAddr>,
	pub telemetry_port: Option<u16>,
	pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
	pub username: String,
	pub password: String,
}

/// where cards are sent to
#[derive(Debug, Clone)]
pub struct DestinationSettings {
	/// base url without trailing slash
	pub base_url: String,
	/// bot used if the request path doesn't name one
	pub default_bot: Option<String>,
	pub timeout: Duration,
}

/// resolved settings, constructed once at startup
#[derive(Debug, Clone)]
pub struct Settings {
	pub destination: DestinationSettings,
	pub auth: Option<BasicAuth>,
	/// [None] if no api key is configured
	pub enrichment: Option<EnrichmentSettings>,
	pub processing_mode: ProcessingMode,
	pub listen_address: SocketAddr,
	pub telemetry_address: SocketAddr,
	pub log_level: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
	value.filter(|value| !value.is_empty())
}

fn is_bot_uuid(segment: &str) -> bool {
	segment.len() == 36 && segment.bytes().all(|b| b == b'-' || b.is_ascii_digit() || b.is_ascii_lowercase())
}

/// Splits a complete webhook url into base url and bot uuid. If the last
/// path segment doesn't look like a uuid the whole url is used as base.
pub fn split_webhook(webhook: &str) -> (String, Option<String>) {
	let webhook = webhook.trim_end_matches('/');

	match webhook.rsplit_once('/') {
		Some((base, uuid)) if is_bot_uuid(uuid) => (base.to_owned(), Some(uuid.to_owned())),
		_ => (webhook.to_owned(), None),
	}
}

fn parse_basic_auth(value: &str) -> Result<BasicAuth> {
	match value.split_once(':') {
		Some((username, password)) => {
			Ok(BasicAuth { username: username.to_owned(), password: password.to_owned() })
		}
		None => bail!("webhook_auth must have the form `username:password`"),
	}
}

fn validate_url(url: &str, name: &str) -> Result<()> {
	Url::parse(url).with_context(|| format!("{name} `{url}` is not a valid url"))?;
	Ok(())
}

impl Settings {
	/// Parses the command line, reads the optional config file and the
	/// environment.
	pub fn load() -> Result<Self> {
		let opts = Command::new(clap::crate_name!())
			.version(clap::crate_version!())
			.about(clap::crate_description!())
			.author(clap::crate_authors!())
			.args(&[
				Arg::new("config")
					.help("path of config file, settings from the environment take precedence")
					.takes_value(true)
					.short('c')
					.long("config"),
				Arg::new("level")
					.help("log level")
					.possible_values(["Error", "Warn", "Info", "Debug", "Trace"])
					.ignore_case(true)
					.takes_value(true)
					.long("log"),
			])
			.get_matches();

		let mut builder = Config::builder();
		if let Some(config_path) = opts.value_of("config") {
			builder = builder.add_source(config::File::with_name(config_path));
		}
		let conf = builder
			.add_source(config::Environment::default())
			.build()
			.context("can't load config")?;

		let mut raw: RawSettings = conf.try_deserialize().context("can't load config")?;

		if let Some(level) = opts.value_of("level") {
			raw.log_level = Some(level.to_string());
		}

		Self::resolve(raw)
	}

	/// Applies defaults and validates `raw`.
	pub fn resolve(raw: RawSettings) -> Result<Self> {
		let (base_url, default_bot) = match non_empty(raw.feishu_webhook) {
			Some(webhook) => split_webhook(&webhook),
			None => {
				let base = non_empty(raw.feishu_webhook_base)
					.map(|base| base.trim_end_matches('/').to_owned())
					.unwrap_or_else(|| DEFAULT_WEBHOOK_BASE.to_owned());
				(base, non_empty(raw.feishu_webhook_uuid))
			}
		};
		validate_url(&base_url, "webhook base")?;

		let auth = non_empty(raw.webhook_auth).map(|auth| parse_basic_auth(&auth)).transpose()?;

		let enrichment = match non_empty(raw.openai_api_key) {
			Some(api_key) => {
				let base_url = non_empty(raw.openai_base_url)
					.map(|base| base.trim_end_matches('/').to_owned())
					.unwrap_or_else(|| enrichment::DEFAULT_BASE_URL.to_owned());
				validate_url(&base_url, "openai base url")?;

				Some(EnrichmentSettings {
					api_key,
					base_url,
					model: non_empty(raw.openai_model_name)
						.unwrap_or_else(|| enrichment::DEFAULT_MODEL.to_owned()),
					language: non_empty(raw.openai_response_language)
						.unwrap_or_else(|| "English".to_owned()),
					timeout: raw.ai_timeout.unwrap_or(Duration::from_secs(60)),
					fallback: raw.enrichment_fallback.unwrap_or_default(),
				})
			}
			None => None,
		};

		let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

		Ok(Self {
			destination: DestinationSettings {
				base_url,
				default_bot,
				timeout: raw.delivery_timeout.unwrap_or(Duration::from_secs(10)),
			},
			auth,
			enrichment,
			processing_mode: raw.processing_mode.unwrap_or_default(),
			listen_address: SocketAddr::new(raw.bind_address.unwrap_or(any), raw.port.unwrap_or(2387)),
			telemetry_address: SocketAddr::new(
				raw.telemetry_bind_address.unwrap_or(any),
				raw.telemetry_port.unwrap_or(9387),
			),
			log_level: non_empty(raw.log_level).unwrap_or_else(|| "info".to_owned()),
		})
	}
}
