//! Rewrites alert descriptions via an openai compatible chat completion api.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::RelayMetrics;

/// default chat completion base url
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// default model
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// What happens to the description if the chat completion request fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentFallback {
	/// replace the description with the error
	#[default]
	Diagnostic,
	/// leave the description untouched
	KeepOriginal,
}

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
	pub api_key: String,
	/// base url without trailing slash
	pub base_url: String,
	pub model: String,
	/// language the report should be written in
	pub language: String,
	pub timeout: Duration,
	pub fallback: EnrichmentFallback,
}

/// Error occuring during a chat completion request
#[derive(Error, Debug)]
pub enum EnrichmentError {
	#[error("request failed: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("api returned {status}: {body}")]
	Status { status: reqwest::StatusCode, body: String },
	#[error("response contained no message")]
	EmptyResponse,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
	role: &'static str,
	content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
	model: &'a str,
	messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
	content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
	message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
	choices: Vec<Choice>,
}

/// system prompt asking for a markdown report which renders in lark cards
pub fn system_prompt(language: &str) -> String {
	format!(
		"You are an experienced site reliability engineer. Analyze the following alert and reply \
		 with a concise, well structured Markdown report that renders in a Lark/Feishu card. The \
		 report must contain these sections:\n\
		 \n\
		 ### Analysis\n\
		 - **Summary**: [one sentence describing the problem]\n\
		 - **Probable causes**: [the 1-3 most likely causes]\n\
		 - **Impact**: [what this problem may affect]\n\
		 \n\
		 ### Remediation\n\
		 - **Troubleshooting steps**:\n  \
		   - [command or check that can be run directly]\n\
		 - **Recovery**:\n  \
		   - [command to restore the service]\n\
		 - **Root cause analysis**:\n  \
		   - [suggestion or command to find the root cause]\n\
		 \n\
		 Wrap every command in a Markdown code block so it can be copied. Reply in {language}."
	)
}

/// Strips a code fence (```` ``` ```` or ```` ```markdown ````) wrapping the whole reply.
pub fn strip_code_fence(reply: &str) -> &str {
	let mut reply = reply.trim();

	if let Some(rest) = reply.strip_prefix("```") {
		reply = rest.strip_prefix("markdown").unwrap_or(rest);
	}
	if let Some(rest) = reply.strip_suffix("```") {
		reply = rest;
	}

	reply.trim()
}

/// chat completion client
#[derive(Debug, Clone)]
pub struct Enricher {
	client: reqwest::Client,
	settings: EnrichmentSettings,
	system_prompt: String,
	metrics: Arc<RelayMetrics>,
}

impl Enricher {
	pub fn new(settings: EnrichmentSettings, metrics: Arc<RelayMetrics>) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(settings.timeout)
			.build()
			.context("failed to build chat completion http client")?;

		let system_prompt = system_prompt(&settings.language);

		Ok(Self { client, settings, system_prompt, metrics })
	}

	/// Asks the model for a report about `description`.
	pub async fn complete(&self, description: &str) -> Result<String, EnrichmentError> {
		let _timer = self.metrics.start_enrichment();

		let request = ChatCompletionRequest {
			model: &self.settings.model,
			messages: [
				ChatMessage { role: "system", content: &self.system_prompt },
				ChatMessage { role: "user", content: description },
			],
		};

		let response = self
			.client
			.post(format!("{}/chat/completions", self.settings.base_url))
			.bearer_auth(&self.settings.api_key)
			.json(&request)
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(EnrichmentError::Status { status, body });
		}

		let response: ChatCompletionResponse = response.json().await?;

		response
			.choices
			.into_iter()
			.next()
			.and_then(|choice| choice.message.content)
			.map(|content| strip_code_fence(&content).to_owned())
			.ok_or(EnrichmentError::EmptyResponse)
	}

	/// Returns the rewritten description. Failures never propagate, the
	/// [EnrichmentFallback] decides what is returned instead.
	pub async fn enrich(&self, description: String) -> String {
		tracing::info!("requesting alert analysis from {}", self.settings.model);

		match self.complete(&description).await {
			Ok(report) => {
				tracing::debug!("analysis: {report}");
				report
			}
			Err(err) => {
				self.metrics.record_enrichment_failure();
				tracing::warn!("chat completion request failed: {err}");

				match self.settings.fallback {
					EnrichmentFallback::Diagnostic => format!("AI enrichment failed: {err}"),
					EnrichmentFallback::KeepOriginal => description,
				}
			}
		}
	}
}
