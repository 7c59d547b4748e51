//! lark/feishu interactive cards and their delivery to the bot webhook

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use crate::{interpreter::CardContent, metrics::RelayMetrics};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TextElement {
	pub tag: &'static str,
	pub content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Header {
	pub title: TextElement,
	pub template: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DivElement {
	pub tag: &'static str,
	pub text: TextElement,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Card {
	pub header: Header,
	pub elements: Vec<DivElement>,
}

/// body of a bot webhook request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CardPayload {
	pub msg_type: &'static str,
	pub card: Card,
}

impl From<CardContent> for CardPayload {
	fn from(content: CardContent) -> Self {
		Self {
			msg_type: "interactive",
			card: Card {
				header: Header {
					title: TextElement { tag: "plain_text", content: content.title },
					template: content.color.as_str(),
				},
				elements: vec![DivElement {
					tag: "div",
					text: TextElement { tag: "lark_md", content: content.description },
				}],
			},
		}
	}
}

/// Posts cards to `{base_url}/{bot}`
#[derive(Debug, Clone)]
pub struct CardEmitter {
	client: reqwest::Client,
	base_url: String,
	metrics: Arc<RelayMetrics>,
}

impl CardEmitter {
	/// * `base_url` - webhook base url without trailing slash
	///
	/// * `timeout` - deadline of a single delivery
	pub fn new(base_url: String, timeout: Duration, metrics: Arc<RelayMetrics>) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("failed to build webhook http client")?;

		Ok(Self { client, base_url, metrics })
	}

	pub fn url(&self, bot: &str) -> String {
		format!("{}/{}", self.base_url, bot)
	}

	/// Delivers a card. Only transport errors are returned, a non success
	/// status of the destination is logged and counted.
	pub async fn send(&self, bot: &str, payload: &CardPayload) -> Result<(), reqwest::Error> {
		let url = self.url(bot);

		tracing::debug!("sending card to {url}: {payload:?}");

		let response = self
			.client
			.post(&url)
			.header(CONTENT_TYPE, "application/json; charset=UTF-8")
			.json(payload)
			.send()
			.await
			.map_err(|err| {
				self.metrics.record_delivery_error();
				err
			})?;

		let status = response.status();
		self.metrics.record_delivery(status);

		// drain the body so the connection can be reused
		let body = response.text().await.unwrap_or_default();

		if status.is_success() {
			tracing::debug!("webhook responded {status}: {body}");
		} else {
			tracing::warn!("webhook {url} responded {status}: {body}");
		}

		Ok(())
	}
}
