//! Turns a [Notification] into the cards we are going to send.
//!
//! Title and description are resolved through ordered lookup chains: the
//! first source that is present wins, otherwise a literal default is used.

use serde::Deserialize;

use crate::alert::{Alert, Notification};

/// fallback title if no source provides one
pub const NO_TITLE: &str = "[No Title]";
/// fallback description if no source provides one
pub const NO_DESCRIPTION: &str = "[No description]";

/// How many cards are generated for a notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
	/// one card per notification built from the notification wide fields
	#[default]
	Grouped,
	/// one card per alert, nothing is sent for notifications without alerts
	PerAlert,
}

impl ProcessingMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Grouped => "grouped",
			Self::PerAlert => "per_alert",
		}
	}
}

/// header color of a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
	Green,
	Red,
}

impl StatusColor {
	pub fn from_status(status: &str) -> Self {
		if status == "resolved" {
			Self::Green
		} else {
			Self::Red
		}
	}

	/// template name understood by lark cards
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Green => "green",
			Self::Red => "red",
		}
	}
}

/// title, description and color of a single card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardContent {
	pub title: String,
	pub description: String,
	pub color: StatusColor,
}

/// a single place a title or description can be taken from
#[derive(Debug, Clone, Copy)]
enum Lookup {
	CommonAnnotation(&'static str),
	Annotation(&'static str),
	Label(&'static str),
	NotificationTitle,
	NotificationMessage,
}

const TITLE_LOOKUPS: &[Lookup] = &[
	Lookup::CommonAnnotation("summary"),
	Lookup::Annotation("summary"),
	Lookup::Label("alertname"),
	Lookup::NotificationTitle,
];

const DESCRIPTION_LOOKUPS: &[Lookup] = &[
	Lookup::CommonAnnotation("description"),
	Lookup::Annotation("description"),
	Lookup::NotificationMessage,
];

impl Lookup {
	fn get<'a>(&self, notification: &'a Notification, alert: Option<&'a Alert>) -> Option<&'a str> {
		match self {
			Lookup::CommonAnnotation(key) => notification.common_annotations.get(*key),
			Lookup::Annotation(key) => alert.and_then(|alert| alert.annotations.get(*key)),
			Lookup::Label(key) => alert.and_then(|alert| alert.labels.get(*key)),
			// grafana always sends those two, alertmanager never does
			Lookup::NotificationTitle => Some(&notification.title).filter(|title| !title.is_empty()),
			Lookup::NotificationMessage => {
				Some(&notification.message).filter(|message| !message.is_empty())
			}
		}
		.map(String::as_str)
	}
}

/// returns the value of the first lookup that succeeds, or `default`
fn resolve(
	lookups: &[Lookup],
	notification: &Notification,
	alert: Option<&Alert>,
	default: &str,
) -> String {
	lookups
		.iter()
		.find_map(|lookup| lookup.get(notification, alert))
		.unwrap_or(default)
		.to_owned()
}

fn card_content(notification: &Notification, alert: Option<&Alert>, status: &str) -> CardContent {
	CardContent {
		title: resolve(TITLE_LOOKUPS, notification, alert, NO_TITLE),
		description: resolve(DESCRIPTION_LOOKUPS, notification, alert, NO_DESCRIPTION),
		color: StatusColor::from_status(status),
	}
}

/// Interprets a notification according to `mode`.
///
/// In [ProcessingMode::Grouped] the per alert lookups consult the first alert
/// of the notification, if there is one.
pub fn interpret(notification: &Notification, mode: ProcessingMode) -> Vec<CardContent> {
	match mode {
		ProcessingMode::Grouped => {
			vec![card_content(notification, notification.alerts.first(), &notification.status)]
		}
		ProcessingMode::PerAlert => notification
			.alerts
			.iter()
			.map(|alert| card_content(notification, Some(alert), &alert.status))
			.collect(),
	}
}
