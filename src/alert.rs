//! data structures for deserializing incoming notifications
//!
//! grafana and alertmanager both send more fields than listed here, serde
//! ignores the rest. Every field is optional on the wire.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

/// grafana sends `null` for empty maps in some versions, treat it like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// notification received by the webhook receiver
pub struct Notification {
	#[serde(deserialize_with = "null_as_default")]
	pub status: String,
	#[serde(deserialize_with = "null_as_default")]
	pub common_annotations: HashMap<String, String>,
	/// grafana only, fallback title
	#[serde(deserialize_with = "null_as_default")]
	pub title: String,
	/// grafana only, fallback description
	#[serde(deserialize_with = "null_as_default")]
	pub message: String,
	#[serde(deserialize_with = "null_as_default")]
	pub alerts: Vec<Alert>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// a single alert of a [Notification]
pub struct Alert {
	#[serde(deserialize_with = "null_as_default")]
	pub status: String,
	#[serde(deserialize_with = "null_as_default")]
	pub labels: HashMap<String, String>,
	#[serde(deserialize_with = "null_as_default")]
	pub annotations: HashMap<String, String>,
}
