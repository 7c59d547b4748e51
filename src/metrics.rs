//! prometheus meters for the relay

use prometheus::{
	exponential_buckets, histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry,
};

#[derive(Debug, Clone)]
/// prometheus meters, registered in their own [Registry] so every
/// [RelayMetrics] can be exposed independently
pub struct RelayMetrics {
	/// registry containing all meters below
	pub registry: Registry,
	/// total number of deserialized notifications
	received_notifications: IntCounterVec,
	/// cards accepted by the transport, labeled with the destination http status
	cards_delivered: IntCounterVec,
	/// cards which could not be delivered at all
	delivery_errors: IntCounter,
	/// total number of chat completion requests
	enrichment_requests: IntCounter,
	/// chat completion requests which failed
	enrichment_failures: IntCounter,
	/// duration of chat completion requests
	enrichment_duration: Histogram,
}

impl RelayMetrics {
	pub fn new() -> Result<Self, prometheus::Error> {
		let registry = Registry::new();

		let received_notifications = IntCounterVec::new(
			opts!("received_notifications_total", "total number of deserialized notifications")
				.namespace("larkrelay")
				.subsystem("webhook"),
			&["mode"],
		)?;

		let cards_delivered = IntCounterVec::new(
			opts!("cards_delivered_total", "cards posted to the destination webhook")
				.namespace("larkrelay")
				.subsystem("card"),
			&["http_status"],
		)?;

		let delivery_errors = IntCounter::with_opts(
			opts!("delivery_errors_total", "cards which could not be posted to the destination")
				.namespace("larkrelay")
				.subsystem("card"),
		)?;

		let enrichment_requests = IntCounter::with_opts(
			opts!("requests_total", "total number of chat completion requests")
				.namespace("larkrelay")
				.subsystem("enrichment"),
		)?;

		let enrichment_failures = IntCounter::with_opts(
			opts!("failures_total", "failed chat completion requests")
				.namespace("larkrelay")
				.subsystem("enrichment"),
		)?;

		let enrichment_duration = Histogram::with_opts(
			histogram_opts!(
				"request_duration_seconds",
				"duration of chat completion requests in seconds",
				exponential_buckets(0.05, 2., 12)?
			)
			.namespace("larkrelay")
			.subsystem("enrichment"),
		)?;

		registry.register(Box::new(received_notifications.clone()))?;
		registry.register(Box::new(cards_delivered.clone()))?;
		registry.register(Box::new(delivery_errors.clone()))?;
		registry.register(Box::new(enrichment_requests.clone()))?;
		registry.register(Box::new(enrichment_failures.clone()))?;
		registry.register(Box::new(enrichment_duration.clone()))?;

		Ok(Self {
			registry,
			received_notifications,
			cards_delivered,
			delivery_errors,
			enrichment_requests,
			enrichment_failures,
			enrichment_duration,
		})
	}

	pub fn record_notification(&self, mode: &str) {
		self.received_notifications.with_label_values(&[mode]).inc();
	}

	pub fn record_delivery(&self, status: reqwest::StatusCode) {
		self.cards_delivered.with_label_values(&[status.as_str()]).inc();
	}

	pub fn record_delivery_error(&self) {
		self.delivery_errors.inc();
	}

	/// counts the request and returns a timer observing its duration when dropped
	pub fn start_enrichment(&self) -> prometheus::HistogramTimer {
		self.enrichment_requests.inc();
		self.enrichment_duration.start_timer()
	}

	pub fn record_enrichment_failure(&self) {
		self.enrichment_failures.inc();
	}

	#[cfg(test)]
	pub fn delivered(&self, status: &str) -> u64 {
		self.cards_delivered.with_label_values(&[status]).get()
	}

	#[cfg(test)]
	pub fn enrichment_counts(&self) -> (u64, u64) {
		(self.enrichment_requests.get(), self.enrichment_failures.get())
	}
}
