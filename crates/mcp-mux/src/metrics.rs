//! Request and initialization metrics (spec §7). Registered once at
//! startup and shared behind an `Arc` by every request handler.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct MethodLabels {
	pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct MethodStatusLabels {
	pub method: String,
	pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CapabilityLabels {
	pub capability: String,
	pub side: String,
}

/// The four metrics named in spec §7, backed by `prometheus-client` the
/// way the teacher's core crate registers its own collectors.
pub struct Metrics {
	pub request_duration_seconds: Family<MethodLabels, Histogram>,
	pub method_count_total: Family<MethodStatusLabels, Counter>,
	pub initialization_duration_seconds: Histogram,
	pub capabilities_negotiated_total: Family<CapabilityLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let request_duration_seconds = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
			Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.001, 2.0, 16))
		});
		registry.register(
			"mcp_request_duration_seconds",
			"duration of a dispatched MCP request",
			request_duration_seconds.clone(),
		);

		let method_count_total = Family::<MethodStatusLabels, Counter>::default();
		registry.register(
			"mcp_method_count",
			"count of dispatched MCP requests by method and status",
			method_count_total.clone(),
		);

		let initialization_duration_seconds =
			Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.01, 2.0, 12));
		registry.register(
			"mcp_initialization_duration_seconds",
			"duration of a single backend's initialize call",
			initialization_duration_seconds.clone(),
		);

		let capabilities_negotiated_total = Family::<CapabilityLabels, Counter>::default();
		registry.register(
			"mcp_capabilities_negotiated",
			"count of capabilities negotiated during initialize, by side",
			capabilities_negotiated_total.clone(),
		);

		Self {
			request_duration_seconds,
			method_count_total,
			initialization_duration_seconds,
			capabilities_negotiated_total,
		}
	}

	pub fn record_request(&self, method: &str, status: &str, duration_secs: f64) {
		self
			.request_duration_seconds
			.get_or_create(&MethodLabels {
				method: method.to_string(),
			})
			.observe(duration_secs);
		self
			.method_count_total
			.get_or_create(&MethodStatusLabels {
				method: method.to_string(),
				status: status.to_string(),
			})
			.inc();
	}

	pub fn record_capability(&self, capability: &str, side: &str) {
		self
			.capabilities_negotiated_total
			.get_or_create(&CapabilityLabels {
				capability: capability.to_string(),
				side: side.to_string(),
			})
			.inc();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_request_and_capability_counters() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.record_request("tools/list", "ok", 0.01);
		metrics.record_capability("tools", "server");

		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
		assert!(buf.contains("mcp_method_count_total"));
		assert!(buf.contains("mcp_capabilities_negotiated_total"));
	}
}
