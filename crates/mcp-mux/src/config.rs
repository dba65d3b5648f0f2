//! Config loader (spec §4.8): translates the external route/backend
//! configuration object into the in-memory routing table, compiling regex
//! tool selectors once at load time. Reloads replace the table pointer
//! atomically (`arc_swap`) so in-flight requests keep the snapshot they
//! captured at entry — no tearing, no locking on the read path.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::model::{Backend, Route, ToolSelector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToolSelector {
	#[serde(default)]
	pub include: Option<Vec<String>>,
	#[serde(default)]
	pub include_regex: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBackend {
	pub name: String,
	#[serde(default)]
	pub path: String,
	#[serde(default)]
	pub tool_selector: Option<RawToolSelector>,
}

#[derive(Debug, Deserialize)]
pub struct RawRoute {
	pub name: String,
	pub backends: Vec<RawBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
	pub routes: Vec<RawRoute>,
	pub backend_listener_addr: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("route {0:?} declares backend {1:?} more than once")]
	DuplicateBackend(String, String),
	#[error("backend name must not be empty (route {0:?})")]
	EmptyBackendName(String),
	#[error("invalid regex {1:?} for backend {0:?}: {2}")]
	InvalidRegex(String, String, regex::Error),
}

/// A fully-resolved, immutable routing table. Produced atomically: either
/// every route/backend/regex in a [`RawConfig`] is valid and a table is
/// built, or loading fails and the previous table (if any) is untouched.
#[derive(Debug)]
pub struct RoutingTable {
	pub backend_listener_addr: String,
	routes: HashMap<String, Arc<Route>>,
}

impl RoutingTable {
	pub fn route(&self, name: &str) -> Option<&Arc<Route>> {
		self.routes.get(name)
	}

	pub fn build(raw: RawConfig) -> Result<Self, ConfigError> {
		let mut routes = HashMap::new();
		for raw_route in raw.routes {
			let mut backends = IndexMap::new();
			for rb in raw_route.backends {
				if rb.name.is_empty() {
					return Err(ConfigError::EmptyBackendName(raw_route.name.clone()));
				}
				if backends.contains_key(&rb.name) {
					return Err(ConfigError::DuplicateBackend(
						raw_route.name.clone(),
						rb.name.clone(),
					));
				}
				let selector = match rb.tool_selector {
					None => ToolSelector::allow_all(),
					Some(raw_sel) => ToolSelector {
						include: raw_sel
							.include
							.map(|v| v.into_iter().collect()),
						include_regex: raw_sel
							.include_regex
							.map(|patterns| {
								patterns
									.into_iter()
									.map(|p| {
										Regex::new(&p).map_err(|e| {
											ConfigError::InvalidRegex(rb.name.clone(), p, e)
										})
									})
									.collect::<Result<Vec<_>, _>>()
							})
							.transpose()?,
					},
				};
				backends.insert(
					rb.name.clone(),
					Backend {
						name: rb.name,
						path: rb.path,
						selector,
					},
				);
			}
			routes.insert(
				raw_route.name.clone(),
				Arc::new(Route {
					name: raw_route.name,
					backends,
				}),
			);
		}
		Ok(RoutingTable {
			backend_listener_addr: raw.backend_listener_addr,
			routes,
		})
	}
}

/// Holds the current routing table behind an atomic pointer swap. Readers
/// call [`ConfigStore::snapshot`] once at request entry and use that `Arc`
/// for the rest of the request, so a concurrent [`ConfigStore::reload`]
/// never tears a single request's view of the world.
pub struct ConfigStore {
	table: ArcSwap<RoutingTable>,
}

impl ConfigStore {
	pub fn new(table: RoutingTable) -> Self {
		Self {
			table: ArcSwap::from_pointee(table),
		}
	}

	pub fn snapshot(&self) -> Arc<RoutingTable> {
		self.table.load_full()
	}

	pub fn reload(&self, raw: RawConfig) -> Result<(), ConfigError> {
		let table = RoutingTable::build(raw)?;
		self.table.store(Arc::new(table));
		Ok(())
	}
}

/// The single environment variable the proxy core recognizes (spec §6):
/// a human duration string, `"0"` disabling heartbeats entirely.
pub const HEARTBEAT_INTERVAL_ENV: &str = "MCP_PROXY_HEARTBEAT_INTERVAL";
pub const DEFAULT_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Parses simple human duration strings (`"60s"`, `"2m"`, `"0"`, `"500ms"`).
/// `"0"` (with no unit) means "disabled" and is returned as `Duration::ZERO`.
pub fn parse_duration(s: &str) -> Option<std::time::Duration> {
	let s = s.trim();
	if s == "0" {
		return Some(std::time::Duration::ZERO);
	}
	let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
	let (num, unit) = s.split_at(split_at);
	let value: f64 = num.parse().ok()?;
	let millis = match unit {
		"ms" => value,
		"s" => value * 1_000.0,
		"m" => value * 60_000.0,
		"h" => value * 3_600_000.0,
		_ => return None,
	};
	Some(std::time::Duration::from_millis(millis as u64))
}

pub fn heartbeat_interval_from_env() -> std::time::Duration {
	match std::env::var(HEARTBEAT_INTERVAL_ENV) {
		Ok(v) => parse_duration(&v).unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
		Err(_) => DEFAULT_HEARTBEAT_INTERVAL,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> RawConfig {
		RawConfig {
			backend_listener_addr: "127.0.0.1:9000".to_string(),
			routes: vec![RawRoute {
				name: "r".to_string(),
				backends: vec![
					RawBackend {
						name: "b1".to_string(),
						path: "/b1".to_string(),
						tool_selector: None,
					},
					RawBackend {
						name: "b2".to_string(),
						path: "/b2".to_string(),
						tool_selector: Some(RawToolSelector {
							include: Some(vec!["t1".to_string()]),
							include_regex: None,
						}),
					},
				],
			}],
		}
	}

	#[test]
	fn builds_routing_table() {
		let table = RoutingTable::build(sample()).unwrap();
		let route = table.route("r").unwrap();
		assert_eq!(route.backends.len(), 2);
		assert!(route.backend("b2").unwrap().selector.allows("t1"));
		assert!(!route.backend("b2").unwrap().selector.allows("t2"));
	}

	#[test]
	fn rejects_duplicate_backend_names() {
		let mut cfg = sample();
		cfg.routes[0].backends.push(RawBackend {
			name: "b1".to_string(),
			path: "/again".to_string(),
			tool_selector: None,
		});
		assert!(matches!(
			RoutingTable::build(cfg),
			Err(ConfigError::DuplicateBackend(_, _))
		));
	}

	#[test]
	fn bad_regex_fails_load_atomically() {
		let mut cfg = sample();
		cfg.routes[0].backends[0].tool_selector = Some(RawToolSelector {
			include: None,
			include_regex: Some(vec!["(".to_string()]),
		});
		assert!(matches!(
			RoutingTable::build(cfg),
			Err(ConfigError::InvalidRegex(_, _, _))
		));
	}

	#[test]
	fn reload_does_not_tear_in_flight_snapshot() {
		let store = ConfigStore::new(RoutingTable::build(sample()).unwrap());
		let snapshot = store.snapshot();
		assert!(snapshot.route("r").is_some());
		let mut replacement = sample();
		replacement.routes[0].name = "r2".to_string();
		store.reload(replacement).unwrap();
		// The snapshot taken before reload still sees the old table.
		assert!(snapshot.route("r").is_some());
		assert!(store.snapshot().route("r2").is_some());
	}

	#[test]
	fn duration_parsing() {
		assert_eq!(parse_duration("0"), Some(std::time::Duration::ZERO));
		assert_eq!(parse_duration("60s"), Some(std::time::Duration::from_secs(60)));
		assert_eq!(parse_duration("2m"), Some(std::time::Duration::from_secs(120)));
		assert_eq!(parse_duration("500ms"), Some(std::time::Duration::from_millis(500)));
		assert_eq!(parse_duration("bogus"), None);
	}
}
