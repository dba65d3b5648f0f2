//! Data model (spec §3): backends, routes, and tool selectors.

use std::collections::HashSet;

use indexmap::IndexMap;
use regex::Regex;

/// Either an allow-list of exact tool names, a list of regexes, or both. An
/// unset selector (`None`/`None`) admits everything; the include list and
/// regex list are a union, never an intersection.
#[derive(Clone, Debug, Default)]
pub struct ToolSelector {
	pub include: Option<HashSet<String>>,
	pub include_regex: Option<Vec<Regex>>,
}

impl ToolSelector {
	pub fn allow_all() -> Self {
		Self::default()
	}

	pub fn allows(&self, name: &str) -> bool {
		if self.include.is_none() && self.include_regex.is_none() {
			return true;
		}
		let by_name = self.include.as_ref().is_some_and(|s| s.contains(name));
		let by_regex = self
			.include_regex
			.as_ref()
			.is_some_and(|rs| rs.iter().any(|r| r.is_match(name)));
		by_name || by_regex
	}
}

/// One upstream MCP server addressable by a logical name and a path on the
/// shared backend listener.
#[derive(Clone, Debug)]
pub struct Backend {
	pub name: String,
	pub path: String,
	pub selector: ToolSelector,
}

/// A named set of backends — the unit of fan-out for one downstream request.
#[derive(Clone, Debug)]
pub struct Route {
	pub name: String,
	/// Preserves configuration order; iteration order is otherwise
	/// insignificant (spec §3: "backend order insignificant up to parse").
	pub backends: IndexMap<String, Backend>,
}

impl Route {
	pub fn backend(&self, name: &str) -> Option<&Backend> {
		self.backends.get(name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn selector(include: Option<&[&str]>, regex: Option<&[&str]>) -> ToolSelector {
		ToolSelector {
			include: include.map(|s| s.iter().map(|s| s.to_string()).collect()),
			include_regex: regex.map(|rs| rs.iter().map(|r| Regex::new(r).unwrap()).collect()),
		}
	}

	#[test]
	fn empty_selector_allows_everything() {
		let s = ToolSelector::allow_all();
		assert!(s.allows("anything"));
	}

	#[test]
	fn include_only_is_exact() {
		let s = selector(Some(&["a", "b"]), None);
		assert!(s.allows("a"));
		assert!(!s.allows("c"));
	}

	#[test]
	fn regex_only_matches_pattern() {
		let s = selector(None, Some(&["^get_.*$"]));
		assert!(s.allows("get_weather"));
		assert!(!s.allows("set_weather"));
	}

	#[test]
	fn both_are_a_union() {
		let s = selector(Some(&["exact"]), Some(&["^get_.*$"]));
		assert!(s.allows("exact"));
		assert!(s.allows("get_x"));
		assert!(!s.allows("other"));
	}
}
