//! Composite session registry (spec §4.4). A composite session is never
//! stored anywhere: it is fully reconstructed from the encrypted client
//! identifier on every request, and destroyed simply by the client
//! forgetting the id (or the proxy no longer being able to decrypt it).

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::RoutingTable;
use crate::crypto::{CryptoError, SessionCrypto};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
	#[error("composite session id must have exactly two '@' separators")]
	MalformedId,
	#[error("backend name must not be empty")]
	EmptyBackendName,
	#[error("backend entry must be formatted as name:value")]
	MalformedBackendEntry,
	#[error("invalid base64 in session id")]
	InvalidBase64,
	#[error("route {0:?} not found")]
	UnknownRoute(String),
	#[error("backend {0:?} is not part of route {1:?}")]
	UnknownBackend(String, String),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
}

/// One backend's piece of a composite session: its own opaque wire session
/// id (empty for stateless backends) and the last SSE event id the client
/// has acknowledged from it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendSession {
	pub session_id: String,
	pub last_event_id: String,
}

/// The proxy's view of an MCP client's session: a route, an optional
/// authenticated subject, and one [`BackendSession`] per backend that
/// responded successfully to `initialize`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositeSession {
	pub route: String,
	pub subject: String,
	pub backends: HashMap<String, BackendSession>,
}

fn encode_entries<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> Result<String, SessionError> {
	let mut parts = Vec::new();
	for (name, value) in entries {
		if name.is_empty() {
			return Err(SessionError::EmptyBackendName);
		}
		parts.push(format!("{name}:{}", STANDARD.encode(value.as_bytes())));
	}
	Ok(parts.join(","))
}

fn decode_entries(s: &str) -> Result<Vec<(String, String)>, SessionError> {
	if s.is_empty() {
		return Ok(Vec::new());
	}
	s.split(',')
		.map(|entry| {
			let (name, value) = entry
				.split_once(':')
				.ok_or(SessionError::MalformedBackendEntry)?;
			if name.is_empty() {
				return Err(SessionError::EmptyBackendName);
			}
			let decoded = STANDARD
				.decode(value)
				.map_err(|_| SessionError::InvalidBase64)?;
			let decoded = String::from_utf8(decoded).map_err(|_| SessionError::InvalidBase64)?;
			Ok((name.to_string(), decoded))
		})
		.collect()
}

impl CompositeSession {
	/// Builds the plaintext wire form `<route>@<subject>@<backend>:<b64>,...`
	/// (spec §3). Backend iteration order does not matter; parsing is
	/// order-insensitive.
	pub fn build(&self) -> Result<String, SessionError> {
		let entries = encode_entries(
			self
				.backends
				.iter()
				.map(|(name, b)| (name.as_str(), b.session_id.as_str())),
		)?;
		Ok(format!("{}@{}@{}", self.route, self.subject, entries))
	}

	/// Parses the plaintext wire form, validating every referenced backend
	/// against `table` (spec §4.4: "look up each referenced backend in the
	/// current configuration, rejecting unknown backends").
	pub fn parse(plaintext: &str, table: &RoutingTable) -> Result<Self, SessionError> {
		let mut parts = plaintext.splitn(3, '@');
		let route = parts.next().ok_or(SessionError::MalformedId)?;
		let subject = parts.next().ok_or(SessionError::MalformedId)?;
		let rest = parts.next().ok_or(SessionError::MalformedId)?;

		let route_def = table
			.route(route)
			.ok_or_else(|| SessionError::UnknownRoute(route.to_string()))?;

		let mut backends = HashMap::new();
		for (name, session_id) in decode_entries(rest)? {
			if route_def.backend(&name).is_none() {
				return Err(SessionError::UnknownBackend(name, route.to_string()));
			}
			backends.insert(
				name,
				BackendSession {
					session_id,
					last_event_id: String::new(),
				},
			);
		}

		Ok(CompositeSession {
			route: route.to_string(),
			subject: subject.to_string(),
			backends,
		})
	}

	/// Encrypts [`Self::build`]'s output for the wire.
	pub fn encrypt(&self, crypto: &SessionCrypto) -> Result<String, SessionError> {
		Ok(crypto.encrypt(&self.build()?)?)
	}

	/// Decrypts and parses a client-supplied `mcp-session-id` header value.
	pub fn decrypt_and_parse(
		encrypted: &str,
		crypto: &SessionCrypto,
		table: &RoutingTable,
	) -> Result<Self, SessionError> {
		let plaintext = crypto.decrypt(encrypted)?;
		Self::parse(&plaintext, table)
	}
}

/// The combined `Last-Event-Id`, keyed by backend (spec §3 "Event
/// identifier"). Carries no route/subject prefix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeEventId {
	pub backends: HashMap<String, String>,
}

impl CompositeEventId {
	pub fn build(&self) -> Result<String, SessionError> {
		encode_entries(self.backends.iter().map(|(k, v)| (k.as_str(), v.as_str())))
	}

	pub fn parse(plaintext: &str) -> Result<Self, SessionError> {
		Ok(CompositeEventId {
			backends: decode_entries(plaintext)?.into_iter().collect(),
		})
	}

	pub fn encrypt(&self, crypto: &SessionCrypto) -> Result<String, SessionError> {
		Ok(crypto.encrypt(&self.build()?)?)
	}

	pub fn decrypt_and_parse(encrypted: &str, crypto: &SessionCrypto) -> Result<Self, SessionError> {
		let plaintext = crypto.decrypt(encrypted)?;
		Self::parse(&plaintext)
	}
}
