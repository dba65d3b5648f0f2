//! Method dispatcher (spec §4.6) and session lifecycle (spec §4.4 Create /
//! Close). This is the heart of the proxy: every downstream JSON-RPC
//! message passes through [`Dispatcher::initialize`] or
//! [`Dispatcher::dispatch`].

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::config::RoutingTable;
use crate::error::ProxyError;
use crate::jsonrpc::{Id, JsonRpcError, Message};
use crate::metrics::Metrics;
use crate::model::{Backend, Route};
use crate::names::{self, TokenValue};
use crate::session::{BackendSession, CompositeSession};
use crate::sse::SseEvent;
use crate::upstream::{Destination, RequestMeta, UpstreamClient, UpstreamResponse};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

const CLIENT_CAPABILITIES: &[&str] = &["roots", "sampling", "elicitation"];
const SERVER_CAPABILITIES: &[&str] = &["tools", "resources", "prompts", "logging"];

/// What a dispatched request produces on the wire (spec §4.6, §4.9).
#[derive(Debug)]
pub enum DispatchOutcome {
	/// `202 Accepted`, no body: ignore-and-accept handlers and forwarded
	/// notifications/responses.
	Accepted,
	/// A single JSON-RPC message, sent back as `application/json`.
	Json(Value),
	/// One or more events, sent back as `text/event-stream` (the
	/// broadcast-and-aggregate result, or a forwarded upstream SSE body).
	Sse(Vec<SseEvent>),
}

pub struct Dispatcher {
	pub upstream: UpstreamClient,
	pub metrics: Metrics,
}

impl Dispatcher {
	pub fn new(upstream: UpstreamClient, metrics: Metrics) -> Self {
		Self { upstream, metrics }
	}

	fn destination(table: &RoutingTable, backend: &Backend) -> Destination {
		Destination {
			listener_addr: table.backend_listener_addr.clone(),
			path: backend.path.clone(),
		}
	}

	/// Create (spec §4.4): fan `initialize` out to every backend in the
	/// route, keep the ones that succeed, follow each with
	/// `notifications/initialized`, and combine into a composite session.
	/// Fails only if *no* backend could be initialized.
	pub async fn initialize(
		&self,
		table: &RoutingTable,
		route_name: &str,
		subject: &str,
		request_id: &Id,
		init_params: &Value,
	) -> Result<(CompositeSession, Value), ProxyError> {
		let route = table
			.route(route_name)
			.ok_or_else(|| ProxyError::Authorization("route", route_name.to_string()))?;

		let init_message = Message::Request {
			id: request_id.clone(),
			method: "initialize".to_string(),
			params: init_params.clone(),
		};

		let results = futures::future::join_all(route.backends.values().map(|backend| {
			let dest = Self::destination(table, backend);
			let route_name = route_name.to_string();
			let backend_name = backend.name.clone();
			let init_message = init_message.clone();
			async move {
				let started = std::time::Instant::now();
				let outcome = tokio::time::timeout(
					INITIALIZE_TIMEOUT,
					self.upstream.send(
						&dest,
						&route_name,
						&backend_name,
						None,
						None,
						&RequestMeta {
							method: Some("initialize".to_string()),
							request_id: Some(request_id.to_string()),
						},
						&init_message,
					),
				)
				.await;
				let elapsed = started.elapsed().as_secs_f64();
				(backend_name, dest, outcome, elapsed)
			}
		}))
		.await;

		let mut backends = HashMap::new();
		let mut bodies = Vec::new();
		for (backend_name, dest, outcome, elapsed) in results {
			self.metrics.initialization_duration_seconds.observe(elapsed);
			let (response, header_session_id) = match outcome {
				Ok(Ok(UpstreamResponse::Json(message, session_id))) => (message, session_id),
				Ok(Ok(UpstreamResponse::Events(mut events, session_id))) => {
					match events.pop().and_then(|e| e.messages.into_iter().next()) {
						Some(m) => (m, session_id),
						None => {
							tracing::warn!(%backend_name, "initialize stream carried no messages; dropping backend");
							continue;
						},
					}
				},
				Ok(Ok(UpstreamResponse::Accepted)) => {
					tracing::warn!(%backend_name, "initialize returned 202 with no body; dropping backend");
					continue;
				},
				Ok(Err(e)) => {
					tracing::warn!(%backend_name, error = %e, "backend failed to initialize; dropping");
					continue;
				},
				Err(_elapsed) => {
					tracing::warn!(%backend_name, "backend initialize timed out; dropping");
					continue;
				},
			};

			let result = match &response {
				Message::Response { result, .. } => Some(result.clone()),
				Message::Error { error, .. } => {
					tracing::warn!(%backend_name, %error.message, "backend rejected initialize; dropping");
					continue;
				},
				_ => continue,
			};
			let session_id = header_session_id.unwrap_or_default();

			let ack = Message::Notification {
				method: "notifications/initialized".to_string(),
				params: Value::Object(Default::default()),
			};
			let _ = self
				.upstream
				.send(
					&dest,
					route_name,
					&backend_name,
					Some(&session_id),
					None,
					&RequestMeta::default(),
					&ack,
				)
				.await;

			if let Some(result) = &result {
				record_capabilities(&self.metrics, result);
			}

			backends.insert(
				backend_name,
				BackendSession {
					session_id,
					last_event_id: String::new(),
				},
			);
			if let Some(result) = result {
				bodies.push(result);
			}
		}

		if backends.is_empty() {
			return Err(ProxyError::InitializationFailed);
		}

		let session = CompositeSession {
			route: route_name.to_string(),
			subject: subject.to_string(),
			backends,
		};

		let body = bodies.into_iter().next().unwrap_or(Value::Null);
		let response = Message::Response {
			id: request_id.clone(),
			result: body,
		}
		.to_value();

		Ok((session, response))
	}

	/// Close (spec §4.4): best-effort per-backend teardown.
	pub async fn close(&self, table: &RoutingTable, route: &str, session: &CompositeSession) {
		let Some(route_def) = table.route(route) else {
			return;
		};
		for (backend_name, backend_session) in &session.backends {
			if backend_session.session_id.is_empty() {
				continue;
			}
			let Some(backend) = route_def.backend(backend_name) else {
				continue;
			};
			let dest = Self::destination(table, backend);
			if let Err(e) = self
				.upstream
				.close_session(&dest, route, backend_name, &backend_session.session_id)
				.await
			{
				tracing::warn!(%backend_name, error = %e, "backend session tear-down failed");
			}
		}
	}

	/// Dispatch (spec §4.6) for a session already validated against `route`.
	pub async fn dispatch(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		message: Message,
	) -> Result<DispatchOutcome, ProxyError> {
		match message {
			Message::Request { id, method, params } => {
				self.dispatch_request(table, route, session, id, method, params).await
			},
			Message::Notification { method, params } => {
				self.dispatch_notification(table, route, session, method, params).await
			},
			Message::Response { id, result } => {
				self
					.forward_client_reply(table, route, session, id, Ok(result))
					.await
			},
			Message::Error { id, error } => {
				self
					.forward_client_reply(table, route, session, id, Err(error))
					.await
			},
		}
	}

	async fn dispatch_request(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		id: Id,
		method: String,
		params: Value,
	) -> Result<DispatchOutcome, ProxyError> {
		match method.as_str() {
			"ping" => Ok(DispatchOutcome::Json(
				Message::Response {
					id,
					result: Value::Object(Default::default()),
				}
				.to_value(),
			)),
			"tools/list" => self.aggregate_list(table, route, session, id, "tools", "name").await,
			"prompts/list" => self.aggregate_list(table, route, session, id, "prompts", "name").await,
			"resources/list" => self.aggregate_list(table, route, session, id, "resources", "uri").await,
			"resources/templates/list" => {
				self
					.aggregate_list(table, route, session, id, "resourceTemplates", "uri")
					.await
			},
			"tools/call" => {
				self
					.single_backend_by_field(table, route, session, id, method, params, "name", true)
					.await
			},
			"prompts/get" => {
				self
					.single_backend_by_field(table, route, session, id, method, params, "name", false)
					.await
			},
			"resources/read" | "resources/subscribe" | "resources/unsubscribe" => {
				self
					.single_backend_by_field(table, route, session, id, method, params, "uri", false)
					.await
			},
			"completion/complete" => self.dispatch_completion(table, route, session, id, method, params).await,
			"logging/setLevel" => self.broadcast_request(table, route, session, id, method, params).await,
			other => Err(ProxyError::UnsupportedMethod(other.to_string())),
		}
	}

	async fn dispatch_notification(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		method: String,
		params: Value,
	) -> Result<DispatchOutcome, ProxyError> {
		match method.as_str() {
			"notifications/initialized" | "notifications/cancelled" => Ok(DispatchOutcome::Accepted),
			"notifications/progress" => {
				let token = params
					.get("_meta")
					.and_then(|m| m.get("progressToken"))
					.and_then(Value::as_str)
					.ok_or_else(|| ProxyError::MalformedRpc("missing _meta.progressToken".to_string()))?
					.to_string();
				let (original, backend_name) = names::decode_tagged(&token)?;
				let backend_session = session
					.backends
					.get(backend_name)
					.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;
				let backend = route
					.backend(backend_name)
					.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;
				let mut restored_params = params;
				set_meta_progress_token_value(&mut restored_params, token_value_to_json(&original));
				let notification = Message::Notification {
					method,
					params: restored_params,
				};
				let dest = Self::destination(table, backend);
				self
					.upstream
					.send(
						&dest,
						&session.route,
						backend_name,
						Some(&backend_session.session_id),
						None,
						&RequestMeta::default(),
						&notification,
					)
					.await?;
				Ok(DispatchOutcome::Accepted)
			},
			"notifications/roots/list_changed" => {
				for (backend_name, backend_session) in &session.backends {
					let Some(backend) = route.backend(backend_name) else {
						continue;
					};
					let dest = Self::destination(table, backend);
					let notification = Message::Notification {
						method: method.clone(),
						params: params.clone(),
					};
					let _ = self
						.upstream
						.send(
							&dest,
							&session.route,
							backend_name,
							Some(&backend_session.session_id),
							None,
							&RequestMeta::default(),
							&notification,
						)
						.await;
				}
				Ok(DispatchOutcome::Accepted)
			},
			other => Err(ProxyError::UnsupportedMethod(other.to_string())),
		}
	}

	/// Forwards a client-originated response/error to the backend encoded
	/// in its tagged id (spec §4.6.1).
	async fn forward_client_reply(
		&self,
		table: &RoutingTable,
		_route: &Route,
		session: &CompositeSession,
		id: Id,
		outcome: Result<Value, JsonRpcError>,
	) -> Result<DispatchOutcome, ProxyError> {
		let id_str = id.to_string();
		let (original, backend_name) = names::decode_tagged(&id_str)?;
		let backend_session = session
			.backends
			.get(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;
		let route_def = table
			.route(&session.route)
			.ok_or_else(|| ProxyError::Authorization("route", session.route.clone()))?;
		let backend = route_def
			.backend(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;

		let restored_id = match original {
			TokenValue::Str(s) => Id::Str(s),
			TokenValue::Int(i) => Id::Int(i),
			TokenValue::Float(f) => Id::Str(format!("{f}")),
		};
		let message = match outcome {
			Ok(result) => Message::Response { id: restored_id, result },
			Err(error) => Message::Error { id: restored_id, error },
		};
		let dest = Self::destination(table, backend);
		self
			.upstream
			.send(
				&dest,
				&session.route,
				backend_name,
				Some(&backend_session.session_id),
				None,
				&RequestMeta::default(),
				&message,
			)
			.await?;
		Ok(DispatchOutcome::Accepted)
	}

	async fn aggregate_list(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		id: Id,
		list_field: &str,
		name_field: &str,
	) -> Result<DispatchOutcome, ProxyError> {
		let method = match list_field {
			"tools" => "tools/list",
			"prompts" => "prompts/list",
			"resources" => "resources/list",
			_ => "resources/templates/list",
		};

		let calls = session.backends.iter().filter_map(|(backend_name, backend_session)| {
			let backend = route.backend(backend_name)?;
			Some((backend_name.clone(), backend.clone(), backend_session.clone()))
		});

		let request_id_str = id.to_string();
		let results = futures::future::join_all(calls.map(|(backend_name, backend, backend_session)| {
			let dest = Self::destination(table, &backend);
			let route_name = session.route.clone();
			let request_id_str = request_id_str.clone();
			let message = Message::Request {
				id: id.clone(),
				method: method.to_string(),
				params: Value::Object(Default::default()),
			};
			async move {
				let resp = self
					.upstream
					.send(
						&dest,
						&route_name,
						&backend_name,
						Some(&backend_session.session_id),
						None,
						&RequestMeta {
							method: Some(method.to_string()),
							request_id: Some(request_id_str),
						},
						&message,
					)
					.await;
				(backend_name, backend, resp)
			}
		}))
		.await;

		let mut merged = Vec::new();
		for (backend_name, backend, resp) in results {
			let items = match resp {
				Ok(UpstreamResponse::Json(Message::Response { result, .. }, _)) => result
					.get(list_field)
					.and_then(Value::as_array)
					.cloned()
					.unwrap_or_default(),
				Ok(UpstreamResponse::Json(Message::Error { error, .. }, _)) => {
					tracing::debug!(%backend_name, %error.message, "backend failed list request; skipping");
					continue;
				},
				Ok(_) => continue,
				Err(e) => {
					tracing::debug!(%backend_name, error = %e, "backend failed list request; skipping");
					continue;
				},
			};
			for mut item in items {
				let Some(name) = item.get(name_field).and_then(Value::as_str) else {
					continue;
				};
				if list_field == "tools" && !backend.selector.allows(name) {
					continue;
				}
				let prefixed = names::join(&backend_name, name);
				if let Some(obj) = item.as_object_mut() {
					obj.insert(name_field.to_string(), Value::String(prefixed));
				}
				merged.push(item);
			}
		}

		let result = serde_json::json!({ list_field: merged });
		Ok(DispatchOutcome::Json(Message::Response { id, result }.to_value()))
	}

	#[allow(clippy::too_many_arguments)]
	async fn single_backend_by_field(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		id: Id,
		method: String,
		mut params: Value,
		field: &str,
		enforce_selector: bool,
	) -> Result<DispatchOutcome, ProxyError> {
		let prefixed = params
			.get(field)
			.and_then(Value::as_str)
			.ok_or_else(|| ProxyError::MalformedRpc(format!("missing params.{field}")))?
			.to_string();
		let (backend_name, local_name) = names::split(&prefixed)?;
		let backend = route
			.backend(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;
		if enforce_selector && !backend.selector.allows(local_name) {
			return Err(ProxyError::Authorization("tool", local_name.to_string()));
		}
		let backend_session = session
			.backends
			.get(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;

		if let Some(obj) = params.as_object_mut() {
			obj.insert(field.to_string(), Value::String(local_name.to_string()));
		}

		self
			.forward_single(table, session, backend_name, backend, backend_session, id, method, params)
			.await
	}

	async fn dispatch_completion(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		id: Id,
		method: String,
		mut params: Value,
	) -> Result<DispatchOutcome, ProxyError> {
		let (field, prefixed) = {
			let ref_value = params
				.get("ref")
				.ok_or_else(|| ProxyError::MalformedRpc("missing params.ref".to_string()))?;
			if let Some(name) = ref_value.get("name").and_then(Value::as_str) {
				("name", name.to_string())
			} else if let Some(uri) = ref_value.get("uri").and_then(Value::as_str) {
				("uri", uri.to_string())
			} else {
				return Err(ProxyError::MalformedRpc("completion ref has neither name nor uri".to_string()));
			}
		};
		let (backend_name, local_name) = names::split(&prefixed)?;
		let backend = route
			.backend(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;
		let backend_session = session
			.backends
			.get(backend_name)
			.ok_or_else(|| ProxyError::Authorization("backend", backend_name.to_string()))?;

		if let Some(obj) = params.get_mut("ref").and_then(Value::as_object_mut) {
			obj.insert(field.to_string(), Value::String(local_name.to_string()));
		}

		self
			.forward_single(table, session, backend_name, backend, backend_session, id, method, params)
			.await
	}

	#[allow(clippy::too_many_arguments)]
	async fn forward_single(
		&self,
		table: &RoutingTable,
		session: &CompositeSession,
		backend_name: &str,
		backend: &Backend,
		backend_session: &BackendSession,
		id: Id,
		method: String,
		params: Value,
	) -> Result<DispatchOutcome, ProxyError> {
		let dest = Self::destination(table, backend);
		let message = Message::Request {
			id: id.clone(),
			method: method.clone(),
			params,
		};
		let resp = self
			.upstream
			.send(
				&dest,
				&session.route,
				backend_name,
				Some(&backend_session.session_id),
				None,
				&RequestMeta {
					method: Some(method),
					request_id: Some(id.to_string()),
				},
				&message,
			)
			.await?;
		match resp {
			UpstreamResponse::Json(mut message, _) => {
				rewrite_outbound(&mut message, backend_name);
				Ok(DispatchOutcome::Json(message.to_value()))
			},
			UpstreamResponse::Events(mut events, _) => {
				for event in &mut events {
					for message in &mut event.messages {
						rewrite_outbound(message, backend_name);
					}
				}
				Ok(DispatchOutcome::Sse(events))
			},
			UpstreamResponse::Accepted => Ok(DispatchOutcome::Accepted),
		}
	}

	async fn broadcast_request(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		id: Id,
		method: String,
		params: Value,
	) -> Result<DispatchOutcome, ProxyError> {
		let calls = session.backends.iter().filter_map(|(backend_name, backend_session)| {
			let backend = route.backend(backend_name)?;
			Some((backend_name.clone(), backend.clone(), backend_session.clone()))
		});
		futures::future::join_all(calls.map(|(backend_name, backend, backend_session)| {
			let dest = Self::destination(table, &backend);
			let route_name = session.route.clone();
			let method = method.clone();
			let params = params.clone();
			let id = id.clone();
			async move {
				let message = Message::Request {
					id: id.clone(),
					method: method.clone(),
					params,
				};
				let result = self
					.upstream
					.send(
						&dest,
						&route_name,
						&backend_name,
						Some(&backend_session.session_id),
						None,
						&RequestMeta {
							method: Some(method),
							request_id: Some(id.to_string()),
						},
						&message,
					)
					.await;
				if let Err(e) = result {
					tracing::debug!(%backend_name, error = %e, "broadcast request failed; continuing");
				}
			}
		}))
		.await;
		Ok(DispatchOutcome::Json(
			Message::Response {
				id,
				result: Value::Object(Default::default()),
			}
			.to_value(),
		))
	}
}

/// Applies the §4.6.1 server→client inversion rewrite: only `Request`
/// messages are touched; notifications and responses pass through.
pub(crate) fn rewrite_outbound(message: &mut Message, backend: &str) {
	let Message::Request { id, params, .. } = message else {
		return;
	};
	let token = match id {
		Id::Str(s) => TokenValue::Str(s.clone()),
		Id::Int(i) => TokenValue::Int(*i),
	};
	*id = Id::Str(names::encode_tagged(&token, backend));
	if let Some(progress_token) = params
		.get("_meta")
		.and_then(|m| m.get("progressToken"))
		.and_then(Value::as_str)
		.map(|s| s.to_string())
	{
		let tagged = names::encode_tagged(&TokenValue::Str(progress_token), backend);
		set_progress_token(params, &tagged);
	}
}

fn set_progress_token(params: &mut Value, token: &str) {
	set_meta_progress_token_value(params, Value::String(token.to_string()));
}

fn set_meta_progress_token_value(params: &mut Value, token: Value) {
	if let Some(meta) = params.get_mut("_meta").and_then(Value::as_object_mut) {
		meta.insert("progressToken".to_string(), token);
	}
}

fn token_value_to_json(v: &TokenValue) -> Value {
	match v {
		TokenValue::Str(s) => Value::String(s.clone()),
		TokenValue::Int(i) => Value::Number((*i).into()),
		TokenValue::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
	}
}

fn record_capabilities(metrics: &Metrics, init_result: &Value) {
	if let Some(caps) = init_result.get("capabilities").and_then(Value::as_object) {
		for cap in SERVER_CAPABILITIES {
			if caps.contains_key(*cap) {
				metrics.record_capability(cap, "server");
			}
		}
	}
}

pub fn record_client_capabilities(metrics: &Metrics, init_params: &Value) {
	if let Some(caps) = init_params.get("capabilities").and_then(Value::as_object) {
		for cap in CLIENT_CAPABILITIES {
			if caps.contains_key(*cap) {
				metrics.record_capability(cap, "client");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{RawBackend, RawConfig, RawRoute, RoutingTable};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn two_backend_table() -> (MockServer, RoutingTable) {
		let server = MockServer::start().await;
		let table = RoutingTable::build(RawConfig {
			backend_listener_addr: server.address().to_string(),
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
						tool_selector: None,
					},
				],
			}],
		})
		.unwrap();
		(server, table)
	}

	#[tokio::test]
	async fn scenario_1_initialize_two_backends() {
		let (server, table) = two_backend_table().await;
		Mock::given(method("POST"))
			.and(path("/b1"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.insert_header("mcp-session-id", "s1")
					.set_body_json(serde_json::json!({"jsonrpc":"2.0","id":"i-1","result":{"capabilities":{}}})),
			)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/b2"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.insert_header("mcp-session-id", "s2")
					.set_body_json(serde_json::json!({"jsonrpc":"2.0","id":"i-1","result":{"capabilities":{}}})),
			)
			.mount(&server)
			.await;

		let dispatcher = Dispatcher::new(UpstreamClient::new(), Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let (session, _body) = dispatcher
			.initialize(&table, "r", "", &Id::Str("i-1".to_string()), &serde_json::json!({}))
			.await
			.unwrap();
		assert_eq!(session.backends.len(), 2);
		assert_eq!(session.backends.get("b1").unwrap().session_id, "s1");
		assert_eq!(session.backends.get("b2").unwrap().session_id, "s2");
	}

	#[tokio::test]
	async fn scenario_2_tool_list_aggregation_with_selector() {
		let server = MockServer::start().await;
		let mut table = RoutingTable::build(RawConfig {
			backend_listener_addr: server.address().to_string(),
			routes: vec![RawRoute {
				name: "r".to_string(),
				backends: vec![
					RawBackend {
						name: "b1".to_string(),
						path: "/b1".to_string(),
						tool_selector: Some(crate::config::RawToolSelector {
							include: Some(vec!["t1".to_string()]),
							include_regex: None,
						}),
					},
					RawBackend {
						name: "b2".to_string(),
						path: "/b2".to_string(),
						tool_selector: None,
					},
				],
			}],
		})
		.unwrap();
		// silence unused mut warning if config ever needs reload in this test
		let _ = &mut table;

		Mock::given(method("POST"))
			.and(path("/b1"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.set_body_json(serde_json::json!({"jsonrpc":"2.0","id":"i-2","result":{"tools":[{"name":"t1"},{"name":"t2"}]}})),
			)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/b2"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.set_body_json(serde_json::json!({"jsonrpc":"2.0","id":"i-2","result":{"tools":[{"name":"t3"}]}})),
			)
			.mount(&server)
			.await;

		let mut backends = HashMap::new();
		backends.insert("b1".to_string(), BackendSession { session_id: "s1".to_string(), last_event_id: String::new() });
		backends.insert("b2".to_string(), BackendSession { session_id: "s2".to_string(), last_event_id: String::new() });
		let session = CompositeSession { route: "r".to_string(), subject: String::new(), backends };

		let dispatcher = Dispatcher::new(UpstreamClient::new(), Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let route = table.route("r").unwrap().clone();
		let outcome = dispatcher
			.dispatch(
				&table,
				&route,
				&session,
				Message::Request { id: Id::Str("i-2".to_string()), method: "tools/list".to_string(), params: Value::Null },
			)
			.await
			.unwrap();
		let DispatchOutcome::Json(body) = outcome else { panic!("expected json") };
		let tools = body["result"]["tools"].as_array().unwrap();
		let mut names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
		names.sort_unstable();
		assert_eq!(names, vec!["b1__t1", "b2__t3"]);
	}

	#[tokio::test]
	async fn scenario_3_tool_call_routing() {
		let (server, table) = two_backend_table().await;
		Mock::given(method("POST"))
			.and(path("/b2"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.set_body_json(serde_json::json!({"jsonrpc":"2.0","id":"i-3","result":{"ok":true}})),
			)
			.mount(&server)
			.await;

		let mut backends = HashMap::new();
		backends.insert("b1".to_string(), BackendSession { session_id: "s1".to_string(), last_event_id: String::new() });
		backends.insert("b2".to_string(), BackendSession { session_id: "s2".to_string(), last_event_id: String::new() });
		let session = CompositeSession { route: "r".to_string(), subject: String::new(), backends };

		let dispatcher = Dispatcher::new(UpstreamClient::new(), Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let route = table.route("r").unwrap().clone();
		let outcome = dispatcher
			.dispatch(
				&table,
				&route,
				&session,
				Message::Request {
					id: Id::Str("i-3".to_string()),
					method: "tools/call".to_string(),
					params: serde_json::json!({"name":"b2__t3"}),
				},
			)
			.await
			.unwrap();
		assert!(matches!(outcome, DispatchOutcome::Json(_)));
	}

	#[tokio::test]
	async fn scenario_4_server_to_client_request_id_rewrite() {
		let (server, table) = two_backend_table().await;
		Mock::given(method("POST"))
			.and(path("/b1"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "application/json")
					.set_body_json(serde_json::json!({
						"jsonrpc":"2.0","id":1,"method":"roots/list","params":{"_meta":{"progressToken":"pt"}}
					})),
			)
			.mount(&server)
			.await;

		let mut backends = HashMap::new();
		backends.insert("b1".to_string(), BackendSession { session_id: "s1".to_string(), last_event_id: String::new() });
		let session = CompositeSession { route: "r".to_string(), subject: String::new(), backends };

		let dispatcher = Dispatcher::new(UpstreamClient::new(), Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let route = table.route("r").unwrap().clone();
		let outcome = dispatcher
			.dispatch(
				&table,
				&route,
				&session,
				Message::Request {
					id: Id::Str("i-4".to_string()),
					method: "tools/call".to_string(),
					params: serde_json::json!({"name":"b1__t1"}),
				},
			)
			.await
			.unwrap();
		let DispatchOutcome::Json(body) = outcome else { panic!("expected json") };
		assert_eq!(body["id"].as_str().unwrap(), "1__i__b1");
		assert_eq!(body["params"]["_meta"]["progressToken"].as_str().unwrap(), "cHQ=__s__b1");

		// Client replies; the dispatcher must restore the original id and
		// route the response back to b1.
		Mock::given(method("POST"))
			.and(path("/b1"))
			.respond_with(ResponseTemplate::new(202))
			.mount(&server)
			.await;
		let reply_outcome = dispatcher
			.dispatch(
				&table,
				&route,
				&session,
				Message::Response {
					id: Id::Str("1__i__b1".to_string()),
					result: serde_json::json!({"roots": []}),
				},
			)
			.await
			.unwrap();
		assert!(matches!(reply_outcome, DispatchOutcome::Accepted));
	}
}
