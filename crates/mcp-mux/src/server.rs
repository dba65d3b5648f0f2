//! Request entry point (spec §4.9): one handler mounted at `/`, path-agnostic
//! (the routing decision was already made upstream and carried in the
//! `x-ai-eg-mcp-route` header). Dispatches by HTTP method to the dispatcher
//! (§4.6), the notification streamer (§4.7), or session tear-down (§4.4).

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response, Sse};
use axum::response::sse::Event;
use axum::routing::any;
use futures_util::stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::{self, ConfigStore};
use crate::crypto::SessionCrypto;
use crate::dispatch::{self, DispatchOutcome, Dispatcher};
use crate::error::ProxyError;
use crate::jsonrpc::{Id, Message};
use crate::session::{CompositeEventId, CompositeSession};
use crate::sse::SseEvent;
use crate::stream::NotificationStreamer;

const HEADER_SESSION_ID: &str = "mcp-session-id";
const HEADER_ROUTE: &str = "x-ai-eg-mcp-route";
const HEADER_LAST_EVENT_ID: &str = "last-event-id";

pub struct AppState {
	pub config: ConfigStore,
	pub crypto: Arc<SessionCrypto>,
	pub dispatcher: Dispatcher,
	pub streamer: NotificationStreamer,
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.fallback(any(handle))
		.with_state(state)
		.layer(TraceLayer::new_for_http())
}

async fn handle(State(state): State<Arc<AppState>>, method: Method, headers: HeaderMap, body: Bytes) -> Response {
	let result = match method {
		Method::POST => handle_post(&state, &headers, &body).await,
		Method::GET => handle_get(&state, &headers).await,
		Method::DELETE => handle_delete(&state, &headers).await,
		_ => Err(ProxyError::MethodNotAllowed),
	};
	match result {
		Ok(response) => response,
		Err(e) => e.into_response(),
	}
}

fn subject_from_headers(headers: &HeaderMap) -> String {
	headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.map(auth::subject_from_bearer)
		.unwrap_or_default()
}

fn parsed_session(state: &AppState, headers: &HeaderMap) -> Result<CompositeSession, ProxyError> {
	let table = state.config.snapshot();
	let encrypted = headers
		.get(HEADER_SESSION_ID)
		.and_then(|v| v.to_str().ok())
		.ok_or(ProxyError::MissingSessionHeader)?;
	Ok(CompositeSession::decrypt_and_parse(encrypted, &state.crypto, &table)?)
}

async fn handle_post(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response, ProxyError> {
	let value: serde_json::Value =
		serde_json::from_slice(body).map_err(|e| ProxyError::MalformedRpc(e.to_string()))?;
	let message = Message::from_value(value).map_err(|_| ProxyError::MalformedRpc("not a JSON-RPC message".to_string()))?;

	let started = std::time::Instant::now();
	let method_label = message.method().unwrap_or("response").to_string();

	if method_label == "initialize" {
		let table = state.config.snapshot();
		let route = headers
			.get(HEADER_ROUTE)
			.and_then(|v| v.to_str().ok())
			.ok_or(ProxyError::MissingRouteHeader)?;
		let subject = subject_from_headers(headers);
		let Message::Request { id, params, .. } = message else {
			return Err(ProxyError::MalformedRpc("initialize must be a request".to_string()));
		};
		dispatch::record_client_capabilities(&state.dispatcher.metrics, &params);
		let result = state.dispatcher.initialize(&table, route, &subject, &id, &params).await;
		let status = if result.is_ok() { "ok" } else { "error" };
		state
			.dispatcher
			.metrics
			.record_request(&method_label, status, started.elapsed().as_secs_f64());
		let (session, body) = result?;
		let encrypted = session.encrypt(&state.crypto)?;
		let mut response = (StatusCode::OK, axum::Json(body)).into_response();
		response
			.headers_mut()
			.insert(HEADER_SESSION_ID, HeaderValue::from_str(&encrypted).map_err(|_| ProxyError::MalformedRpc("session id not header-safe".to_string()))?);
		return Ok(response);
	}

	let table = state.config.snapshot();
	let session = parsed_session(state, headers)?;
	let route = table
		.route(&session.route)
		.ok_or_else(|| ProxyError::Authorization("route", session.route.clone()))?;

	let outcome = state.dispatcher.dispatch(&table, route, &session, message).await;
	let status = if outcome.is_ok() { "ok" } else { "error" };
	state
		.dispatcher
		.metrics
		.record_request(&method_label, status, started.elapsed().as_secs_f64());

	Ok(match outcome? {
		DispatchOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
		DispatchOutcome::Json(value) => axum::Json(value).into_response(),
		DispatchOutcome::Sse(events) => sse_body_response(events),
	})
}

fn sse_body_response(events: Vec<SseEvent>) -> Response {
	let mut body = Vec::new();
	let mut codec = crate::sse::SseCodec::new();
	for event in &events {
		use tokio_util::codec::Encoder;
		let mut buf = bytes::BytesMut::new();
		if codec.encode(event, &mut buf).is_ok() {
			body.extend_from_slice(&buf);
		}
	}
	(
		StatusCode::OK,
		[(header::CONTENT_TYPE, "text/event-stream")],
		Body::from(body),
	)
		.into_response()
}

async fn handle_get(state: &AppState, headers: &HeaderMap) -> Result<Response, ProxyError> {
	let table = state.config.snapshot();
	let session = parsed_session(state, headers)?;
	let route = table
		.route(&session.route)
		.ok_or_else(|| ProxyError::Authorization("route", session.route.clone()))?
		.clone();

	let reconnect = match headers.get(HEADER_LAST_EVENT_ID).and_then(|v| v.to_str().ok()) {
		Some(encrypted) => Some(CompositeEventId::decrypt_and_parse(encrypted, &state.crypto)?),
		None => None,
	};

	let heartbeat_interval = config::heartbeat_interval_from_env();
	let events = state
		.streamer
		.open(&table, &route, &session, state.crypto.clone(), reconnect, heartbeat_interval);

	let sse_stream = events.map(|event| {
		let data = event
			.messages
			.first()
			.map(|message| serde_json::to_string(&message.to_value()).unwrap_or_default());
		let mut sse_event = Event::default();
		if let Some(event_type) = &event.event {
			sse_event = sse_event.event(event_type.clone());
		}
		if let Some(id) = &event.id {
			sse_event = sse_event.id(id.clone());
		}
		Ok::<_, std::convert::Infallible>(sse_event.data(data.unwrap_or_default()))
	});

	Ok(Sse::new(sse_stream)
		.keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)))
		.into_response())
}

async fn handle_delete(state: &AppState, headers: &HeaderMap) -> Result<Response, ProxyError> {
	let table = state.config.snapshot();
	let session = parsed_session(state, headers)?;
	state.dispatcher.close(&table, &session.route, &session).await;
	Ok(StatusCode::OK.into_response())
}

/// Reconstructs a standalone id value for observability logging (not part of
/// the dispatch path; kept here since it is only needed by the entry point).
#[allow(dead_code)]
fn id_for_log(id: &Id) -> String {
	id.to_string()
}
