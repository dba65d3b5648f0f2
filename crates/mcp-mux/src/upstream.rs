//! Upstream client (spec §4.5): issues one JSON-RPC call to one backend and
//! decodes whatever shape it answers with.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio_util::codec::Decoder;

use crate::jsonrpc::Message;
use crate::sse::{SseCodec, SseError, SseEvent};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

const HEADER_ROUTE: &str = "x-ai-eg-mcp-route";
const HEADER_BACKEND: &str = "x-ai-eg-mcp-backend";
const HEADER_METHOD: &str = "x-ai-eg-mcp-method";
const HEADER_REQUEST_ID: &str = "x-ai-eg-mcp-request-id";
const HEADER_SESSION_ID: &str = "mcp-session-id";
const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
const HEADER_LAST_EVENT_ID: &str = "last-event-id";

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
	#[error("upstream request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("upstream returned status {0}: {1}")]
	Status(u16, String),
	#[error("upstream response body was not valid JSON-RPC: {0}")]
	InvalidJson(#[from] serde_json::Error),
	#[error("upstream event stream error: {0}")]
	Sse(#[from] SseError),
	#[error("upstream response had neither application/json nor text/event-stream content-type")]
	UnknownContentType,
	#[error("upstream JSON reply was not a JSON-RPC message")]
	NotJsonRpc,
}

/// Addresses one backend's MCP endpoint on the shared backend listener.
#[derive(Clone, Debug)]
pub struct Destination {
	pub listener_addr: String,
	pub path: String,
}

impl Destination {
	fn url(&self) -> String {
		format!("http://{}{}", self.listener_addr, self.path)
	}
}

/// What a single upstream POST can answer with (spec §4.5). The backend's
/// wire session id, when present, travels on the `mcp-session-id` response
/// header rather than in the body — real `initialize` results only ever
/// carry `protocolVersion`/`capabilities`/`serverInfo`.
#[derive(Debug)]
pub enum UpstreamResponse {
	Json(Message, Option<String>),
	Events(Vec<SseEvent>, Option<String>),
	Accepted,
}

/// Extra correlation metadata attached to outbound requests purely for
/// upstream observability (spec §4.5, §6).
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
	pub method: Option<String>,
	pub request_id: Option<String>,
}

#[derive(Clone)]
pub struct UpstreamClient {
	http: reqwest::Client,
}

impl Default for UpstreamClient {
	fn default() -> Self {
		Self::new()
	}
}

impl UpstreamClient {
	pub fn new() -> Self {
		Self {
			http: reqwest::Client::new(),
		}
	}

	fn base_request(
		&self,
		dest: &Destination,
		route: &str,
		backend: &str,
		session_id: Option<&str>,
		last_event_id: Option<&str>,
		meta: &RequestMeta,
	) -> reqwest::RequestBuilder {
		let mut req = self
			.http
			.post(dest.url())
			.header(CONTENT_TYPE, "application/json")
			.header(ACCEPT, "application/json, text/event-stream")
			.header(HEADER_ROUTE, route)
			.header(HEADER_BACKEND, backend)
			.header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION);
		if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
			req = req.header(HEADER_SESSION_ID, sid);
		}
		if let Some(eid) = last_event_id.filter(|s| !s.is_empty()) {
			req = req.header(HEADER_LAST_EVENT_ID, eid);
		}
		if let Some(m) = &meta.method {
			req = req.header(HEADER_METHOD, m);
		}
		if let Some(id) = &meta.request_id {
			req = req.header(HEADER_REQUEST_ID, id);
		}
		req
	}

	/// Sends one JSON-RPC message to `backend` and decodes its reply.
	#[allow(clippy::too_many_arguments)]
	pub async fn send(
		&self,
		dest: &Destination,
		route: &str,
		backend: &str,
		session_id: Option<&str>,
		last_event_id: Option<&str>,
		meta: &RequestMeta,
		message: &Message,
	) -> Result<UpstreamResponse, UpstreamError> {
		let body = serde_json::to_vec(&message.to_value())?;
		let resp = self
			.base_request(dest, route, backend, session_id, last_event_id, meta)
			.body(body)
			.send()
			.await?;

		if resp.status() == StatusCode::ACCEPTED {
			return Ok(UpstreamResponse::Accepted);
		}
		if !resp.status().is_success() {
			let status = resp.status().as_u16();
			let body = resp.text().await.unwrap_or_default();
			return Err(UpstreamError::Status(status, body));
		}

		let content_type = resp
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_string();
		let session_id = resp
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());

		if content_type.starts_with("application/json") {
			let value: serde_json::Value = resp.json().await?;
			let message = Message::from_value(value).map_err(|_| UpstreamError::NotJsonRpc)?;
			Ok(UpstreamResponse::Json(message, session_id))
		} else if content_type.starts_with("text/event-stream") {
			let bytes = resp.bytes().await?;
			let events = decode_sse_bytes(&bytes)?;
			Ok(UpstreamResponse::Events(events, session_id))
		} else {
			Err(UpstreamError::UnknownContentType)
		}
	}

	/// Opens a long-polling `GET` to `backend` for notification delivery
	/// (spec §4.7). A `405` response means "nothing to stream" and is
	/// reported as `Ok(None)`, not an error.
	pub async fn open_stream(
		&self,
		dest: &Destination,
		route: &str,
		backend: &str,
		session_id: Option<&str>,
		last_event_id: Option<&str>,
	) -> Result<Option<impl Stream<Item = Result<SseEvent, UpstreamError>> + use<>>, UpstreamError> {
		let mut req = self
			.http
			.get(dest.url())
			.header(ACCEPT, "text/event-stream")
			.header(HEADER_ROUTE, route)
			.header(HEADER_BACKEND, backend)
			.header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION);
		if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
			req = req.header(HEADER_SESSION_ID, sid);
		}
		if let Some(eid) = last_event_id.filter(|s| !s.is_empty()) {
			req = req.header(HEADER_LAST_EVENT_ID, eid);
		}

		let resp = req.send().await?;
		if resp.status() == StatusCode::METHOD_NOT_ALLOWED {
			return Ok(None);
		}
		if !resp.status().is_success() {
			let status = resp.status().as_u16();
			let body = resp.text().await.unwrap_or_default();
			return Err(UpstreamError::Status(status, body));
		}

		let byte_stream = resp.bytes_stream().map(|chunk| chunk.map_err(UpstreamError::from));
		Ok(Some(SseEventStream::new(byte_stream)))
	}

	/// Best-effort per-backend session tear-down (spec §4.4 Close). 2xx,
	/// 404, and 405 all count as success.
	pub async fn close_session(
		&self,
		dest: &Destination,
		route: &str,
		backend: &str,
		session_id: &str,
	) -> Result<(), UpstreamError> {
		let resp = self
			.http
			.delete(dest.url())
			.header(HEADER_ROUTE, route)
			.header(HEADER_BACKEND, backend)
			.header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
			.header(HEADER_SESSION_ID, session_id)
			.send()
			.await?;
		match resp.status() {
			StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
			status if status.is_success() => Ok(()),
			status => {
				tracing::warn!(%backend, %status, "backend session tear-down returned non-success; proceeding");
				Ok(())
			},
		}
	}
}

fn decode_sse_bytes(bytes: &[u8]) -> Result<Vec<SseEvent>, SseError> {
	let mut codec = SseCodec::new();
	let mut buf = bytes::BytesMut::from(bytes);
	let mut out = Vec::new();
	while let Some(event) = codec.decode(&mut buf)? {
		out.push(event);
	}
	if let Some(event) = codec.decode_eof(&mut buf)? {
		out.push(event);
	}
	Ok(out)
}

/// Adapts a raw byte stream (e.g. `reqwest`'s `bytes_stream`) into a stream
/// of decoded [`SseEvent`]s using [`SseCodec`] directly, without going
/// through `tokio_util::codec::FramedRead` (which requires `AsyncRead`,
/// not a `Stream<Item = Bytes>`).
struct SseEventStream<S> {
	inner: S,
	codec: SseCodec,
	buf: bytes::BytesMut,
	done: bool,
}

impl<S> SseEventStream<S> {
	fn new(inner: S) -> Self {
		Self {
			inner,
			codec: SseCodec::new(),
			buf: bytes::BytesMut::new(),
			done: false,
		}
	}
}

impl<S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin> Stream for SseEventStream<S> {
	type Item = Result<SseEvent, UpstreamError>;

	fn poll_next(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Self::Item>> {
		use std::task::Poll;
		let this = self.get_mut();
		loop {
			if let Some(event) = this.codec.decode(&mut this.buf).transpose() {
				return Poll::Ready(Some(event.map_err(UpstreamError::from)));
			}
			if this.done {
				return match this.codec.decode_eof(&mut this.buf) {
					Ok(Some(event)) => Poll::Ready(Some(Ok(event))),
					Ok(None) => Poll::Ready(None),
					Err(e) => Poll::Ready(Some(Err(e.into()))),
				};
			}
			match this.inner.poll_next_unpin(cx) {
				Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
				Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
				Poll::Ready(None) => this.done = true,
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}
