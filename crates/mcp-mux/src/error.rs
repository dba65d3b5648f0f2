//! Top-level error taxonomy surfaced to HTTP clients (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::crypto::CryptoError;
use crate::names::NameError;
use crate::session::SessionError;
use crate::upstream::UpstreamError;

/// Error produced anywhere in the proxy's request path. Every variant knows
/// its own HTTP status; none of them are JSON-RPC error objects (per spec §7
/// these are all "plain text body" failures, except upstream passthrough).
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("method not allowed")]
	MethodNotAllowed,
	#[error("{0}")]
	Session(#[from] SessionError),
	#[error("{0}")]
	Crypto(#[from] CryptoError),
	#[error("{0}")]
	Name(#[from] NameError),
	#[error("{0}")]
	Upstream(#[from] UpstreamError),
	#[error("malformed JSON-RPC message: {0}")]
	MalformedRpc(String),
	#[error("unsupported method: {0}")]
	UnsupportedMethod(String),
	#[error("missing mcp-session-id header")]
	MissingSessionHeader,
	#[error("missing x-ai-eg-mcp-route header")]
	MissingRouteHeader,
	#[error("unknown {0}: {1}")]
	Authorization(&'static str, String),
	#[error("no backend in route could be initialized")]
	InitializationFailed,
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ProxyError::InitializationFailed => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Upstream(UpstreamError::Status(code, _)) => {
				StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
			},
			ProxyError::Authorization(kind, _) if *kind == "backend" => StatusCode::NOT_FOUND,
			ProxyError::Authorization(_, _) => StatusCode::BAD_REQUEST,
			_ => StatusCode::BAD_REQUEST,
		}
	}
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let status = self.status();
		tracing::debug!(error = %self, %status, "request failed");
		(status, self.to_string()).into_response()
	}
}
