//! Subject extraction and the credential-injection collaborator interface
//! (spec §4.9, §6). Signature verification happens upstream of the proxy;
//! here we only pull the `sub` claim out of the JWT payload segment.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
	#[serde(default)]
	sub: String,
}

/// Extracts the `sub` claim from a `Bearer <jwt>` header value without
/// verifying its signature (verification is the upstream gateway's job;
/// spec §4.9 is explicit that the proxy core never re-checks it). Returns
/// an empty subject for anything that doesn't parse as a three-segment JWT.
pub fn subject_from_bearer(header_value: &str) -> String {
	let Some(token) = header_value.strip_prefix("Bearer ") else {
		return String::new();
	};
	let mut segments = token.split('.');
	let (Some(_header), Some(payload)) = (segments.next(), segments.next()) else {
		return String::new();
	};
	let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload) else {
		return String::new();
	};
	serde_json::from_slice::<Claims>(&bytes)
		.map(|c| c.sub)
		.unwrap_or_default()
}

/// External collaborator interface (spec §6): the credential-injection
/// layer applies headers (and may mutate existing ones) to every outbound
/// upstream request. Its concrete implementations (AWS SigV4, bearer
/// tokens, Azure/Anthropic keys, ...) are out of scope here.
#[derive(thiserror::Error, Debug)]
#[error("auth handler failed: {0}")]
pub struct AuthError(pub String);

#[async_trait::async_trait]
pub trait AuthHandler: Send + Sync {
	async fn apply(
		&self,
		headers: &mut reqwest::header::HeaderMap,
		body: &[u8],
	) -> Result<(), AuthError>;
}

/// The default collaborator when no credential injection is configured:
/// a no-op pass-through.
pub struct NoopAuthHandler;

#[async_trait::async_trait]
impl AuthHandler for NoopAuthHandler {
	async fn apply(
		&self,
		_headers: &mut reqwest::header::HeaderMap,
		_body: &[u8],
	) -> Result<(), AuthError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_jwt(sub: &str) -> String {
		let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
		let payload = URL_SAFE_NO_PAD.encode(format!("{{\"sub\":\"{sub}\"}}"));
		format!("{header}.{payload}.sig")
	}

	#[test]
	fn extracts_sub_claim() {
		let jwt = make_jwt("user-42");
		assert_eq!(subject_from_bearer(&format!("Bearer {jwt}")), "user-42");
	}

	#[test]
	fn missing_bearer_prefix_is_empty() {
		assert_eq!(subject_from_bearer("Basic abc"), "");
	}

	#[test]
	fn malformed_jwt_is_empty() {
		assert_eq!(subject_from_bearer("Bearer not-a-jwt"), "");
	}

	#[tokio::test]
	async fn noop_handler_leaves_headers_untouched() {
		let mut headers = reqwest::header::HeaderMap::new();
		NoopAuthHandler.apply(&mut headers, b"{}").await.unwrap();
		assert!(headers.is_empty());
	}
}
