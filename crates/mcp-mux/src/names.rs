//! Name codec (spec §4.3) and the tagged-token encoding shared by progress
//! tokens and server→client JSON-RPC ids (spec §3 "Progress token" /
//! "JSON-RPC ID").

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const SEP: &str = "__";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum NameError {
	#[error("invalid resource name")]
	MissingSeparator,
	#[error("invalid tagged token")]
	MalformedToken,
	#[error("unknown token type tag: {0}")]
	UnknownTag(String),
	#[error("invalid encoded token value")]
	InvalidEncoding,
}

/// Splits a client-visible resource name `backend__local` into its parts.
/// Only the *first* `__` is significant; local names may themselves contain
/// `__` and are passed through untouched.
pub fn split(name: &str) -> Result<(&str, &str), NameError> {
	name.split_once(SEP).ok_or(NameError::MissingSeparator)
}

/// Joins a backend and local name into the client-visible form.
pub fn join(backend: &str, local: &str) -> String {
	format!("{backend}{SEP}{local}")
}

/// A progress token or JSON-RPC id value, typed so that the wire-encoding can
/// restore it bit-exactly (spec §8: "floats must round-trip bit-exactly").
#[derive(Clone, Debug, PartialEq)]
pub enum TokenValue {
	Str(String),
	Int(i64),
	Float(f64),
}

impl From<&str> for TokenValue {
	fn from(s: &str) -> Self {
		TokenValue::Str(s.to_string())
	}
}

/// Encodes `value` tagged with the backend that owns it:
/// `<encoded-value>__<t>__<backend>` where `t` is `s`, `i`, or `f`.
pub fn encode_tagged(value: &TokenValue, backend: &str) -> String {
	let (encoded, tag) = match value {
		TokenValue::Str(s) => (STANDARD.encode(s.as_bytes()), "s"),
		TokenValue::Int(i) => (i.to_string(), "i"),
		TokenValue::Float(f) => (hex::encode(f.to_le_bytes()), "f"),
	};
	format!("{encoded}{SEP}{tag}{SEP}{backend}")
}

/// Reverses [`encode_tagged`], returning the original typed value and the
/// backend name it was tagged with.
pub fn decode_tagged(token: &str) -> Result<(TokenValue, &str), NameError> {
	let mut parts = token.splitn(3, SEP);
	let encoded = parts.next().ok_or(NameError::MalformedToken)?;
	let tag = parts.next().ok_or(NameError::MalformedToken)?;
	let backend = parts.next().ok_or(NameError::MalformedToken)?;

	let value = match tag {
		"s" => {
			let bytes = STANDARD
				.decode(encoded)
				.map_err(|_| NameError::InvalidEncoding)?;
			let s = String::from_utf8(bytes).map_err(|_| NameError::InvalidEncoding)?;
			TokenValue::Str(s)
		},
		"i" => {
			let i = encoded.parse::<i64>().map_err(|_| NameError::InvalidEncoding)?;
			TokenValue::Int(i)
		},
		"f" => {
			let bytes = hex::decode(encoded).map_err(|_| NameError::InvalidEncoding)?;
			let arr: [u8; 8] = bytes.try_into().map_err(|_| NameError::InvalidEncoding)?;
			TokenValue::Float(f64::from_le_bytes(arr))
		},
		other => return Err(NameError::UnknownTag(other.to_string())),
	};
	Ok((value, backend))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_only_first_separator() {
		assert_eq!(split("b1__tool__with__double").unwrap(), ("b1", "tool__with__double"));
	}

	#[test]
	fn split_missing_separator_errors() {
		assert_eq!(split("notool"), Err(NameError::MissingSeparator));
	}

	#[test]
	fn join_split_round_trip() {
		for (backend, local) in [("b1", "tool"), ("svc-a", "read__file"), ("x", "")] {
			let joined = join(backend, local);
			assert_eq!(split(&joined).unwrap(), (backend, local));
		}
	}

	#[test]
	fn tagged_token_round_trip_string() {
		let v = TokenValue::Str("pt".to_string());
		let enc = encode_tagged(&v, "b1");
		let (dec, backend) = decode_tagged(&enc).unwrap();
		assert_eq!(dec, v);
		assert_eq!(backend, "b1");
	}

	#[test]
	fn tagged_token_round_trip_int() {
		let v = TokenValue::Int(1);
		let enc = encode_tagged(&v, "b1");
		assert_eq!(enc, format!("1__i__b1"));
		let (dec, backend) = decode_tagged(&enc).unwrap();
		assert_eq!(dec, v);
		assert_eq!(backend, "b1");
	}

	#[test]
	fn tagged_token_round_trip_float_bit_exact() {
		for f in [0.0_f64, -0.0, 1.5, f64::MAX, f64::MIN_POSITIVE, -123456.789] {
			let v = TokenValue::Float(f);
			let enc = encode_tagged(&v, "b2");
			let (dec, backend) = decode_tagged(&enc).unwrap();
			assert_eq!(backend, "b2");
			match dec {
				TokenValue::Float(got) => assert_eq!(got.to_bits(), f.to_bits()),
				_ => panic!("expected float"),
			}
		}
	}

	#[test]
	fn backend_name_may_contain_double_underscore() {
		let v = TokenValue::Int(42);
		let enc = encode_tagged(&v, "weird__backend__name");
		let (dec, backend) = decode_tagged(&enc).unwrap();
		assert_eq!(dec, v);
		assert_eq!(backend, "weird__backend__name");
	}
}
