//! Minimal JSON-RPC 2.0 message model. The proxy deliberately does not model
//! every MCP request/response shape (the dispatcher only needs to rewrite a
//! handful of well-known fields — `params.name`, `params.uri`,
//! `_meta.progressToken` — and otherwise forwards `params`/`result` verbatim
//! as an opaque [`serde_json::Value`]). See `DESIGN.md` for why this is
//! grounded as a deliberate simplification rather than depending on the full
//! typed MCP SDK catalog.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC id: `string` or `int64`. Incoming numeric ids that carry a
/// fractional part are coerced to `int64` by rounding, per spec §9's note
/// that the MCP SDK itself coerces floats to int64 on id round-trip —
/// callers that need bit-exact float tokens use the tagged-token encoding
/// in [`crate::names`] instead of this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
	Str(String),
	Int(i64),
}

impl std::fmt::Display for Id {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Id::Str(s) => write!(f, "{s}"),
			Id::Int(i) => write!(f, "{i}"),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// One parsed JSON-RPC message. Requests, notifications, responses, and
/// error responses all take different dispatch paths (spec §4.6).
#[derive(Clone, Debug)]
pub enum Message {
	Request {
		id: Id,
		method: String,
		params: Value,
	},
	Notification {
		method: String,
		params: Value,
	},
	Response {
		id: Id,
		result: Value,
	},
	Error {
		id: Id,
		error: JsonRpcError,
	},
}

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
	#[error("message is not a JSON object")]
	NotAnObject,
	#[error("message has neither method nor id")]
	Empty,
}

impl Message {
	pub fn method(&self) -> Option<&str> {
		match self {
			Message::Request { method, .. } => Some(method),
			Message::Notification { method, .. } => Some(method),
			_ => None,
		}
	}

	pub fn id(&self) -> Option<&Id> {
		match self {
			Message::Request { id, .. } => Some(id),
			Message::Response { id, .. } => Some(id),
			Message::Error { id, .. } => Some(id),
			Message::Notification { .. } => None,
		}
	}

	pub fn from_value(v: Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or(RpcError::NotAnObject)?;
		let id = obj.get("id").cloned();
		let method = obj.get("method").and_then(Value::as_str);

		if let Some(method) = method {
			let params = obj.get("params").cloned().unwrap_or(Value::Null);
			match id {
				Some(id_v) => Ok(Message::Request {
					id: value_to_id(&id_v),
					method: method.to_string(),
					params,
				}),
				None => Ok(Message::Notification {
					method: method.to_string(),
					params,
				}),
			}
		} else if let Some(id_v) = id {
			let id = value_to_id(&id_v);
			if let Some(err) = obj.get("error") {
				let error: JsonRpcError =
					serde_json::from_value(err.clone()).unwrap_or(JsonRpcError {
						code: -32603,
						message: err.to_string(),
						data: None,
					});
				Ok(Message::Error { id, error })
			} else {
				let result = obj.get("result").cloned().unwrap_or(Value::Null);
				Ok(Message::Response { id, result })
			}
		} else {
			Err(RpcError::Empty)
		}
	}

	pub fn to_value(&self) -> Value {
		match self {
			Message::Request { id, method, params } => serde_json::json!({
				"jsonrpc": "2.0",
				"id": id,
				"method": method,
				"params": params,
			}),
			Message::Notification { method, params } => serde_json::json!({
				"jsonrpc": "2.0",
				"method": method,
				"params": params,
			}),
			Message::Response { id, result } => serde_json::json!({
				"jsonrpc": "2.0",
				"id": id,
				"result": result,
			}),
			Message::Error { id, error } => serde_json::json!({
				"jsonrpc": "2.0",
				"id": id,
				"error": error,
			}),
		}
	}
}

fn value_to_id(v: &Value) -> Id {
	match v {
		Value::String(s) => Id::Str(s.clone()),
		Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				Id::Int(i)
			} else if let Some(f) = n.as_f64() {
				// The MCP SDK coerces float ids to int64 on round-trip; preserve
				// that quirk rather than erroring or falling back to a string.
				Id::Int(f.round() as i64)
			} else {
				Id::Str(n.to_string())
			}
		},
		other => Id::Str(other.to_string()),
	}
}
