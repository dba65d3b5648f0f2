//! Server-Sent Events codec (spec §4.1). Parses a byte stream of
//! `text/event-stream` records — accepting CRLF, LF, or CR line endings —
//! into [`SseEvent`]s, each carrying zero or more JSON-RPC messages (one per
//! `data:` line, decoded independently). Writing is symmetric: one `event:`,
//! one `id:`, one `data:` line per message, then a blank line, flushed
//! unconditionally.
//!
//! Implemented as a [`tokio_util::codec`] `Decoder`/`Encoder` pair so it can
//! be driven over any `AsyncRead`/`AsyncWrite` via `FramedRead`/`FramedWrite`,
//! the same idiom `tokio-util`'s own `LinesCodec` uses.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::jsonrpc::Message;

#[derive(thiserror::Error, Debug)]
pub enum SseError {
	#[error("data payload is not a valid JSON-RPC message: {0}")]
	InvalidMessage(#[from] serde_json::Error),
	#[error("data payload is not a valid JSON-RPC message: {0} (at end of stream)")]
	InvalidMessageAtEof(serde_json::Error),
	#[error("data payload decoded as JSON but is not a JSON-RPC message{}", if *.0 { " (at end of stream)" } else { "" })]
	NotJsonRpc(bool),
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

/// One parsed SSE record: an optional event type, an optional id, and the
/// JSON-RPC messages carried by its `data:` line(s).
#[derive(Clone, Debug, Default)]
pub struct SseEvent {
	pub event: Option<String>,
	pub id: Option<String>,
	pub messages: Vec<Message>,
}

impl SseEvent {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_message(mut self, message: Message) -> Self {
		self.messages.push(message);
		self
	}
}

#[derive(Default)]
pub struct SseCodec {
	lines: Vec<String>,
}

impl SseCodec {
	pub fn new() -> Self {
		Self::default()
	}

	fn build_event(lines: Vec<String>, at_eof: bool) -> Result<SseEvent, SseError> {
		let mut event = SseEvent::new();
		for line in lines {
			let (field, value) = match line.split_once(':') {
				Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
				None => (line.as_str(), ""),
			};
			match field {
				"event" => event.event = Some(value.to_string()),
				"id" => event.id = Some(value.to_string()),
				"data" => {
					let value: serde_json::Value = serde_json::from_str(value).map_err(|e| {
						if at_eof {
							SseError::InvalidMessageAtEof(e)
						} else {
							SseError::InvalidMessage(e)
						}
					})?;
					let message = Message::from_value(value).map_err(|_| SseError::NotJsonRpc(at_eof))?;
					event.messages.push(message);
				},
				_ => { /* unknown field, ignore per SSE convention */ },
			}
		}
		Ok(event)
	}

	/// Finds the next complete line in `buf`, tolerating `\r\n`, `\n`, or
	/// bare `\r` as the terminator. Returns `None` when more bytes are
	/// needed, unless `at_eof` is set, in which case any remaining bytes are
	/// treated as a final, unterminated line.
	fn take_line(buf: &mut BytesMut, at_eof: bool) -> Option<String> {
		let mut i = 0;
		while i < buf.len() {
			match buf[i] {
				b'\n' => {
					let line = buf.split_to(i);
					buf.advance(1);
					return Some(String::from_utf8_lossy(&line).into_owned());
				},
				b'\r' => {
					if i + 1 < buf.len() {
						let consume_extra = usize::from(buf[i + 1] == b'\n');
						let line = buf.split_to(i);
						buf.advance(1 + consume_extra);
						return Some(String::from_utf8_lossy(&line).into_owned());
					} else if at_eof {
						let line = buf.split_to(i);
						buf.advance(1);
						return Some(String::from_utf8_lossy(&line).into_owned());
					} else {
						// Ambiguous: could be `\r\n` split across reads. Wait for more.
						return None;
					}
				},
				_ => i += 1,
			}
		}
		if at_eof && !buf.is_empty() {
			let line = buf.split_to(buf.len());
			Some(String::from_utf8_lossy(&line).into_owned())
		} else {
			None
		}
	}

	fn decode_inner(
		&mut self,
		buf: &mut BytesMut,
		at_eof: bool,
	) -> Result<Option<SseEvent>, SseError> {
		loop {
			match Self::take_line(buf, at_eof) {
				None => return Ok(None),
				Some(line) => {
					if line.is_empty() {
						if self.lines.is_empty() {
							continue;
						}
						let lines = std::mem::take(&mut self.lines);
						return Self::build_event(lines, false).map(Some);
					}
					self.lines.push(line);
				},
			}
		}
	}
}

impl Decoder for SseCodec {
	type Item = SseEvent;
	type Error = SseError;

	fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<SseEvent>, SseError> {
		self.decode_inner(buf, false)
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<SseEvent>, SseError> {
		if let Some(event) = self.decode_inner(buf, true)? {
			return Ok(Some(event));
		}
		// Trailing, blank-line-less record at end of stream: the spec calls
		// for joining the underlying parse failure with EOF. A well-formed
		// trailing record with no data lines is not an error (just a
		// ragged-but-harmless close); only report a failure if there were
		// unterminated lines that fail to decode as a record.
		if !self.lines.is_empty() {
			let lines = std::mem::take(&mut self.lines);
			return Self::build_event(lines, true).map(Some);
		}
		Ok(None)
	}
}

impl Encoder<&SseEvent> for SseCodec {
	type Error = SseError;

	fn encode(&mut self, event: &SseEvent, buf: &mut BytesMut) -> Result<(), SseError> {
		if let Some(ev) = &event.event {
			buf.put_slice(b"event: ");
			buf.put_slice(ev.as_bytes());
			buf.put_u8(b'\n');
		}
		if let Some(id) = &event.id {
			buf.put_slice(b"id: ");
			buf.put_slice(id.as_bytes());
			buf.put_u8(b'\n');
		}
		for message in &event.messages {
			let data = serde_json::to_string(&message.to_value())?;
			buf.put_slice(b"data: ");
			buf.put_slice(data.as_bytes());
			buf.put_u8(b'\n');
		}
		buf.put_u8(b'\n');
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn decode_all(bytes: &[u8]) -> Vec<SseEvent> {
		let mut codec = SseCodec::new();
		let mut buf = BytesMut::from(bytes);
		let mut out = Vec::new();
		while let Some(ev) = codec.decode(&mut buf).unwrap() {
			out.push(ev);
		}
		if let Some(ev) = codec.decode_eof(&mut buf).unwrap() {
			out.push(ev);
		}
		out
	}

	#[test]
	fn parses_single_event_lf() {
		let input = b"event: message\nid: 1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n\n";
		let events = decode_all(input);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].event.as_deref(), Some("message"));
		assert_eq!(events[0].id.as_deref(), Some("1"));
		assert_eq!(events[0].messages.len(), 1);
	}

	#[test]
	fn parses_crlf_and_cr() {
		let crlf = b"id: 1\r\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\r\n\r\n";
		assert_eq!(decode_all(crlf).len(), 1);
		let cr = b"id: 1\rdata: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\r\r";
		assert_eq!(decode_all(cr).len(), 1);
	}

	#[test]
	fn multiple_data_lines_become_independent_messages() {
		let input = b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"a\"}\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"b\"}\n\n";
		let events = decode_all(input);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].messages.len(), 2);
		assert_eq!(events[0].messages[0].method(), Some("a"));
		assert_eq!(events[0].messages[1].method(), Some("b"));
	}

	#[test]
	fn multiple_events_in_stream() {
		let input = b"data: {\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"b\"}\n\n";
		let events = decode_all(input);
		assert_eq!(events.len(), 2);
	}

	#[test]
	fn invalid_json_errors() {
		let mut codec = SseCodec::new();
		let mut buf = BytesMut::from(&b"data: not json\n\n"[..]);
		assert!(codec.decode(&mut buf).is_err());
	}

	#[test]
	fn write_then_read_round_trip() {
		let event = SseEvent {
			event: Some("message".to_string()),
			id: Some("42".to_string()),
			messages: vec![Message::Notification {
				method: "ping".to_string(),
				params: serde_json::json!({}),
			}],
		};
		let mut codec = SseCodec::new();
		let mut buf = BytesMut::new();
		codec.encode(&event, &mut buf).unwrap();
		let decoded = codec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(decoded.event, event.event);
		assert_eq!(decoded.id, event.id);
		assert_eq!(decoded.messages.len(), 1);
	}
}
