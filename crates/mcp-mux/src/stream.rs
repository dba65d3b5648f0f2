//! Notification streamer (spec §4.7): merges every backend's long-polled
//! notification stream into one outgoing SSE channel per client session,
//! with heartbeat injection and `Last-Event-Id` reconnect support.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::RoutingTable;
use crate::crypto::SessionCrypto;
use crate::dispatch::rewrite_outbound;
use crate::jsonrpc::{Id, Message};
use crate::model::Route;
use crate::session::{CompositeEventId, CompositeSession};
use crate::sse::SseEvent;
use crate::upstream::{Destination, UpstreamClient};

/// Bounded channel capacity for the backend→client event merge (spec §5:
/// "bounded channel, capacity ≈ 200 events").
const CHANNEL_CAPACITY: usize = 200;

pub struct NotificationStreamer {
	upstream: UpstreamClient,
}

impl NotificationStreamer {
	pub fn new(upstream: UpstreamClient) -> Self {
		Self { upstream }
	}

	/// Opens the merged notification stream for `session`. `reconnect`, if
	/// present, carries the per-backend `Last-Event-Id` the client supplied.
	/// Returns a stream of already-SSE-ready [`SseEvent`]s; the caller is
	/// responsible for encoding and writing them to the HTTP response.
	pub fn open(
		&self,
		table: &RoutingTable,
		route: &Route,
		session: &CompositeSession,
		crypto: Arc<SessionCrypto>,
		reconnect: Option<CompositeEventId>,
		heartbeat_interval: Duration,
	) -> ReceiverStream<SseEvent> {
		let shared_last_event: HashMap<String, String> = session
			.backends
			.keys()
			.map(|name| {
				let initial = reconnect
					.as_ref()
					.and_then(|r| r.backends.get(name))
					.cloned()
					.unwrap_or_default();
				(name.clone(), initial)
			})
			.collect();
		let shared_last_event = Arc::new(Mutex::new(shared_last_event));

		let (backend_tx, backend_rx) = mpsc::channel::<SseEvent>(CHANNEL_CAPACITY);
		for (backend_name, backend_session) in &session.backends {
			let Some(backend) = route.backend(backend_name) else {
				continue;
			};
			let dest = Destination {
				listener_addr: table.backend_listener_addr.clone(),
				path: backend.path.clone(),
			};
			let route_name = session.route.clone();
			let backend_name = backend_name.clone();
			let session_id = backend_session.session_id.clone();
			let last_event_id = reconnect
				.as_ref()
				.and_then(|r| r.backends.get(&backend_name))
				.cloned();
			let upstream = self.upstream.clone();
			let crypto = crypto.clone();
			let shared_last_event = shared_last_event.clone();
			let tx = backend_tx.clone();
			tokio::spawn(async move {
				run_backend_stream(
					upstream,
					dest,
					route_name,
					backend_name,
					session_id,
					last_event_id,
					crypto,
					shared_last_event,
					tx,
				)
				.await;
			});
		}
		drop(backend_tx);

		let (final_tx, final_rx) = mpsc::channel::<SseEvent>(CHANNEL_CAPACITY);
		tokio::spawn(merge_loop(backend_rx, final_tx, heartbeat_interval));
		ReceiverStream::new(final_rx)
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_backend_stream(
	upstream: UpstreamClient,
	dest: Destination,
	route_name: String,
	backend_name: String,
	session_id: String,
	last_event_id: Option<String>,
	crypto: Arc<SessionCrypto>,
	shared_last_event: Arc<Mutex<HashMap<String, String>>>,
	tx: mpsc::Sender<SseEvent>,
) {
	let stream = match upstream
		.open_stream(
			&dest,
			&route_name,
			&backend_name,
			Some(&session_id),
			last_event_id.as_deref(),
		)
		.await
	{
		Ok(Some(s)) => s,
		Ok(None) => return,
		Err(e) => {
			tracing::debug!(%backend_name, error = %e, "backend notification stream failed to open");
			return;
		},
	};
	tokio::pin!(stream);

	while let Some(item) = stream.next().await {
		let mut event = match item {
			Ok(event) => event,
			Err(e) => {
				tracing::debug!(%backend_name, error = %e, "backend notification stream errored; closing");
				break;
			},
		};

		for message in &mut event.messages {
			rewrite_outbound(message, &backend_name);
		}

		let combined_id = {
			let mut guard = shared_last_event.lock().await;
			if let Some(new_id) = &event.id {
				guard.insert(backend_name.clone(), new_id.clone());
			}
			let composite = CompositeEventId {
				backends: guard.clone(),
			};
			match composite.encrypt(&crypto) {
				Ok(encrypted) => Some(encrypted),
				Err(e) => {
					tracing::warn!(%backend_name, error = %e, "failed to encrypt combined event id");
					None
				},
			}
		};
		event.id = combined_id;

		if tx.send(event).await.is_err() {
			break;
		}
	}
}

async fn merge_loop(mut backend_rx: mpsc::Receiver<SseEvent>, final_tx: mpsc::Sender<SseEvent>, heartbeat_interval: Duration) {
	if heartbeat_interval.is_zero() {
		while let Some(event) = backend_rx.recv().await {
			if final_tx.send(event).await.is_err() {
				return;
			}
		}
		return;
	}

	let mut ticker = tokio::time::interval(heartbeat_interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	let mut backends_open = true;
	loop {
		if !backends_open {
			ticker.tick().await;
			if final_tx.send(heartbeat_event()).await.is_err() {
				return;
			}
			continue;
		}
		tokio::select! {
			biased;
			maybe_event = backend_rx.recv() => {
				match maybe_event {
					Some(event) => {
						if final_tx.send(event).await.is_err() {
							return;
						}
						ticker.reset();
					},
					None => backends_open = false,
				}
			},
			_ = ticker.tick() => {
				if final_tx.send(heartbeat_event()).await.is_err() {
					return;
				}
			},
		}
	}
}

fn heartbeat_event() -> SseEvent {
	SseEvent {
		event: Some("message".to_string()),
		id: None,
		messages: vec![Message::Request {
			id: Id::Str(uuid::Uuid::new_v4().to_string()),
			method: "ping".to_string(),
			params: Value::Object(Default::default()),
		}],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{RawBackend, RawConfig, RawRoute, RoutingTable};
	use crate::session::BackendSession;
	use std::time::Duration as StdDuration;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn table_with(server: &MockServer) -> RoutingTable {
		RoutingTable::build(RawConfig {
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
		.unwrap()
	}

	fn session() -> CompositeSession {
		let mut backends = HashMap::new();
		backends.insert("b1".to_string(), BackendSession { session_id: "s1".to_string(), last_event_id: String::new() });
		backends.insert("b2".to_string(), BackendSession { session_id: "s2".to_string(), last_event_id: String::new() });
		CompositeSession { route: "r".to_string(), subject: String::new(), backends }
	}

	#[tokio::test]
	async fn scenario_5_heartbeat() {
		let server = MockServer::start().await;
		// Both backends are silent for the duration of the test: any GET just hangs past our window, so answer 405 immediately instead (no stream) to keep the test itself fast.
		Mock::given(method("GET")).respond_with(ResponseTemplate::new(405)).mount(&server).await;

		let table = table_with(&server).await;
		let route = table.route("r").unwrap().clone();
		let streamer = NotificationStreamer::new(UpstreamClient::new());
		let crypto = Arc::new(SessionCrypto::new("seed", None));
		let mut events = streamer.open(&table, &route, &session(), crypto, None, StdDuration::from_millis(50));

		let mut seen_ids = std::collections::HashSet::new();
		for _ in 0..3 {
			let event = tokio::time::timeout(StdDuration::from_millis(500), events.next())
				.await
				.expect("heartbeat should arrive")
				.expect("stream should not end");
			assert_eq!(event.messages.len(), 1);
			assert_eq!(event.messages[0].method(), Some("ping"));
			let Some(Id::Str(id)) = event.messages[0].id().cloned() else {
				panic!("expected string id")
			};
			assert!(seen_ids.insert(id), "heartbeat ids must be distinct");
		}
	}

	#[tokio::test]
	async fn scenario_6_reconnect_with_405_omitted_backend() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/b1"))
			.and(header("last-event-id", "e1"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "text/event-stream")
					.set_body_raw(
						"id: e1-next\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{}}\n\n",
						"text/event-stream",
					),
			)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/b2"))
			.and(header("last-event-id", "e2"))
			.respond_with(ResponseTemplate::new(405))
			.mount(&server)
			.await;

		let table = table_with(&server).await;
		let route = table.route("r").unwrap().clone();
		let streamer = NotificationStreamer::new(UpstreamClient::new());
		let crypto = Arc::new(SessionCrypto::new("seed", None));
		let reconnect = CompositeEventId {
			backends: HashMap::from([("b1".to_string(), "e1".to_string()), ("b2".to_string(), "e2".to_string())]),
		};
		let mut events = streamer.open(&table, &route, &session(), crypto.clone(), Some(reconnect), StdDuration::ZERO);

		let event = tokio::time::timeout(StdDuration::from_millis(500), events.next())
			.await
			.expect("b1's event should arrive")
			.expect("stream should not end");
		assert_eq!(event.messages[0].method(), Some("notifications/message"));
		let encrypted_id = event.id.expect("combined event id must be set");
		let decoded = CompositeEventId::decrypt_and_parse(&encrypted_id, &crypto).unwrap();
		assert_eq!(decoded.backends.get("b1").unwrap(), "e1-next");
		assert_eq!(decoded.backends.get("b2").unwrap(), "e2");
	}
}
