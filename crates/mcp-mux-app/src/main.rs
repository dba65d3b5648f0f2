//! `mcp-mux` binary entry point: loads configuration, wires up the proxy
//! core, and serves the HTTP surface (spec §4.9, §6).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mcp_mux::config::{ConfigStore, RawConfig, RoutingTable};
use mcp_mux::crypto::SessionCrypto;
use mcp_mux::dispatch::Dispatcher;
use mcp_mux::metrics::Metrics;
use mcp_mux::server::{self, AppState};
use mcp_mux::stream::NotificationStreamer;
use mcp_mux::upstream::UpstreamClient;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mcp-mux", about = "MCP multiplexing proxy")]
struct Cli {
	/// Path to a YAML routes/backends configuration file.
	#[arg(long, env = "MCP_PROXY_CONFIG")]
	config: String,

	/// Address the proxy listens on for downstream (client-facing) traffic.
	#[arg(long, env = "MCP_PROXY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
	listen_addr: SocketAddr,

	/// Primary seed for session/event-id encryption.
	#[arg(long, env = "MCP_PROXY_SESSION_SEED")]
	session_seed: String,

	/// Optional fallback seed, used only for decryption during seed rotation.
	#[arg(long, env = "MCP_PROXY_SESSION_SEED_FALLBACK")]
	session_seed_fallback: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();

	let cli = Cli::parse();

	let raw = std::fs::read_to_string(&cli.config).with_context(|| format!("reading config file {}", cli.config))?;
	let config: RawConfig = serde_yaml::from_str(&raw).context("parsing config YAML")?;
	let table = RoutingTable::build(config).context("building routing table")?;

	let crypto = Arc::new(SessionCrypto::new(cli.session_seed, cli.session_seed_fallback));
	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Metrics::new(&mut registry);
	let upstream = UpstreamClient::new();

	let state = Arc::new(AppState {
		config: ConfigStore::new(table),
		crypto,
		dispatcher: Dispatcher::new(upstream.clone(), metrics),
		streamer: NotificationStreamer::new(upstream),
	});

	let app = server::router(state);
	let listener = tokio::net::TcpListener::bind(cli.listen_addr)
		.await
		.with_context(|| format!("binding {}", cli.listen_addr))?;
	tracing::info!(addr = %cli.listen_addr, "mcp-mux listening");
	axum::serve(listener, app).await.context("serving")?;
	Ok(())
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_mux=info"));
	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}
