pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod jsonrpc;
pub mod metrics;
pub mod model;
pub mod names;
pub mod server;
pub mod session;
pub mod sse;
pub mod stream;
pub mod upstream;
