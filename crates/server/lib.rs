//! # courier-server - Worker daemon
//!
//! Runs one [`WorkerPool`](courier_core::WorkerPool) per configured queue
//! against a RabbitMQ broker. Each job is handed to an external handler
//! program; the pools stop together on Ctrl+C or SIGTERM, draining in-flight
//! jobs before the connections close.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let config = ServerConfig::builder()
//!         .amqp_uri("amqp://localhost:5672/%2f")
//!         .queues(["email_sending"])
//!         .concurrency(4)
//!         .handler(["node", "handlers/index.js"])
//!         .build();
//!
//!     Server::new(config).run().await
//! }
//! ```
//!
//! The `courier-server` binary reads the same settings from `COURIER_*`
//! environment variables; see [`ServerConfig::from_env`].

mod config;
mod logging;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use logging::init_logging;
pub use server::Server;
