//! # mqtt-rate-proxy
//!
//! A transparent TCP reverse proxy for MQTT 3.1.1 traffic that enforces
//! per-client rate limits before bytes reach the downstream broker.
//!
//! ## Architecture
//!
//! The server uses `mio` for non-blocking I/O with a poll-based event loop,
//! one small reactor per connection worker rather than one global reactor
//! shared by every connection.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         mqtt-rate-proxy                             │
//! │  ┌──────────┐   ┌───────────────┐   ┌──────────────┐   ┌────────┐ │
//! │  │ Listener │ → │ Forwarder     │ → │ Rate Limiter │   │ Broker │ │
//! │  │ (TCP)    │   │ (mio, 2 fds)  │ ↔ │ (token       │ ↔ │        │ │
//! │  └──────────┘   └───────────────┘   │  buckets)    │   └────────┘ │
//! │                                      └──────────────┘             │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqtt_rate_proxy::{NullMetricsSink, ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig::load(None)?;
//! let mut server = ProxyServer::new(config, Arc::new(NullMetricsSink));
//! server.run()?;
//! ```

#![allow(clippy::cast_precision_loss)] // rate limiter math uses f64 throughout

pub mod buffer_pool;
pub mod config;
pub mod connect_parser;
pub mod error;
pub mod forwarder;
pub mod identity;
pub mod metrics;
pub mod rate_limiter;
pub mod server;

pub use buffer_pool::BytesMutPool;
pub use config::{ConfigError, ProxyConfig};
pub use connect_parser::parse_client_id;
pub use error::{ProxyError, ProxyResult};
pub use forwarder::Forwarder;
pub use identity::{resolve_client_info, ClientInfo};
pub use metrics::{MetricsSink, NullMetricsSink, PrometheusMetricsSink};
pub use rate_limiter::{RateLimitPolicy, RateLimiter, RateLimiterStats};
pub use server::{ProxyServer, ShutdownHandle};
