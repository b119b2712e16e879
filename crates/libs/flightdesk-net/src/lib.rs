//! Resilient network access for the flightdesk admin frontend.
//!
//! Two halves share one error type and one backoff policy:
//!
//! - **Requests**: [`RequestExecutor`] wraps any async operation with a TTL
//!   cache, in-flight deduplication, per-call-site staleness protection and
//!   retry with backoff. [`RestClient`] routes HTTP calls through it.
//! - **Push channel**: [`ConnectionManager`] keeps one WebSocket session alive
//!   with heartbeat, bounded reconnection and topic subscriptions.
//!   [`ConnectionHub`] shares managers by endpoint.
//!
//! Configuration is a single TOML document, see [`NetConfig`].

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod envelope;
mod error;
pub mod executor;
pub mod hub;
pub mod network;
pub mod rest;
pub mod subscription;

pub use backoff::{backoff_delay, BackoffScheduler};
pub use cache::{CacheStats, Invalidation, ResponseCache};
pub use config::{ConnectionConfig, NetConfig, RequestConfig};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, Frame, ReconnectState,
    Transport, WsConnector, NORMAL_CLOSURE,
};
pub use envelope::Envelope;
pub use error::{ConfigError, NetError};
pub use executor::{cache_key, CallContext, ExecuteOptions, Invocation, Operation, RequestExecutor};
pub use hub::ConnectionHub;
pub use network::NetworkStatus;
pub use rest::{HttpMethod, HttpRequest, HttpTransport, ReqwestTransport, RestClient};
pub use subscription::{SubscriptionRegistry, TopicReceiver};
