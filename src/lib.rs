//! relaycast - realtime publish/subscribe relay
//!
//! Clients hold persistent connections, identify themselves with `init`,
//! join and leave named channels and publish JSON envelopes that are fanned
//! out to every connection of every subscribed identity.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → transport → Handler ─┬─ init ──────────────→ IdentityRegistry
//!                                    ├─ subscribe/unsub ───→ control queue ─┐
//!                                    └─ publish ───────────→ data queue ←───┘
//!                                                               │
//!                                                               └→ fan-out to connections
//! ```
//!
//! Both queues are bounded and drained by exactly one task each, so all
//! traffic for a channel is delivered in the order it was queued.
//!
//! ## Environment Variables
//!
//! - `RELAYCAST_PORT` - listen port
//! - `RELAYCAST_DEBUG` - verbose logging
//! - `RELAYCAST_DATA_QUEUE` / `RELAYCAST_CONTROL_QUEUE` - queue capacities
//! - `RELAYCAST_RESOURCE` - WebSocket endpoint path
//! - `RELAYCAST_LICENSE_FILE` / `RELAYCAST_LICENSE_SECRET` - licence keys

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod handler;
pub mod hub;
pub mod identity;
pub mod topics;
pub mod transport;

pub use auth::{AllowAll, Authorizer, LicenseAuthorizer, RequestMeta};
pub use config::Config;
pub use connection::{ChannelConnection, Connection, ConnectionError};
pub use dispatch::{DispatchError, DispatchRequest};
pub use envelope::{Command, Envelope, EnvelopeError, EnvelopeKind};
pub use handler::Handler;
pub use hub::Hub;
pub use identity::{IdentityRecord, IdentityRegistry};
pub use topics::TopicRegistry;
pub use transport::{AppState, router, serve};
