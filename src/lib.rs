#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

//! Strato - layered-transport MQTT 3.1.1 broker core.
//!
//! # Module Organization
//!
//! ## Routing
//! - `routing::topic` - Topic and filter parsing and matching
//! - `routing::trie` - Wildcard routing trie over generic payloads
//!
//! ## Protocol
//! - `protocol::packet` - MQTT 3.1.1 control packet model
//! - `protocol::codec` - Incremental wire codec
//!
//! ## Networking
//! - `net::listener` - Tagged TCP/TLS/WebSocket listener stacks
//! - `net::tls` - rustls acceptor construction
//! - `net::ws` - WebSocket upgrade and byte-stream adapter
//! - `net::framed` - MQTT framing with per-connection leftover buffering
//!
//! ## Broker
//! - `broker` - Session registry, subscription index, publish dispatch
//! - `broker::session` - Per-client subscriptions and per-QoS queues
//! - `broker::retained` - Retained message store interface
//!
//! ## Edges
//! - `auth` - CONNECT-time authentication interface
//! - `server` - Accept loop and connection handling
//! - `config` - TOML configuration

pub mod auth;
pub mod broker;
pub mod config;
pub mod net;
pub mod protocol;
pub mod routing;
pub mod server;

pub use broker::{Broker, MemoryRetained, RetainedStore, Session, SessionKey, SessionPhase};
pub use config::Config;
pub use net::{Listener, MqttStream, TransportError};
pub use protocol::{Packet, Qos};
pub use routing::{Filter, Topic, TopicError, Trie};
pub use server::{serve, ServerCtx};
