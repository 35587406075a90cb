#![doc(html_root_url = "https://docs.rs/subwire/latest")]
//! Public API for the `subwire` library.
//!
//! This crate is the engine of a client for a line-oriented
//! publish/subscribe wire protocol: an incremental frame parser, a
//! reconnecting connection manager with heartbeats and server-pool gossip,
//! a subscription registry with queue groups and draining, a request
//! multiplexer over one shared reply inbox, and a pull-consumer flow
//! controller with pending-budget accounting and ordered gap recovery.
//!
//! The entry point is [`Client::connect`]; everything else hangs off the
//! returned handle.

pub mod auth;
pub mod client;
pub mod config;
mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod frame;
pub mod headers;
pub mod message;
pub mod metrics;
pub mod parser;
mod request;
pub mod server_pool;
pub mod subscription;
pub mod transport;
mod writer;

pub use client::Client;
pub use config::{ClientConfig, PingConfig, ReconnectConfig};
pub use consumer::{
    AckInfo, AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, Messages, PullConsumer,
    PullOptions,
};
pub use error::{ConnectError, ConsumerError, Error, ParseError, RequestError, Result};
pub use events::{ConnState, Event, Events};
pub use headers::HeaderMap;
pub use message::Message;
pub use request::{Replies, Termination};
pub use subscription::Subscriber;
