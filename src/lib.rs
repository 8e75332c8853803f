//! Edge Node - Caching image edge node for a distributed content network
//!
//! This library provides the core functionality for the edge node, including
//! the journaled disk cache, the streaming cache writer, the coordinator
//! client, the node lifecycle controller and the image server.

pub mod caching_stream;
pub mod config;
pub mod coordinator;
pub mod disk_cache;
pub mod error;
pub mod image_server;
pub mod journal;
pub mod lifecycle;
pub mod logging;
pub mod shutdown;
pub mod statistics;
pub mod upstream_connector;

pub use error::{NodeError, Result};
