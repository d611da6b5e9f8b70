#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod error;
mod node;

pub mod conduit;
pub mod mediator;
pub mod multicast;
pub mod pool;
pub mod topology;

pub use crate::common::{messages, Id, LinkSnapshot, Message, PeerRef, ID_SIZE};
pub use bytes::Bytes;
pub use conduit::{Conduit, PendingResponse};
pub use error::{Error, Result};
pub use node::{cache, Config, Node, NodeBuilder, DEFAULT_HOSTNAME, DEFAULT_MAX_ROUTING_HOPS};
pub use pool::{ConduitPool, PoolConfig};
