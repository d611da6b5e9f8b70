use std::sync::Arc;

use crate::pool::{ConduitPool, PoolConfig};

use super::cache::DEFAULT_CACHE_CAPACITY;

/// Default upper bound on the hops of one ring walk.
pub const DEFAULT_MAX_ROUTING_HOPS: usize = 4096;
/// Default hostname a node listens on and advertises.
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

#[derive(Debug, Clone)]
/// Node configurations
pub struct Config {
    /// Hostname to listen on and advertise to other ring members.
    ///
    /// Defaults to [DEFAULT_HOSTNAME]
    pub hostname: String,
    /// Port to listen on.
    ///
    /// Defaults to `0`, where the operating system picks a port when the node starts,
    /// and the node's Id is derived from that port.
    pub port: u16,
    /// Capacity of the local store, in bytes.
    ///
    /// Defaults to [DEFAULT_CACHE_CAPACITY]
    pub cache_capacity: usize,
    /// Settings of the node's own pool, ignored when a shared pool is given.
    pub pool: PoolConfig,
    /// Ring walks give up with [crate::Error::RoutingLoop] past this many hops.
    ///
    /// Defaults to [DEFAULT_MAX_ROUTING_HOPS]
    pub max_routing_hops: usize,
    /// A pool shared with other nodes.
    ///
    /// Defaults to None, where the node creates, and closes on stop, a pool of its own.
    pub shared_pool: Option<Arc<ConduitPool>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: 0,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            pool: PoolConfig::default(),
            max_routing_hops: DEFAULT_MAX_ROUTING_HOPS,
            shared_pool: None,
        }
    }
}
