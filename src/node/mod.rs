//! Ring member: serves its links and its share of the key space, routes and joins
//! through other members.

pub mod cache;
mod config;

use std::{
    collections::{BTreeMap, HashSet},
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, trace};

use crate::{
    common::{Id, LinkSnapshot, Message, PeerRef},
    conduit::{Conduit, Handler, Inbound, TcpServer},
    pool::ConduitPool,
    topology, Error, Result,
};

use cache::WeightedCache;
pub use config::{Config, DEFAULT_HOSTNAME, DEFAULT_MAX_ROUTING_HOPS};

#[derive(Debug, Default)]
struct Links {
    prev: Option<PeerRef>,
    next: Option<PeerRef>,
    fingers: BTreeMap<Id, PeerRef>,
}

/// State shared between a node and its request handler.
#[derive(Debug)]
struct State {
    links: RwLock<Links>,
    cache: Mutex<WeightedCache>,
}

impl State {
    fn snapshot(&self, node: &PeerRef) -> LinkSnapshot {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);

        LinkSnapshot {
            node: node.clone(),
            prev: links.prev.clone(),
            next: links.next.clone(),
            fingers: links.fingers.values().cloned().collect(),
        }
    }

    fn apply(&self, snapshot: LinkSnapshot) {
        let mut fingers = snapshot.finger_table();
        fingers.remove(snapshot.id());

        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);

        links.prev = snapshot.prev;
        links.next = snapshot.next;
        links.fingers = fingers;
    }

    fn cache(&self) -> MutexGuard<'_, WeightedCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Answers the ring protocol on behalf of one node.
struct RingHandler {
    peer: PeerRef,
    state: Arc<State>,
}

impl Handler for RingHandler {
    fn handle(&self, inbound: Inbound) -> Option<Bytes> {
        let Inbound { frame, sender, .. } = inbound;

        let message = match Message::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, ?sender, "Received invalid message");
                // Unblocks the requester, which fails to parse the empty reply.
                return Some(Bytes::new());
            }
        };

        trace!(context = "node_message_receiving", kind = message.kind(), ?sender);

        match message {
            Message::SyncPull => match self.state.snapshot(&self.peer).to_bytes() {
                Ok(bytes) => Some(bytes.into()),
                Err(error) => {
                    debug!(?error, "Error encoding links");
                    Some(Bytes::new())
                }
            },
            Message::SyncPush(snapshot) => {
                if snapshot.node == self.peer {
                    self.state.apply(snapshot);
                } else {
                    debug!(node = %snapshot.node, ?sender, "Ignoring links pushed for another node");
                }
                Some(Bytes::new())
            }
            Message::Put { key, value } => {
                self.state.cache().insert(key, value);
                Some(Bytes::new())
            }
            // Stored values are bencoded, never empty, so empty means absent.
            Message::Get { key } => Some(self.state.cache().get(&key).unwrap_or_default()),
        }
    }
}

/// A ring member.
///
/// Every operation, including the ones that end up at this node itself, goes over the
/// network through the node's [ConduitPool], so a node only ever trusts links it just
/// pulled from their authoritative owner.
#[derive(Debug)]
pub struct Node {
    peer: PeerRef,
    config: Config,
    state: Arc<State>,
    pool: Arc<ConduitPool>,
    owns_pool: bool,
    server: Option<TcpServer>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Creates a node listening on `hostname:port` once started.
    pub fn new(hostname: &str, port: u16) -> Result<Self> {
        Node::builder().hostname(hostname).port(port).build()
    }

    fn from_config(mut config: Config) -> Result<Self> {
        let (pool, owns_pool) = match config.shared_pool.take() {
            Some(pool) => (pool, false),
            None => (Arc::new(ConduitPool::tcp(config.pool.clone())?), true),
        };

        Ok(Node {
            peer: PeerRef::new(&config.hostname, config.port),
            state: Arc::new(State {
                links: Default::default(),
                cache: Mutex::new(WeightedCache::new(config.cache_capacity)),
            }),
            config,
            pool,
            owns_pool,
            server: None,
        })
    }

    // === Getters ===

    /// This node's address and Id.
    ///
    /// With a configured port of `0` the final address is only known after [Node::start].
    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    pub fn id(&self) -> &Id {
        &self.peer.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConduitPool> {
        &self.pool
    }

    /// Address of the listener, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(TcpServer::local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// This node's authoritative links.
    pub fn snapshot(&self) -> LinkSnapshot {
        self.state.snapshot(&self.peer)
    }

    /// Reads a locally stored value, without promoting it.
    pub fn cached(&self, key: &Id) -> Option<Bytes> {
        self.state.cache().peek(key)
    }

    // === Lifecycle ===

    /// Binds the listener and starts serving ring requests.
    pub fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(Error::AlreadyStarted);
        }

        if self.owns_pool && self.pool.is_closed() {
            self.pool = Arc::new(ConduitPool::tcp(self.config.pool.clone())?);
        }

        let listener = TcpListener::bind((self.peer.hostname.as_str(), self.peer.port))?;
        let port = listener.local_addr()?.port();

        if port != self.peer.port {
            self.peer = PeerRef::new(&self.peer.hostname, port);
        }

        let handler = Arc::new(RingHandler {
            peer: self.peer.clone(),
            state: self.state.clone(),
        });

        self.server = Some(TcpServer::from_listener(listener, handler)?);

        info!(node = %self.peer, "Ring node listening");

        Ok(())
    }

    /// Stops listening. A node owning its pool also closes it, conduits and evictor
    /// included, and gets a fresh one on the next [Node::start].
    pub fn stop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.close();

            if self.owns_pool {
                self.pool.close();
            }

            info!(node = %self.peer, "Ring node stopped");
        }
    }

    fn ensure_started(&self) -> Result<()> {
        match self.server {
            Some(_) => Ok(()),
            None => Err(Error::NotStarted),
        }
    }

    // === Sync protocol ===

    /// Pulls `peer`'s authoritative links.
    pub fn sync(&self, peer: &PeerRef) -> Result<LinkSnapshot> {
        let reply = self.request(peer, &Message::SyncPull)?;
        let snapshot = LinkSnapshot::from_bytes(&reply)?;

        if snapshot.node != *peer {
            debug!(expected = %peer, got = %snapshot.node, "Synced a different node");
        }

        Ok(snapshot)
    }

    /// Overwrites the authoritative links of `snapshot.node` with `snapshot`.
    pub fn push(&self, snapshot: &LinkSnapshot) -> Result<()> {
        self.request(&snapshot.node, &Message::SyncPush(snapshot.clone()))?;

        Ok(())
    }

    fn request(&self, peer: &PeerRef, message: &Message) -> Result<Bytes> {
        let payload: Bytes = message.to_bytes()?.into();

        let attempt = || -> Result<Bytes> {
            let conduit = self.pool.get_or_create(&peer.address())?;
            conduit.request(payload.clone())?.wait()
        };

        match attempt() {
            // A pooled conduit can break while idle, the pool replaces it on the next try.
            Err(Error::BrokenTransfer) | Err(Error::ConduitClosed) => {
                trace!(context = "node_request", peer = %peer, "Retrying on a fresh conduit");
                attempt()
            }
            result => result,
        }
    }

    // === Routing ===

    /// Finds the two adjacent ring members `(prev, next)` such that `target` falls in
    /// `(prev, next]`, walking the ring from `start`.
    ///
    /// A standalone `start` encloses every target, and is returned as both ends.
    pub fn find_enclosing_interval(
        &self,
        start: &PeerRef,
        target: &Id,
    ) -> Result<(LinkSnapshot, LinkSnapshot)> {
        let first = self.sync(start)?;
        let mut prev = self.closest_start(first, target)?;

        let Some(next) = prev.next.clone() else {
            return Ok((prev.clone(), prev));
        };
        let mut next = self.sync(&next)?;

        let mut visited = HashSet::from([prev.node.id, next.node.id]);
        let mut hops = 0;

        while !encloses(prev.id(), next.id(), target) {
            hops += 1;
            if hops > self.config.max_routing_hops {
                return Err(Error::RoutingLoop { hops });
            }

            let reached = if target <= prev.id() {
                let before = prev
                    .prev
                    .clone()
                    .ok_or_else(|| Error::BrokenRing(prev.node.clone()))?;

                next = prev;
                prev = self.sync(&before)?;

                prev.node.id
            } else {
                let after = next
                    .next
                    .clone()
                    .ok_or_else(|| Error::BrokenRing(next.node.clone()))?;

                prev = next;
                next = self.sync(&after)?;

                next.node.id
            };

            // Closing the ring steps back onto a visited peer, and that pair is the answer.
            if encloses(prev.id(), next.id(), target) {
                break;
            }

            if !visited.insert(reached) {
                return Err(Error::RoutingLoop { hops });
            }
        }

        trace!(
            context = "node_routing",
            %target,
            prev = %prev.node,
            next = %next.node,
            hops,
            "Found enclosing interval"
        );

        Ok((prev, next))
    }

    /// Narrows a ring walk's starting point through finger tables, only ever moving to
    /// a peer strictly closer to `target`.
    fn closest_start(&self, start: LinkSnapshot, target: &Id) -> Result<LinkSnapshot> {
        let mut current = start;
        let mut hops = 0;

        loop {
            let candidate = match (
                current.floor_finger(target),
                current.ceiling_finger(target),
            ) {
                (Some(floor), Some(ceiling)) => {
                    Some(PeerRef::closest_between(target, floor, ceiling))
                }
                (Some(finger), None) | (None, Some(finger)) => Some(finger),
                (None, None) => None,
            }
            .cloned();

            let Some(candidate) = candidate else {
                return Ok(current);
            };

            if target.abs_diff(&candidate.id) >= target.abs_diff(current.id()) {
                return Ok(current);
            }

            hops += 1;
            if hops > self.config.max_routing_hops {
                return Err(Error::RoutingLoop { hops });
            }

            current = self.sync(&candidate)?;
        }
    }

    /// The ring member responsible for `key`: the numerically closer end of the
    /// interval enclosing it.
    pub fn find_closest(&self, key: &Id) -> Result<PeerRef> {
        self.ensure_started()?;

        let (prev, next) = self.find_enclosing_interval(&self.peer, key)?;

        Ok(PeerRef::closest_between(key, &prev.node, &next.node).clone())
    }

    // === Membership ===

    /// Inserts this node into the ring `existing` belongs to.
    ///
    /// Joins are not atomic, two nodes joining the same interval at once can leave
    /// the ring inconsistent.
    pub fn join(&self, existing: &PeerRef) -> Result<()> {
        self.ensure_started()?;

        if *existing == self.peer {
            debug!(node = %self.peer, "Ignoring a join through this node itself");
            return Ok(());
        }

        let (mut prev, mut next) = self.find_enclosing_interval(existing, self.id())?;

        if prev.node == self.peer || next.node == self.peer {
            debug!(node = %self.peer, "Already a ring member");
            return Ok(());
        }

        let mut own = self.snapshot();
        own.prev = Some(prev.node.clone());
        own.next = Some(next.node.clone());

        if prev.node == next.node {
            // A ring of one, both of its links now point at us.
            prev.prev = Some(self.peer.clone());
            prev.next = Some(self.peer.clone());

            self.push(&prev)?;
        } else {
            prev.next = Some(self.peer.clone());
            next.prev = Some(self.peer.clone());

            self.push(&prev)?;
            self.push(&next)?;
        }

        self.push(&own)?;

        info!(
            node = %self.peer,
            prev = %prev.node,
            next = %next.node,
            "Joined the ring"
        );

        Ok(())
    }

    // === Storage ===

    /// Stores `value` at the ring member responsible for `key`.
    ///
    /// The store itself is fire-and-forget, a successful return only means it was sent.
    pub fn put<T: Serialize>(&self, key: Id, value: &T) -> Result<()> {
        let owner = self.find_closest(&key)?;
        let value: Bytes = serde_bencode::to_bytes(value)?.into();

        let conduit = self.pool.get_or_create(&owner.address())?;
        conduit.send(Message::Put { key, value }.to_bytes()?.into())?;

        debug!(%key, owner = %owner, "Put value");

        Ok(())
    }

    /// Reads the value stored under `key` at the ring member responsible for it.
    pub fn get<T: DeserializeOwned>(&self, key: Id) -> Result<Option<T>> {
        let owner = self.find_closest(&key)?;
        let reply = self.request(&owner, &Message::Get { key })?;

        trace!(context = "node_get", %key, owner = %owner, found = !reply.is_empty());

        if reply.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_bencode::from_bytes(&reply)?))
    }

    // === Fingers ===

    /// Replaces this node's finger table.
    pub fn set_fingers<I: IntoIterator<Item = PeerRef>>(&self, fingers: I) {
        let mut links = self.state.links.write().unwrap_or_else(PoisonError::into_inner);

        links.fingers = fingers
            .into_iter()
            .filter(|finger| *finger != self.peer)
            .map(|finger| (finger.id, finger))
            .collect();
    }

    /// Rebuilds this node's fingers from a full walk of the ring, see [topology::update_fingers].
    pub fn update_fingers(&self) -> Result<Vec<PeerRef>> {
        self.ensure_started()?;

        topology::update_fingers(self, &self.peer)
    }

    /// Replaces the local store with an empty one of `capacity` bytes.
    pub fn resize_cache(&self, capacity: usize) {
        *self.state.cache() = WeightedCache::new(capacity);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Whether `target` falls in the ring interval `(prev, next]`.
fn encloses(prev: &Id, next: &Id, target: &Id) -> bool {
    if prev < next {
        prev < target && target <= next
    } else {
        // The interval wraps around the top of the Id space.
        target > prev || target <= next
    }
}

#[derive(Debug, Default)]
pub struct NodeBuilder {
    config: Config,
}

impl NodeBuilder {
    /// Hostname to listen on and advertise.
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.config.hostname = hostname.to_string();
        self
    }

    /// Port to listen on, `0` to let the operating system pick one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Capacity of the local store, in bytes.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn pool_config(mut self, config: crate::pool::PoolConfig) -> Self {
        self.config.pool = config;
        self
    }

    /// Share a pool with other nodes instead of creating one.
    pub fn pool(mut self, pool: Arc<ConduitPool>) -> Self {
        self.config.shared_pool = Some(pool);
        self
    }

    pub fn max_routing_hops(mut self, hops: usize) -> Self {
        self.config.max_routing_hops = hops;
        self
    }

    pub fn build(self) -> Result<Node> {
        Node::from_config(self.config)
    }

    /// Builds and starts the node.
    pub fn start(self) -> Result<Node> {
        let mut node = self.build()?;
        node.start()?;

        Ok(node)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(last: u8) -> Id {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Id(bytes)
    }

    /// The Id right after `id`.
    fn after(id: &Id) -> Id {
        let mut bytes = id.0;
        for byte in bytes.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
        Id(bytes)
    }

    /// Started nodes sorted by Id, linked into a ring through their own state.
    fn linked_ring(size: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = (0..size)
            .map(|_| Node::builder().start().unwrap())
            .collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));

        for (i, node) in nodes.iter().enumerate() {
            let mut links = LinkSnapshot::new(node.peer().clone());
            links.prev = Some(nodes[(i + size - 1) % size].peer().clone());
            links.next = Some(nodes[(i + 1) % size].peer().clone());
            node.state.apply(links);
        }

        nodes
    }

    /// Every member, walking from every member, finds `(prev, next]` for `target`.
    fn assert_interval(nodes: &[Node], target: &Id, prev: &Node, next: &Node) {
        for via in nodes {
            for start in nodes {
                let (found_prev, found_next) =
                    via.find_enclosing_interval(start.peer(), target).unwrap();

                assert_eq!(found_prev.node, *prev.peer(), "from {}", start.peer());
                assert_eq!(found_next.node, *next.peer(), "from {}", start.peer());
            }
        }
    }

    #[test]
    fn two_node_intervals() {
        let nodes = linked_ring(2);
        let (low, high) = (&nodes[0], &nodes[1]);

        // Below the lowest, and above the highest, both end up on the wrapping pair.
        assert_interval(&nodes, &Id::default(), high, low);
        assert_interval(&nodes, &Id([0xff; 20]), high, low);
        assert_interval(&nodes, low.id(), high, low);

        assert_interval(&nodes, &after(low.id()), low, high);
        assert_interval(&nodes, high.id(), low, high);

        assert_eq!(low.find_closest(&Id::default()).unwrap(), *low.peer());
    }

    #[test]
    fn three_node_intervals() {
        let nodes = linked_ring(3);
        let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

        assert_interval(&nodes, &Id::default(), c, a);
        assert_interval(&nodes, &Id([0xff; 20]), c, a);
        assert_interval(&nodes, a.id(), c, a);

        // Walking backward from `c`, forward from `a`.
        assert_interval(&nodes, &after(a.id()), a, b);
        assert_interval(&nodes, b.id(), a, b);
        assert_interval(&nodes, &after(b.id()), b, c);
        assert_interval(&nodes, c.id(), b, c);

        for node in &nodes {
            assert_eq!(node.find_closest(&after(c.id())).unwrap(), *c.peer());
            assert_eq!(node.find_closest(b.id()).unwrap(), *b.peer());
        }
    }

    #[test]
    fn third_node_joins() {
        let a = Node::builder().start().unwrap();
        let b = Node::builder().start().unwrap();
        let c = Node::builder().start().unwrap();

        b.join(a.peer()).unwrap();
        c.join(b.peer()).unwrap();

        let members = topology::network_nodes(&a, a.peer()).unwrap();
        assert_eq!(members.len(), 3);

        for node in [&a, &b, &c] {
            let next = node.snapshot().next.unwrap();
            let links = a.sync(&next).unwrap();
            assert_eq!(links.prev.as_ref(), Some(node.peer()));
        }

        let key = Id::from_key("three");
        c.put(key, &"value").unwrap();
        assert_eq!(c.get::<String>(key).unwrap(), Some("value".to_string()));
        assert_eq!(a.get::<String>(key).unwrap(), Some("value".to_string()));
    }

    #[test]
    fn oversized_values_are_refused() {
        let node = Node::builder().start().unwrap();
        let key = Id::from_key("large");

        let value = serde_bytes::ByteBuf::from(vec![0u8; crate::conduit::MAX_FRAME_SIZE + 1]);

        assert!(matches!(
            node.put(key, &value),
            Err(Error::Frame(crate::conduit::FrameError::Oversized { .. }))
        ));

        // The pooled connection survived.
        let conduit = node.pool().get_or_create(&node.peer().address()).unwrap();
        assert!(!conduit.is_closed());
        assert_eq!(node.get::<String>(key).unwrap(), None);
    }

    #[test]
    fn stop_closes_an_owned_pool() {
        let mut node = Node::builder().start().unwrap();
        node.find_closest(&Id::random()).unwrap();
        assert_eq!(node.pool().len(), 1);

        node.stop();
        assert!(node.pool().is_closed());
        assert!(node.pool().is_empty());

        node.start().unwrap();
        assert!(!node.pool().is_closed());
        assert_eq!(node.find_closest(&Id::random()).unwrap(), *node.peer());
    }

    #[test]
    fn interval_membership() {
        assert!(encloses(&id(10), &id(20), &id(15)));
        assert!(encloses(&id(10), &id(20), &id(20)));
        assert!(!encloses(&id(10), &id(20), &id(10)));
        assert!(!encloses(&id(10), &id(20), &id(21)));

        // Wrapping interval.
        assert!(encloses(&id(200), &id(5), &id(201)));
        assert!(encloses(&id(200), &id(5), &id(0)));
        assert!(encloses(&id(200), &id(5), &id(5)));
        assert!(!encloses(&id(200), &id(5), &id(100)));

        // A ring of one encloses everything.
        assert!(encloses(&id(7), &id(7), &id(7)));
        assert!(encloses(&id(7), &id(7), &id(100)));
    }

    #[test]
    fn standalone_node() {
        let node = Node::builder().start().unwrap();

        let snapshot = node.snapshot();
        assert!(snapshot.prev.is_none());
        assert!(snapshot.next.is_none());
        assert_ne!(node.peer().port, 0);
        assert_eq!(*node.id(), Id::from_address("127.0.0.1", node.peer().port));

        let key = Id::random();
        let (prev, next) = node.find_enclosing_interval(node.peer(), &key).unwrap();
        assert_eq!(prev.node, *node.peer());
        assert_eq!(next.node, *node.peer());
        assert_eq!(node.find_closest(&key).unwrap(), *node.peer());
    }

    #[test]
    fn not_started() {
        let node = Node::builder().build().unwrap();

        assert!(!node.is_running());
        assert!(matches!(node.find_closest(&Id::random()), Err(Error::NotStarted)));
        assert!(matches!(
            node.put(Id::random(), &"v"),
            Err(Error::NotStarted)
        ));
    }

    #[test]
    fn start_twice() {
        let mut node = Node::builder().start().unwrap();

        assert!(matches!(node.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn restart_keeps_address() {
        let mut node = Node::builder().start().unwrap();
        let peer = node.peer().clone();

        node.stop();
        assert!(!node.is_running());

        node.start().unwrap();
        assert_eq!(node.peer().port, peer.port);
        assert_eq!(node.id(), &peer.id);
    }

    #[test]
    fn pull_and_push() {
        let a = Node::builder().start().unwrap();
        let b = Node::builder().start().unwrap();

        let mut links = a.sync(b.peer()).unwrap();
        assert_eq!(links.node, *b.peer());
        assert!(links.next.is_none());

        links.prev = Some(a.peer().clone());
        links.next = Some(a.peer().clone());
        a.push(&links).unwrap();

        let snapshot = b.snapshot();
        assert_eq!(snapshot.prev.as_ref(), Some(a.peer()));
        assert_eq!(snapshot.next.as_ref(), Some(a.peer()));
    }

    #[test]
    fn push_for_another_node_is_ignored() {
        let a = Node::builder().start().unwrap();
        let b = Node::builder().start().unwrap();

        let mut links = LinkSnapshot::new(PeerRef::with_id(
            &b.peer().hostname,
            b.peer().port,
            Id::random(),
        ));
        links.next = Some(a.peer().clone());
        a.push(&links).unwrap();

        assert!(b.snapshot().next.is_none());
    }

    #[test]
    fn two_node_ring() {
        let a = Node::builder().start().unwrap();
        let b = Node::builder().start().unwrap();

        b.join(a.peer()).unwrap();

        assert_eq!(a.snapshot().prev.as_ref(), Some(b.peer()));
        assert_eq!(a.snapshot().next.as_ref(), Some(b.peer()));
        assert_eq!(b.snapshot().prev.as_ref(), Some(a.peer()));
        assert_eq!(b.snapshot().next.as_ref(), Some(a.peer()));

        // Joining again changes nothing.
        b.join(a.peer()).unwrap();
        assert_eq!(a.snapshot().next.as_ref(), Some(b.peer()));
    }

    #[test]
    fn store_locally() {
        let node = Node::builder().start().unwrap();
        let key = Id::from_key("k");

        assert_eq!(node.get::<String>(key).unwrap(), None);

        node.put(key, &"v").unwrap();

        // The put is fire-and-forget, but the get follows it on the same connection.
        assert_eq!(node.get::<String>(key).unwrap(), Some("v".to_string()));
        assert_eq!(node.cached(&key), Some(Bytes::from_static(b"1:v")));
    }

    #[test]
    fn set_fingers_skips_self() {
        let node = Node::builder().start().unwrap();
        let other = PeerRef::new("127.0.0.1", 1);

        node.set_fingers([node.peer().clone(), other.clone()]);

        assert_eq!(node.snapshot().fingers, vec![other]);
    }

    #[test]
    fn resize_cache() {
        let node = Node::builder().start().unwrap();
        let key = Id::from_key("k");

        node.put(key, &"v").unwrap();
        assert!(node.get::<String>(key).unwrap().is_some());

        node.resize_cache(1024);

        assert!(node.cached(&key).is_none());
        assert_eq!(node.get::<String>(key).unwrap(), None);
    }
}
