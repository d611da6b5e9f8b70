//! Shared, address keyed cache of conduits with idle eviction.

use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::conduit::{Conduit, PendingResponse, TcpConduit};
use crate::Result;

/// Default idle duration after which an unused conduit is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default interval between two eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
/// Pool configurations
pub struct PoolConfig {
    /// A conduit unused for longer than this, and not held outside the pool, is closed.
    ///
    /// Defaults to [DEFAULT_IDLE_TIMEOUT]
    pub idle_timeout: Duration,
    /// How often idle conduits are looked for.
    ///
    /// Defaults to [DEFAULT_SWEEP_INTERVAL]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Opens conduits to `hostname:port` addresses.
pub trait ConduitFactory: Send + Sync + 'static {
    fn connect(&self, address: &str) -> Result<Arc<dyn Conduit>>;
}

impl<F> ConduitFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Conduit>> + Send + Sync + 'static,
{
    fn connect(&self, address: &str) -> Result<Arc<dyn Conduit>> {
        self(address)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Opens [TcpConduit]s.
pub struct TcpConduitFactory;

impl ConduitFactory for TcpConduitFactory {
    fn connect(&self, address: &str) -> Result<Arc<dyn Conduit>> {
        Ok(Arc::new(TcpConduit::connect(address)?))
    }
}

/// A conduit owned by a [ConduitPool].
///
/// Every use marks it as recently used. Closing it through this handle is a no-op,
/// the pool decides when the underlying connection goes away.
pub struct PooledConduit {
    address: String,
    conduit: Arc<dyn Conduit>,
    last_used: Mutex<Instant>,
}

impl PooledConduit {
    fn new(address: &str, conduit: Arc<dyn Conduit>) -> Self {
        Self {
            address: address.to_string(),
            conduit,
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// The pool key this conduit was created for.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The underlying conduit.
    pub fn inner(&self) -> &Arc<dyn Conduit> {
        &self.conduit
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| last_used.elapsed())
            .unwrap_or_default()
    }
}

impl Debug for PooledConduit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConduit")
            .field("address", &self.address)
            .field("conduit", &self.conduit)
            .finish()
    }
}

impl Conduit for PooledConduit {
    fn remote(&self) -> SocketAddr {
        self.conduit.remote()
    }

    fn send(&self, payload: Bytes) -> Result<()> {
        self.touch();
        self.conduit.send(payload)
    }

    fn request(&self, payload: Bytes) -> Result<PendingResponse> {
        self.touch();
        self.conduit.request(payload)
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        self.conduit.is_closed()
    }
}

struct PoolInner {
    factory: Box<dyn ConduitFactory>,
    entries: DashMap<String, Arc<PooledConduit>>,
    config: PoolConfig,
}

impl PoolInner {
    /// Removes, then closes, conduits that are broken, or idle and held by nobody else.
    fn evict(&self) -> usize {
        let mut evicted = Vec::new();

        // `retain` holds the shard lock, so no caller can clone an entry between
        // the reference count check and the removal.
        self.entries.retain(|_, conduit| {
            let idle = Arc::strong_count(conduit) == 1
                && conduit.idle_for() > self.config.idle_timeout;

            if idle || conduit.is_closed() {
                evicted.push(conduit.clone());
                false
            } else {
                true
            }
        });

        for conduit in &evicted {
            debug!(address = %conduit.address, "Evicting conduit");
            conduit.conduit.close();
        }

        evicted.len()
    }

    fn close(&self) {
        let addresses: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        for address in addresses {
            if let Some((_, conduit)) = self.entries.remove(&address) {
                conduit.conduit.close();
            }
        }
    }
}

/// Reuses one conduit per address, across every caller sharing the pool.
pub struct ConduitPool {
    inner: Arc<PoolInner>,
    evictor: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl ConduitPool {
    /// Creates a pool and starts its eviction thread.
    pub fn new<F: ConduitFactory>(factory: F, config: PoolConfig) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            factory: Box::new(factory),
            entries: DashMap::new(),
            config,
        });

        let (stop, stopped) = flume::bounded::<()>(1);

        let evictor = {
            let inner = inner.clone();
            let sweep_interval = inner.config.sweep_interval;

            thread::Builder::new()
                .name("Conduit evictor".to_string())
                .spawn(move || loop {
                    match stopped.recv_timeout(sweep_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let evicted = inner.evict();
                            if evicted > 0 {
                                trace!(context = "pool_sweep", evicted, "Swept idle conduits");
                            }
                        }
                        // Stop requested, or the pool was dropped.
                        _ => break,
                    }
                })?
        };

        Ok(Self {
            inner,
            evictor: Mutex::new(Some((stop, evictor))),
        })
    }

    /// A pool of [TcpConduit]s.
    pub fn tcp(config: PoolConfig) -> Result<Self> {
        Self::new(TcpConduitFactory, config)
    }

    /// Returns the open conduit for `address`, creating it if there is none or the
    /// existing one is broken.
    pub fn get_or_create(&self, address: &str) -> Result<Arc<PooledConduit>> {
        if let Some(existing) = self.inner.entries.get(address) {
            if !existing.is_closed() {
                existing.touch();
                return Ok(existing.clone());
            }
        }

        // Connect without holding any lock.
        let conduit = self.inner.factory.connect(address)?;
        let fresh = Arc::new(PooledConduit::new(address, conduit));

        match self.inner.entries.entry(address.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    trace!(context = "pool_replace", address, "Replacing broken conduit");
                    let broken = entry.insert(fresh.clone());
                    broken.conduit.close();

                    Ok(fresh)
                } else {
                    // Someone else connected first, keep theirs.
                    fresh.conduit.close();
                    entry.get().touch();

                    Ok(entry.get().clone())
                }
            }
            Entry::Vacant(entry) => {
                trace!(context = "pool_create", address, "New conduit");
                entry.insert(fresh.clone());

                Ok(fresh)
            }
        }
    }

    /// Number of pooled conduits.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.entries.contains_key(address)
    }

    /// Runs an eviction sweep now, returns the number of closed conduits.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether [Self::close] was called, the evictor no longer runs.
    pub fn is_closed(&self) -> bool {
        self.evictor
            .lock()
            .map(|evictor| evictor.is_none())
            .unwrap_or(true)
    }

    /// Closes and forgets every conduit, the pool stays usable.
    pub fn clear(&self) {
        self.inner.close();
    }

    /// Stops the evictor and closes every conduit.
    pub fn close(&self) {
        let evictor = self.evictor.lock().ok().and_then(|mut e| e.take());

        if let Some((stop, handle)) = evictor {
            let _ = stop.send(());
            let _ = handle.join();
        }

        self.inner.close();
    }
}

impl Debug for ConduitPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConduitPool")
            .field("conduits", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Drop for ConduitPool {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::conduit::{Handler, Inbound, TcpServer};

    fn echo_server() -> TcpServer {
        let handler: Arc<dyn Handler> =
            Arc::new(|inbound: Inbound| Some(inbound.frame.payload));

        TcpServer::bind("127.0.0.1:0", handler).unwrap()
    }

    fn quick() -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn reuse() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(PoolConfig::default()).unwrap();

        let first = pool.get_or_create(&address).unwrap();
        let second = pool.get_or_create(&address).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);

        let reply = second
            .request(Bytes::from_static(b"ping"))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    #[test]
    fn idle_conduits_are_evicted() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(quick()).unwrap();

        let first = pool.get_or_create(&address).unwrap();
        let weak = Arc::downgrade(&first);
        let underlying = first.inner().clone();
        drop(first);

        thread::sleep(Duration::from_millis(300));

        assert!(weak.upgrade().is_none());
        assert!(underlying.is_closed());
        assert!(!pool.contains(&address));

        let second = pool.get_or_create(&address).unwrap();
        assert!(!Arc::ptr_eq(second.inner(), &underlying));
        assert!(!second.is_closed());
    }

    #[test]
    fn held_conduits_survive_the_idle_window() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(quick()).unwrap();

        let held = pool.get_or_create(&address).unwrap();
        thread::sleep(Duration::from_millis(300));

        assert!(!held.is_closed());
        assert!(Arc::ptr_eq(&held, &pool.get_or_create(&address).unwrap()));
    }

    #[test]
    fn broken_conduits_are_replaced() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(PoolConfig::default()).unwrap();

        let first = pool.get_or_create(&address).unwrap();
        first.inner().close();

        let second = pool.get_or_create(&address).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pooled_close_is_a_no_op() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(PoolConfig::default()).unwrap();

        let conduit = pool.get_or_create(&address).unwrap();
        conduit.close();

        assert!(!conduit.is_closed());
    }

    #[test]
    fn custom_factory() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let connects = Arc::new(AtomicUsize::new(0));

        let counter = connects.clone();
        let pool = ConduitPool::new(
            move |address: &str| -> Result<Arc<dyn Conduit>> {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(TcpConduit::connect(address)?))
            },
            PoolConfig::default(),
        )
        .unwrap();

        for _ in 0..5 {
            pool.get_or_create(&address).unwrap();
        }

        assert_eq!(connects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn close_closes_everything() {
        let server = echo_server();
        let address = server.local_addr().to_string();
        let pool = ConduitPool::tcp(PoolConfig::default()).unwrap();

        let conduit = pool.get_or_create(&address).unwrap();
        assert!(!pool.is_closed());
        pool.close();

        assert!(conduit.is_closed());
        assert!(pool.is_empty());
        assert!(pool.is_closed());
    }

    #[test]
    fn unreachable_address() {
        let pool = ConduitPool::tcp(PoolConfig::default()).unwrap();

        // Bind then drop, so nothing listens on the port.
        let address = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();

        assert!(pool.get_or_create(&address).is_err());
        assert!(pool.is_empty());
    }
}
