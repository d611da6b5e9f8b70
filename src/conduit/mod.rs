//! Framed request/response transports.
//!
//! A [Conduit] is the client side of a connection to one remote endpoint, a [Handler]
//! is what a server runs for every inbound [Frame].

mod frame;
mod tcp;
mod udp;

use std::{
    fmt::Debug,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use flume::{Receiver, RecvTimeoutError, Sender};

use crate::{Error, Result};

pub use frame::{
    Frame, FrameCodec, FrameError, Frames, FRAME_HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_FRAME_SIZE,
    NO_REPLY,
};
pub use tcp::{TcpConduit, TcpServer};
pub use udp::{UdpConduit, UdpServer};

/// The maximum duration to block a polling thread before checking for shutdown.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Client side of a framed connection.
pub trait Conduit: Debug + Send + Sync {
    /// Address of the remote endpoint.
    fn remote(&self) -> SocketAddr;

    /// Sends a one-way frame, the receiver never replies to it.
    fn send(&self, payload: Bytes) -> Result<()>;

    /// Sends a frame under a fresh correlation id and returns the pending reply.
    fn request(&self, payload: Bytes) -> Result<PendingResponse>;

    /// Closes the connection, failing every pending reply with [Error::BrokenTransfer].
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone)]
/// A frame received by a server.
pub struct Inbound {
    pub frame: Frame,
    /// Address of the remote peer.
    pub sender: SocketAddr,
    /// Local address the frame arrived on.
    pub receiver: SocketAddr,
}

/// Server side request handler.
///
/// The returned payload is written back under the inbound frame's id, unless that id
/// is [NO_REPLY].
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, inbound: Inbound) -> Option<Bytes>;
}

impl<F> Handler for F
where
    F: Fn(Inbound) -> Option<Bytes> + Send + Sync + 'static,
{
    fn handle(&self, inbound: Inbound) -> Option<Bytes> {
        self(inbound)
    }
}

/// Reply slots of requests in flight on one conduit.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    next_id: AtomicI32,
    slots: DashMap<i32, Sender<Result<Bytes>>>,
    closed: AtomicBool,
}

impl Pending {
    /// Allocates a correlation id and its reply slot.
    pub(crate) fn register(self: &Arc<Self>) -> Result<(i32, PendingResponse)> {
        if self.is_closed() {
            return Err(Error::ConduitClosed);
        }

        // Never negative, so never NO_REPLY.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        let (sender, receiver) = flume::bounded(1);

        self.slots.insert(id, sender);

        // Closed in between, the slot would never be failed.
        if self.is_closed() {
            self.slots.remove(&id);
            return Err(Error::ConduitClosed);
        }

        Ok((
            id,
            PendingResponse {
                id,
                receiver,
                pending: self.clone(),
            },
        ))
    }

    /// Completes the slot matching the frame's id, returns false for unknown ids.
    pub(crate) fn complete(&self, frame: Frame) -> bool {
        match self.slots.remove(&frame.id) {
            Some((_, sender)) => {
                let _ = sender.send(Ok(frame.payload));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&self, id: i32) {
        self.slots.remove(&id);
    }

    /// Marks the conduit closed and fails every outstanding slot.
    pub(crate) fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<i32> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.slots.remove(&id) {
                let _ = sender.send(Err(Error::BrokenTransfer));
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug)]
/// Reply to a [Conduit::request], completed by the conduit's reader.
pub struct PendingResponse {
    id: i32,
    receiver: Receiver<Result<Bytes>>,
    pending: Arc<Pending>,
}

impl PendingResponse {
    /// Correlation id the request was sent with.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Blocks until the reply arrives or the conduit breaks.
    pub fn wait(self) -> Result<Bytes> {
        match self.receiver.recv() {
            Ok(reply) => reply,
            Err(_) => Err(Error::BrokenTransfer),
        }
    }

    /// Like [Self::wait], giving up with [Error::Timeout] after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Bytes> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.pending.cancel(self.id);
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::BrokenTransfer),
        }
    }

    #[cfg(feature = "async")]
    /// Awaits the reply without blocking a thread.
    pub async fn wait_async(self) -> Result<Bytes> {
        match self.receiver.recv_async().await {
            Ok(reply) => reply,
            Err(_) => Err(Error::BrokenTransfer),
        }
    }
}
