//! IPv4 multicast group membership, for discovering peers on a local network.
//!
//! No delivery guarantees, and messages are truncated to [MAX_BYTES].

use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, trace};

use crate::Result;

/// Largest message a subscriber receives or a publisher sends.
pub const MAX_BYTES: usize = 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Joins the multicast group at `address` and calls `on_message` with every message
/// received, until the returned [Subscription] is closed or dropped.
///
/// The socket binds `address`'s port on every interface, so one process can only hold
/// one subscription per port.
pub fn join<F>(address: SocketAddrV4, on_message: F) -> Result<Subscription>
where
    F: Fn(&[u8]) + Send + 'static,
{
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, address.port()))?;
    socket.join_multicast_v4(address.ip(), &Ipv4Addr::UNSPECIFIED)?;

    debug!(?address, "Joined multicast group");

    subscribe(socket, on_message)
}

fn subscribe<F>(socket: UdpSocket, on_message: F) -> Result<Subscription>
where
    F: Fn(&[u8]) + Send + 'static,
{
    socket.set_read_timeout(Some(POLL_INTERVAL))?;

    let local_addr = socket.local_addr()?;
    let active = Arc::new(AtomicBool::new(true));

    let handle = {
        let active = active.clone();

        thread::Builder::new()
            .name(format!("Multicast on {local_addr}"))
            .spawn(move || {
                let mut buf = [0u8; MAX_BYTES];

                while active.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((amt, from)) => {
                            trace!(context = "multicast_receiving", ?from, size = amt);
                            on_message(&buf[..amt]);
                        }
                        Err(ref e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                            ) => {}
                        Err(error) => {
                            debug!(?error, "Cannot consume multicast packet");
                            thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
            })?
    };

    Ok(Subscription {
        active,
        handle: Some(handle),
    })
}

#[derive(Debug)]
/// Membership of a multicast group, see [join].
pub struct Subscription {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Leaves the group and stops the receiving thread.
    pub fn close(&mut self) {
        self.active.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close()
    }
}

#[derive(Debug)]
/// Sends messages to a multicast group.
pub struct Publisher {
    socket: UdpSocket,
    address: SocketAddrV4,
}

impl Publisher {
    pub fn new(address: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;

        Ok(Self { socket, address })
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Publishes `bytes`, truncated to [MAX_BYTES], returns the number of bytes sent.
    pub fn publish(&self, bytes: &[u8]) -> Result<usize> {
        let length = bytes.len().min(MAX_BYTES);

        Ok(self.socket.send_to(&bytes[..length], self.address)?)
    }
}
