//! Datagram transport: one frame per datagram.

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    Conduit, Frame, FrameError, Handler, Inbound, Pending, PendingResponse, FRAME_HEADER_SIZE,
    MAX_DATAGRAM_SIZE,
};
use crate::{Error, Result};

/// How long a receive loop blocks before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
/// Client side of a UDP "connection", a socket connected to one remote address.
pub struct UdpConduit {
    remote: SocketAddr,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    pending: Arc<Pending>,
}

impl UdpConduit {
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let remote = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::from(ErrorKind::AddrNotAvailable))?;

        let unspecified: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(unspecified)?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let pending = Arc::new(Pending::default());

        {
            let socket = socket.clone();
            let pending = pending.clone();

            thread::Builder::new()
                .name(format!("Udp conduit to {remote}"))
                .spawn(move || read_replies(&socket, remote, &pending))?;
        }

        Ok(Self {
            remote,
            local_addr,
            socket,
            pending,
        })
    }

    /// Local address replies come back to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn write(&self, frame: &Frame) -> Result<()> {
        if self.pending.is_closed() {
            return Err(Error::ConduitClosed);
        }

        if frame.encoded_len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Oversized {
                length: frame.payload.len(),
                max: MAX_DATAGRAM_SIZE - FRAME_HEADER_SIZE,
            }
            .into());
        }

        self.socket.send(&frame.encode())?;

        Ok(())
    }
}

impl Conduit for UdpConduit {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn send(&self, payload: Bytes) -> Result<()> {
        self.write(&Frame::one_way(payload))
    }

    fn request(&self, payload: Bytes) -> Result<PendingResponse> {
        let (id, response) = self.pending.register()?;

        if let Err(error) = self.write(&Frame::new(id, payload)) {
            self.pending.cancel(id);
            return Err(error);
        }

        Ok(response)
    }

    fn close(&self) {
        self.pending.fail_all();
    }

    fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }
}

impl Drop for UdpConduit {
    fn drop(&mut self) {
        self.close()
    }
}

fn read_replies(socket: &UdpSocket, remote: SocketAddr, pending: &Pending) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while !pending.is_closed() {
        match socket.recv(&mut buf) {
            Ok(amt) => {
                let Some(frame) = Frame::from_datagram(&buf[..amt]) else {
                    continue;
                };

                let id = frame.id;
                if !pending.complete(frame) {
                    trace!(context = "conduit_reply", ?remote, id, "Reply to unknown request");
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            // An ICMP error from an earlier datagram, the socket is still usable.
            Err(ref e) if e.kind() == ErrorKind::ConnectionRefused => {
                trace!(context = "conduit_reply", ?remote, "Connection refused");
            }
            Err(error) => {
                debug!(?error, ?remote, "Error receiving datagram");
                break;
            }
        }
    }

    pending.fail_all();
}

/// Runs a [Handler] over every valid datagram received on a socket, replying to its sender.
#[derive(Debug)]
pub struct UdpServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    receive_loop: Option<JoinHandle<()>>,
}

impl UdpServer {
    pub fn bind<A: ToSocketAddrs>(address: A, handler: Arc<dyn Handler>) -> Result<Self> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let local_addr = socket.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let receive_loop = {
            let shutdown = shutdown.clone();

            thread::Builder::new()
                .name(format!("Udp server on {local_addr}"))
                .spawn(move || serve(socket, local_addr, handler, shutdown))?
        };

        debug!(?local_addr, "Listening for datagrams");

        Ok(Self {
            local_addr,
            shutdown,
            receive_loop: Some(receive_loop),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.receive_loop.take() {
            let _ = handle.join();
            debug!(local_addr = ?self.local_addr, "Stopped listening for datagrams");
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close()
    }
}

fn serve(
    socket: UdpSocket,
    receiver: SocketAddr,
    handler: Arc<dyn Handler>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while !shutdown.load(Ordering::Acquire) {
        let (amt, sender) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionRefused
                ) =>
            {
                continue
            }
            Err(error) => {
                debug!(?error, "Error receiving datagram");
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let Some(frame) = Frame::from_datagram(&buf[..amt]) else {
            continue;
        };

        let id = frame.id;
        let expects_reply = frame.expects_reply();

        let reply = handler.handle(Inbound {
            frame,
            sender,
            receiver,
        });

        if let (true, Some(reply)) = (expects_reply, reply) {
            let reply = Frame::new(id, reply);

            if reply.encoded_len() > MAX_DATAGRAM_SIZE {
                debug!(?sender, size = reply.encoded_len(), "Reply exceeds datagram size");
                continue;
            }

            if let Err(error) = socket.send_to(&reply.encode(), sender) {
                debug!(?error, ?sender, "Error sending reply");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_reply() {
        let server = UdpServer::bind(
            "127.0.0.1:0",
            Arc::new(|inbound: Inbound| {
                let mut reply = inbound.frame.payload.to_vec();
                reply.reverse();
                Some(Bytes::from(reply))
            }),
        )
        .unwrap();

        let conduit = UdpConduit::connect(server.local_addr()).unwrap();

        let reply = conduit
            .request(Bytes::from_static(b"abc"))
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();

        assert_eq!(&reply[..], b"cba");
    }

    #[test]
    fn sender_and_receiver() {
        let (tx, rx) = flume::unbounded();
        let server = UdpServer::bind(
            "127.0.0.1:0",
            Arc::new(move |inbound: Inbound| -> Option<Bytes> {
                let _ = tx.send((inbound.sender, inbound.receiver));
                None
            }),
        )
        .unwrap();

        let conduit = UdpConduit::connect(server.local_addr()).unwrap();
        conduit.send(Bytes::from_static(b"hi")).unwrap();

        let (sender, receiver) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(sender.port(), conduit.local_addr().port());
        assert_eq!(receiver, server.local_addr());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let silent: Arc<dyn Handler> = Arc::new(|_: Inbound| -> Option<Bytes> { None });
        let server = UdpServer::bind("127.0.0.1:0", silent).unwrap();
        let conduit = UdpConduit::connect(server.local_addr()).unwrap();

        let result = conduit.send(vec![0u8; MAX_DATAGRAM_SIZE].into());

        assert!(matches!(result, Err(Error::Frame(_))));
    }

    #[test]
    fn close_fails_pending_requests() {
        let silent: Arc<dyn Handler> = Arc::new(|_: Inbound| -> Option<Bytes> { None });
        let server = UdpServer::bind("127.0.0.1:0", silent).unwrap();
        let conduit = UdpConduit::connect(server.local_addr()).unwrap();

        let response = conduit.request(Bytes::from_static(b"unanswered")).unwrap();
        conduit.close();

        assert!(matches!(response.wait(), Err(Error::BrokenTransfer)));
    }
}
