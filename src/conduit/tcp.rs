//! Stream transport: one reader thread per connection, replies correlated by frame id.

use std::{
    collections::HashMap,
    io::{ErrorKind, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    Conduit, Frame, FrameError, Frames, Handler, Inbound, Pending, PendingResponse,
    MAX_FRAME_SIZE, MAX_THREAD_BLOCK_DURATION,
};
use crate::{Error, Result};

#[derive(Debug)]
/// Client side of a TCP connection.
pub struct TcpConduit {
    remote: SocketAddr,
    writer: Mutex<TcpStream>,
    pending: Arc<Pending>,
}

impl TcpConduit {
    /// Opens a connection and starts reading replies off it.
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;

        let remote = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let pending = Arc::new(Pending::default());

        let cloned = pending.clone();
        thread::Builder::new()
            .name(format!("Conduit to {remote}"))
            .spawn(move || read_replies(reader, remote, cloned))?;

        trace!(context = "conduit_connect", ?remote, "Connected");

        Ok(Self {
            remote,
            writer: Mutex::new(stream),
            pending,
        })
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn write(&self, frame: &Frame) -> Result<()> {
        if self.pending.is_closed() {
            return Err(Error::ConduitClosed);
        }

        // The receiver would drop the whole connection over it.
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized {
                length: frame.payload.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut stream = self.writer.lock().map_err(|_| Error::ConduitClosed)?;

        if let Err(error) = stream.write_all(&frame.encode()) {
            debug!(?error, remote = ?self.remote, "Error writing frame, closing conduit");

            let _ = stream.shutdown(Shutdown::Both);
            self.pending.fail_all();

            return Err(error.into());
        }

        Ok(())
    }
}

impl Conduit for TcpConduit {
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
        let was_open = !self.pending.is_closed();

        self.pending.fail_all();

        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        if was_open {
            trace!(context = "conduit_close", remote = ?self.remote, "Closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }
}

impl Drop for TcpConduit {
    fn drop(&mut self) {
        self.close()
    }
}

fn read_replies(stream: TcpStream, remote: SocketAddr, pending: Arc<Pending>) {
    for frame in Frames::new(&stream) {
        match frame {
            Ok(frame) => {
                let id = frame.id;
                if !pending.complete(frame) {
                    trace!(context = "conduit_reply", ?remote, id, "Reply to unknown request");
                }
            }
            Err(error) => {
                debug!(?error, ?remote, "Broken transfer");
                break;
            }
        }
    }

    pending.fail_all();
    let _ = stream.shutdown(Shutdown::Both);
}

/// Accepts connections and runs a [Handler] over every frame they carry.
///
/// Frames of one connection are handled in order, on a thread of their own.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    accept_loop: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn bind<A: ToSocketAddrs>(address: A, handler: Arc<dyn Handler>) -> Result<Self> {
        Self::from_listener(TcpListener::bind(address)?, handler)
    }

    /// Serves an already bound listener.
    pub fn from_listener(listener: TcpListener, handler: Arc<dyn Handler>) -> Result<Self> {
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Arc<Mutex<HashMap<u64, TcpStream>>> = Default::default();

        let accept_loop = {
            let shutdown = shutdown.clone();
            let connections = connections.clone();

            thread::Builder::new()
                .name(format!("Server on {local_addr}"))
                .spawn(move || accept(listener, local_addr, handler, shutdown, connections))?
        };

        debug!(?local_addr, "Listening");

        Ok(Self {
            local_addr,
            shutdown,
            connections,
            accept_loop: Some(accept_loop),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open inbound connections.
    pub fn connections(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Stops accepting and drops every open connection.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.join();
        } else {
            return;
        }

        if let Ok(mut connections) = self.connections.lock() {
            for (_, stream) in connections.drain() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        debug!(local_addr = ?self.local_addr, "Stopped listening");
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close()
    }
}

fn accept(
    listener: TcpListener,
    receiver: SocketAddr,
    handler: Arc<dyn Handler>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
) {
    let mut next_connection: u64 = 0;

    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, sender)) => {
                let connection = next_connection;
                next_connection = next_connection.wrapping_add(1);

                let registered = stream
                    .set_nonblocking(false)
                    .and_then(|_| stream.set_nodelay(true))
                    .and_then(|_| stream.try_clone())
                    .and_then(|clone| {
                        if let Ok(mut connections) = connections.lock() {
                            connections.insert(connection, clone);
                        }
                        Ok(())
                    });

                if let Err(error) = registered {
                    debug!(?error, ?sender, "Error setting up connection");
                    continue;
                }

                trace!(context = "server_accept", ?sender, "Accepted connection");

                let handler = handler.clone();
                let connections = connections.clone();

                let spawned = thread::Builder::new()
                    .name(format!("Connection from {sender}"))
                    .spawn(move || {
                        serve(stream, sender, receiver, handler);

                        if let Ok(mut connections) = connections.lock() {
                            connections.remove(&connection);
                        }
                    });

                if let Err(error) = spawned {
                    debug!(?error, ?sender, "Error spawning connection thread");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(error) => {
                debug!(?error, "Error accepting connection");
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
        }
    }
}

fn serve(stream: TcpStream, sender: SocketAddr, receiver: SocketAddr, handler: Arc<dyn Handler>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(error) => {
            debug!(?error, ?sender, "Error cloning connection");
            return;
        }
    };

    for frame in Frames::new(stream) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                debug!(?error, ?sender, "Dropping connection");
                break;
            }
        };

        let id = frame.id;
        let expects_reply = frame.expects_reply();

        let reply = handler.handle(Inbound {
            frame,
            sender,
            receiver,
        });

        if let (true, Some(reply)) = (expects_reply, reply) {
            if let Err(error) = writer.write_all(&Frame::new(id, reply).encode()) {
                debug!(?error, ?sender, "Error writing reply");
                break;
            }
        }
    }

    let _ = writer.shutdown(Shutdown::Both);
    trace!(context = "server_disconnect", ?sender, "Connection closed");
}
