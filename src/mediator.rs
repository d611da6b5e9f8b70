//! UDP hole punching rendezvous: a broker of ports peers announced themselves on.
//!
//! Peers send `HELLO` from the socket they want to be reachable on, the mediator records
//! the sender's host and port. Other peers then ask for a port of that host with
//! `REQUEST_PORT`, each recorded port is handed out once, and `FREE_PORT` gives one back.

use std::{
    collections::{HashMap, VecDeque},
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    conduit::{Conduit, Handler, Inbound, UdpServer},
    Error, Result,
};

/// How long the client helpers wait for the mediator to answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

const HELLO: &str = "hello";
const REQUEST_PORT: &str = "request_port";
const FREE_PORT: &str = "free_port";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorMessage {
    /// Records the sender's address.
    Hello,
    /// Asks for one recorded port of `hostname`.
    RequestPort { hostname: String },
    /// Returns `port` to the ports available for `hostname`.
    FreePort { hostname: String, port: u16 },
}

#[derive(Serialize, Deserialize, Debug)]
struct SerdeMediatorMessage {
    #[serde(rename = "y")]
    kind: String,

    #[serde(default)]
    #[serde(rename = "h", skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,

    #[serde(default)]
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

impl MediatorMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let message = match self {
            MediatorMessage::Hello => SerdeMediatorMessage {
                kind: HELLO.to_string(),
                hostname: None,
                port: None,
            },
            MediatorMessage::RequestPort { hostname } => SerdeMediatorMessage {
                kind: REQUEST_PORT.to_string(),
                hostname: Some(hostname.clone()),
                port: None,
            },
            MediatorMessage::FreePort { hostname, port } => SerdeMediatorMessage {
                kind: FREE_PORT.to_string(),
                hostname: Some(hostname.clone()),
                port: Some(*port),
            },
        };

        Ok(serde_bencode::to_bytes(&message)?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<MediatorMessage> {
        let message: SerdeMediatorMessage = serde_bencode::from_bytes(bytes.as_ref())?;

        let missing = |field: &str| {
            Error::BencodeError(serde_bencode::Error::MissingField(field.to_string()))
        };

        Ok(match message.kind.as_str() {
            HELLO => MediatorMessage::Hello,
            REQUEST_PORT => MediatorMessage::RequestPort {
                hostname: message.hostname.ok_or_else(|| missing("h"))?,
            },
            FREE_PORT => MediatorMessage::FreePort {
                hostname: message.hostname.ok_or_else(|| missing("h"))?,
                port: message.port.ok_or_else(|| missing("p"))?,
            },
            other => {
                return Err(Error::BencodeError(serde_bencode::Error::Custom(format!(
                    "unknown mediator message {other:?}"
                ))))
            }
        })
    }
}

#[derive(Debug, Default)]
/// Hostname to available ports, oldest first.
struct PortBroker {
    ports: Mutex<HashMap<String, VecDeque<u16>>>,
}

impl PortBroker {
    fn record(&self, hostname: &str, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hostname.to_string())
            .or_default()
            .push_back(port);
    }

    fn take(&self, hostname: &str) -> Option<u16> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(hostname)
            .and_then(VecDeque::pop_front)
    }

    fn available(&self, hostname: &str) -> Vec<u16> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Handler for PortBroker {
    fn handle(&self, inbound: Inbound) -> Option<Bytes> {
        let sender = inbound.sender;

        let message = match MediatorMessage::from_bytes(&inbound.frame.payload) {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, ?sender, "Received invalid mediator message");
                return None;
            }
        };

        trace!(context = "mediator_message_receiving", ?message, ?sender);

        match message {
            MediatorMessage::Hello => {
                self.record(&sender.ip().to_string(), sender.port());
                Some(Bytes::new())
            }
            MediatorMessage::RequestPort { hostname } => match self.take(&hostname) {
                Some(port) => match serde_bencode::to_bytes(&port) {
                    Ok(bytes) => Some(bytes.into()),
                    Err(error) => {
                        debug!(?error, "Error encoding port");
                        Some(Bytes::new())
                    }
                },
                None => Some(Bytes::new()),
            },
            MediatorMessage::FreePort { hostname, port } => {
                self.record(&hostname, port);
                Some(Bytes::new())
            }
        }
    }
}

/// A running mediator.
#[derive(Debug)]
pub struct Mediator {
    server: UdpServer,
    broker: Arc<PortBroker>,
}

impl Mediator {
    pub fn bind<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let broker = Arc::new(PortBroker::default());
        let server = UdpServer::bind(address, broker.clone())?;

        Ok(Self { server, broker })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Ports currently recorded for `hostname`, oldest first.
    pub fn available(&self, hostname: &str) -> Vec<u16> {
        self.broker.available(hostname)
    }

    pub fn close(&mut self) {
        self.server.close()
    }
}

fn exchange(conduit: &dyn Conduit, message: &MediatorMessage) -> Result<Bytes> {
    conduit
        .request(message.to_bytes()?.into())?
        .wait_timeout(DEFAULT_REQUEST_TIMEOUT)
}

/// Announces the conduit's local address to the mediator on the other end.
pub fn hello(conduit: &dyn Conduit) -> Result<()> {
    exchange(conduit, &MediatorMessage::Hello)?;

    Ok(())
}

/// Takes one announced port of `hostname`, if any is left.
pub fn request_port(conduit: &dyn Conduit, hostname: &str) -> Result<Option<u16>> {
    let reply = exchange(
        conduit,
        &MediatorMessage::RequestPort {
            hostname: hostname.to_string(),
        },
    )?;

    if reply.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_bencode::from_bytes(&reply)?))
}

/// Makes `port` of `hostname` available again.
pub fn free_port(conduit: &dyn Conduit, hostname: &str, port: u16) -> Result<()> {
    exchange(
        conduit,
        &MediatorMessage::FreePort {
            hostname: hostname.to_string(),
            port,
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conduit::UdpConduit;

    #[test]
    fn messages() {
        for message in [
            MediatorMessage::Hello,
            MediatorMessage::RequestPort {
                hostname: "10.0.0.1".to_string(),
            },
            MediatorMessage::FreePort {
                hostname: "10.0.0.1".to_string(),
                port: 6881,
            },
        ] {
            let parsed = MediatorMessage::from_bytes(message.to_bytes().unwrap()).unwrap();
            assert_eq!(parsed, message);
        }

        assert!(MediatorMessage::from_bytes(b"d1:y12:request_porte").is_err());
    }

    #[test]
    fn brokers_announced_ports() {
        let mediator = Mediator::bind("127.0.0.1:0").unwrap();

        let c1 = UdpConduit::connect(mediator.local_addr()).unwrap();
        let c2 = UdpConduit::connect(mediator.local_addr()).unwrap();

        hello(&c1).unwrap();
        hello(&c2).unwrap();

        let p1 = request_port(&c1, "127.0.0.1").unwrap();
        let p2 = request_port(&c2, "127.0.0.1").unwrap();

        assert!(p1.is_some());
        assert!(p2.is_some());
        assert_ne!(p1, p2);

        let mut announced = vec![c1.local_addr().port(), c2.local_addr().port()];
        let mut handed_out = vec![p1.unwrap(), p2.unwrap()];
        announced.sort();
        handed_out.sort();
        assert_eq!(announced, handed_out);

        // Every announced port was handed out once.
        assert_eq!(request_port(&c1, "127.0.0.1").unwrap(), None);

        free_port(&c1, "127.0.0.1", 4000).unwrap();
        assert_eq!(mediator.available("127.0.0.1"), vec![4000]);
        assert_eq!(request_port(&c2, "127.0.0.1").unwrap(), Some(4000));
    }

    #[test]
    fn unknown_host() {
        let mediator = Mediator::bind("127.0.0.1:0").unwrap();
        let conduit = UdpConduit::connect(mediator.local_addr()).unwrap();

        assert_eq!(request_port(&conduit, "10.9.9.9").unwrap(), None);
    }
}
