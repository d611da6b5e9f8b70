//! Address of a ring member.
use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use crate::common::Id;
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Immutable reference to a ring member: where it listens and where it sits on the ring.
///
/// Equality, hashing and ordering only look at the [Id].
pub struct PeerRef {
    pub hostname: String,
    pub port: u16,
    pub id: Id,
}

impl PeerRef {
    /// Creates a PeerRef, deriving its Id from the address.
    pub fn new(hostname: &str, port: u16) -> PeerRef {
        PeerRef {
            hostname: hostname.to_string(),
            port,
            id: Id::from_address(hostname, port),
        }
    }

    /// Creates a PeerRef with an Id that was already computed by its owner.
    pub fn with_id(hostname: &str, port: u16, id: Id) -> PeerRef {
        PeerRef {
            hostname: hostname.to_string(),
            port,
            id,
        }
    }

    /// `hostname:port`, the key of this peer's conduit in a [crate::ConduitPool].
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Returns whichever of `a` and `b` is numerically closer to `target`, `b` on ties.
    pub fn closest_between<'a>(target: &Id, a: &'a PeerRef, b: &'a PeerRef) -> &'a PeerRef {
        if target.abs_diff(&a.id) < target.abs_diff(&b.id) {
            a
        } else {
            b
        }
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerRef {}

impl Hash for PeerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for PeerRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Display for PeerRef {
    /// The `hostname:port:id` link form carried in ring snapshots.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.port, self.id)
    }
}

impl FromStr for PeerRef {
    type Err = Error;

    fn from_str(link: &str) -> Result<PeerRef> {
        let invalid = || Error::InvalidLink(link.to_string());

        // Split from the right, hostnames may be IPv6 literals.
        let mut parts = link.rsplitn(3, ':');

        let id = parts.next().ok_or_else(invalid)?;
        let port = parts.next().ok_or_else(invalid)?;
        let hostname = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

        Ok(PeerRef {
            hostname: hostname.to_string(),
            port: port.parse().map_err(|_| invalid())?,
            id: id.parse().map_err(|_| invalid())?,
        })
    }
}
