//! Serialize and deserialize ring messages.
//!
//! A [Message] is the application payload carried inside a [crate::conduit::Frame].

mod internal;

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::common::{Id, PeerRef};
use crate::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    /// Pulls the remote authoritative links into the requester's view.
    SyncPull,
    /// Pushes a link snapshot into the authoritative node it describes.
    SyncPush(LinkSnapshot),
    /// Stores a value in the receiver's local cache.
    Put { key: Id, value: Bytes },
    /// Reads a value from the receiver's local cache.
    Get { key: Id },
}

#[derive(Debug, PartialEq, Clone)]
/// A point in time view of a node's ring links.
pub struct LinkSnapshot {
    pub node: PeerRef,
    pub prev: Option<PeerRef>,
    pub next: Option<PeerRef>,
    pub fingers: Vec<PeerRef>,
}

impl LinkSnapshot {
    /// Snapshot of a node with no links, what a standalone node looks like.
    pub fn new(node: PeerRef) -> Self {
        Self {
            node,
            prev: None,
            next: None,
            fingers: Vec::new(),
        }
    }

    pub fn id(&self) -> &Id {
        &self.node.id
    }

    /// Greatest finger whose Id is `<= target`.
    pub fn floor_finger(&self, target: &Id) -> Option<&PeerRef> {
        self.fingers
            .iter()
            .filter(|finger| finger.id <= *target)
            .max_by(|a, b| a.id.cmp(&b.id))
    }

    /// Smallest finger whose Id is `>= target`.
    pub fn ceiling_finger(&self, target: &Id) -> Option<&PeerRef> {
        self.fingers
            .iter()
            .filter(|finger| finger.id >= *target)
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Fingers keyed and sorted by Id, duplicates collapsed.
    pub fn finger_table(&self) -> BTreeMap<Id, PeerRef> {
        self.fingers
            .iter()
            .map(|finger| (finger.id, finger.clone()))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_serde_links().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<LinkSnapshot> {
        LinkSnapshot::from_serde_links(internal::RingLinks::from_bytes(bytes.as_ref())?)
    }

    fn to_serde_links(&self) -> internal::RingLinks {
        internal::RingLinks {
            node: self.node.to_string(),
            prev: self.prev.as_ref().map(PeerRef::to_string),
            next: self.next.as_ref().map(PeerRef::to_string),
            fingers: self.fingers.iter().map(PeerRef::to_string).collect(),
        }
    }

    fn from_serde_links(links: internal::RingLinks) -> Result<LinkSnapshot> {
        Ok(LinkSnapshot {
            node: links.node.parse::<PeerRef>()?,
            prev: links.prev.map(|link| link.parse::<PeerRef>()).transpose()?,
            next: links.next.map(|link| link.parse::<PeerRef>()).transpose()?,
            fingers: links
                .fingers
                .iter()
                .map(|link| link.parse::<PeerRef>())
                .collect::<Result<_>>()?,
        })
    }
}

impl Message {
    fn into_serde_message(self) -> internal::RingMessage {
        let empty = |kind: &str| internal::RingMessage {
            kind: kind.to_string(),
            links: None,
            key: None,
            value: None,
        };

        match self {
            Message::SyncPull => empty(internal::SYNC_PULL),
            Message::SyncPush(snapshot) => internal::RingMessage {
                links: Some(snapshot.to_serde_links()),
                ..empty(internal::SYNC_PUSH)
            },
            Message::Put { key, value } => internal::RingMessage {
                key: Some(key.0),
                value: Some(value.to_vec()),
                ..empty(internal::PUT)
            },
            Message::Get { key } => internal::RingMessage {
                key: Some(key.0),
                ..empty(internal::GET)
            },
        }
    }

    fn from_serde_message(msg: internal::RingMessage) -> Result<Message> {
        let missing = |field: &str| {
            Error::BencodeError(serde_bencode::Error::MissingField(field.to_string()))
        };
        let key = || msg.key.map(Id).ok_or_else(|| missing("k"));

        Ok(match msg.kind.as_str() {
            internal::SYNC_PULL => Message::SyncPull,
            internal::SYNC_PUSH => match msg.links.clone() {
                Some(links) => Message::SyncPush(LinkSnapshot::from_serde_links(links)?),
                None => return Err(missing("l")),
            },
            internal::PUT => Message::Put {
                key: key()?,
                value: msg.value.clone().unwrap_or_default().into(),
            },
            internal::GET => Message::Get { key: key()? },
            other => {
                return Err(Error::BencodeError(serde_bencode::Error::Custom(
                    format!("unknown message kind {other:?}"),
                )))
            }
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::RingMessage::from_bytes(bytes.as_ref())?)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncPull => "SYNC_PULL",
            Message::SyncPush(_) => "SYNC_PUSH",
            Message::Put { .. } => "PUT",
            Message::Get { .. } => "GET",
        }
    }
}
