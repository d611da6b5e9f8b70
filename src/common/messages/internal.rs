use serde::{Deserialize, Serialize};

pub const SYNC_PULL: &str = "pull";
pub const SYNC_PUSH: &str = "push";
pub const PUT: &str = "put";
pub const GET: &str = "get";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RingMessage {
    #[serde(rename = "y")]
    pub kind: String,

    #[serde(default)]
    #[serde(rename = "l", skip_serializing_if = "Option::is_none")]
    pub links: Option<RingLinks>,

    #[serde(default)]
    #[serde(rename = "k", with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub key: Option<[u8; 20]>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

impl RingMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<RingMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// Links in the `hostname:port:id` form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RingLinks {
    #[serde(rename = "n")]
    pub node: String,

    #[serde(default)]
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,

    #[serde(default)]
    #[serde(rename = "x", skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default)]
    #[serde(rename = "f")]
    pub fingers: Vec<String>,
}

impl RingLinks {
    pub fn from_bytes(bytes: &[u8]) -> Result<RingLinks, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
