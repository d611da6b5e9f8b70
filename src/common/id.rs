//! Ring identifier, the position of a node or a key on the ring.
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// 160 bit unsigned identifier.
///
/// Bytes are big-endian, so the derived ordering is the numeric ordering
/// that defines the position on the ring.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Deterministic Id of the node listening at `hostname:port`.
    ///
    /// SHA-1 over the UTF-8 hostname followed by the port as a 4 bytes little-endian integer.
    pub fn from_address(hostname: &str, port: u16) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(hostname.as_bytes());
        hasher.update(&(port as i32).to_le_bytes());

        Id(hasher.digest().bytes())
    }

    /// Id of an application key, SHA-1 over its UTF-8 bytes.
    pub fn from_key(key: &str) -> Id {
        Id(sha1_smol::Sha1::from(key.as_bytes()).digest().bytes())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Numeric distance `|self - other|`, ignoring the ring wraparound.
    pub fn abs_diff(&self, other: &Id) -> Id {
        let (high, low) = if self >= other {
            (self, other)
        } else {
            (other, self)
        };

        let mut result = [0u8; ID_SIZE];
        let mut borrow = 0i16;

        for i in (0..ID_SIZE).rev() {
            let mut byte = high.0[i] as i16 - low.0[i] as i16 - borrow;
            borrow = if byte < 0 {
                byte += 256;
                1
            } else {
                0
            };
            result[i] = byte as u8;
        }

        Id(result)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse the 40 characters hex form produced by [Display].
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidId(s.to_string()));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidId(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}
