//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod peer;

pub use id::*;
pub use messages::{LinkSnapshot, Message};
pub use peer::*;
