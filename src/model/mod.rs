//! # Value & Socket Model
//!
//! Plain data shared by every layer: the `Value` carried on sockets, the
//! socket-type algebra and property metadata.
//!
//! Design rule: no scheduling, no I/O, no async in this module.

pub mod value;
pub mod socket;
pub mod property;

pub use value::{ErrorInfo, Value};
pub use socket::{Socket, SocketRef, SocketType};
pub use property::{PropertyField, PropertyMap, PropertyType};
