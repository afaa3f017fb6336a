//! Wire format shared by every fleetcast connection.

pub mod message;

pub use message::{Message, MessageType};
