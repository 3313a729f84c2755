//! Wire protocol and TCP framing shared by the Asset Manager, Resource
//! Manager, and provider listeners.

pub mod channel;
pub mod frame;
pub mod listener;

pub use channel::{validate_protocol_version, WireChannel};
pub use frame::{CommandName, Header, Message, MessageKind, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
pub use listener::WireListener;
