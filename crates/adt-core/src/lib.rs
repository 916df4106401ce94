pub mod env;
pub mod logging;
pub mod protocol;
pub mod rest;

pub use protocol::{AgentId, CommandId, Envelope, MessageKind, ParseFailurePolicy, ProtocolError};
