//! Client/server wire protocol.
//!
//! Every message is an 8-byte header (`u32` id, `i32` payload size, both
//! little-endian) followed by the payload. The exchange is strictly
//! request/response; the only nesting is the memory request a lift issues
//! while a translate request is in flight.

use std::fmt;

pub mod config;
pub mod connection;
pub mod memory;

pub use config::{ClientConfig, ServerConfig, CONFIG_SCHEMA_VERSION};
pub use connection::{Conn, Payload, WireValue, HEADER_SIZE, MAX_PAYLOAD};
pub use memory::{MemorySource, RemoteMemory};

/// Message identifier as carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub u32);

impl MsgId {
    pub const C_EXIT: MsgId = MsgId(1);
    pub const C_INIT: MsgId = MsgId(2);
    /// Reserved for reporting [`ClientConfig`]; the server does not send it.
    pub const S_INIT: MsgId = MsgId(3);
    pub const C_TRANSLATE: MsgId = MsgId(4);
    pub const S_MEMREQ: MsgId = MsgId(5);
    pub const C_MEMBUF: MsgId = MsgId(6);
    pub const S_OBJECT: MsgId = MsgId(7);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            MsgId::C_EXIT => "C_EXIT",
            MsgId::C_INIT => "C_INIT",
            MsgId::S_INIT => "S_INIT",
            MsgId::C_TRANSLATE => "C_TRANSLATE",
            MsgId::S_MEMREQ => "S_MEMREQ",
            MsgId::C_MEMBUF => "C_MEMBUF",
            MsgId::S_OBJECT => "S_OBJECT",
            _ => return None,
        })
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}
