//! rewrite-server - on-demand x86-64 function translation.
//!
//! A client asks for one guest function at a time. The server pulls the code bytes back from
//! the client as it needs them, lifts them into a small SSA IR, optimizes the result and
//! returns a relocatable ELF object for the client to link.
//!
//! # Primary Usage
//!
//! ```ignore
//! use rewrite_server::core::Session;
//! use rewrite_server::protocol::Conn;
//! use std::io::{stdin, stdout, BufReader, BufWriter};
//!
//! let conn = Conn::new(BufReader::new(stdin().lock()), BufWriter::new(stdout().lock()));
//! let mut session = Session::handshake(conn)?;
//! session.run()?;
//! ```
//!
//! # Architecture
//!
//! - [`protocol`] - Framed messages, handshake configuration, demand memory
//! - [`lifter`] - x86-64 decoding into IR
//! - [`ir`] - Function bodies and the persistent module
//! - [`opt`] - Fixed optimization pipeline
//! - [`x64`] - Lowering to machine code and ELF emission
//! - [`core`] - Errors, helper lifecycle, profiling and the session

pub mod core;
pub mod ir;
pub mod lifter;
pub mod opt;
pub mod protocol;
pub mod x64;

pub use crate::core::{Session, SessionError, SessionResult};
pub use crate::ir::{FuncId, Module};
pub use crate::protocol::{ClientConfig, Conn, MsgId, ServerConfig};
