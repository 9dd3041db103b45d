// This module defines error types for the rewrite server using the thiserror crate for
// idiomatic Rust error handling. ProtocolError covers the wire codec and the handshake: I/O
// failures, a peer that disconnected, malformed frame headers and payloads that are too short
// for the values read from them. LiftError reports translation requests where nothing could
// be decoded. CodegenError wraps assembler and object writer failures. SessionError is the
// top-level error of the translation loop; every variant is fatal to the session and maps to
// exit code 1 in the binary. Memory fetch failures are deliberately absent: they never leave
// the mediator and surface to the lifter as zero fetched bytes.

//! Error types for the rewrite server.
//!
//! Using thiserror for more idiomatic error handling.

use crate::ir::ModuleError;
use crate::protocol::MsgId;
use crate::x64::EncodingError;
use thiserror::Error;

/// Errors of the framed connection and the handshake decoder.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error on connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("message {id} has negative payload size {size}")]
    NegativeSize { id: MsgId, size: i32 },

    #[error("message {id} payload of {size} bytes exceeds limit")]
    PayloadTooLarge { id: MsgId, size: usize },

    #[error("payload too short: need {needed} bytes, {remaining} remaining")]
    ShortPayload { needed: usize, remaining: usize },

    #[error("configuration truncated at field {field}")]
    TruncatedConfig { field: &'static str },

    #[error("configuration field {field} is not valid UTF-8")]
    InvalidString { field: &'static str },
}

/// Result type alias for connection operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiftError {
    #[error("no instruction could be decoded at {addr:#x}")]
    NothingDecoded { addr: u64 },

    #[error("module rejected lifted function: {0}")]
    Module(#[from] ModuleError),
}

#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("instruction encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("object file emission failed: {0}")]
    Object(#[from] object::write::Error),

    #[error("call to {callee} which is not attached to the module")]
    UnknownCallee { callee: crate::ir::FuncId },
}

/// Fatal errors of a translation session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("error: expected C_INIT message, got {id}")]
    ExpectedInit { id: MsgId },

    #[error("unexpected msg {id}")]
    UnexpectedMessage { id: MsgId },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("lifting failed: {0}")]
    Lift(#[from] LiftError),

    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),

    #[error("module invariant violated: {0}")]
    Module(#[from] ModuleError),
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
