// This module gathers the session-level infrastructure of the rewrite server: the error
// hierarchy shared by every layer, the helper manager that owns the fixed helper set of the
// persistent module, the profiling accumulator and the translation session itself. The
// session drives the protocol, lifter, optimizer and backend modules; nothing below it
// depends on the session.

//! Core infrastructure of the rewrite server.
//!
//! # Key Components
//!
//! ## Session (`session`)
//! - Handshake and the request state machine
//! - Owns the connection, the persistent module and the per-request scratch arena
//!
//! ## Helpers (`helpers`)
//! - Fixed helper functions installed once per session
//! - Detach before optimization, reattach after code generation
//!
//! ## Profiling (`profile`)
//! - Per-phase wall time and optional per-pass totals

pub mod error;
pub mod helpers;
pub mod profile;
pub mod session;

pub use error::{
    CodegenError, LiftError, ProtocolError, ProtocolResult, SessionError, SessionResult,
};
pub use helpers::{HelperKind, HelperManager, HelperState};
pub use profile::{Phase, Profiler};
pub use session::{Session, MODULE_NAME};
