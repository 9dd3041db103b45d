// This module is the instruction lifter: it turns the x86-64 code of one guest function into
// an IR Function inside the persistent Module. Code bytes are never available up front; the
// lifter pulls them through a MemorySource (the remote mediator in the server, scripted images
// in tests), 16 bytes at a time, and decodes them with the iced-x86 decoder. LiftConfig
// carries the per-session knobs derived once from the handshake (flag clobbering across
// call/ret, native segment bases) and the helper functions that implement instructions the
// server supplies itself (syscall, cpuid, rdtsc, fldcw, ldmxcsr). The decode policy selects
// whether direct branches inside the function are followed or turned into exits.

//! x86-64 to IR lifter.

pub mod cpu_state;
pub mod fetch;
mod x86;

use crate::core::error::LiftError;
use crate::ir::{FuncId, Function, Linkage, Module};
use crate::protocol::{MemorySource, ServerConfig};
use bumpalo::Bump;

pub use fetch::{CodeFetcher, FETCH_SIZE};

/// How much of a function body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Follow direct jumps and conditional branches within the function.
    All,
    /// Stop at the first control transfer; every target becomes an exit.
    FirstExit,
}

/// Decode policy used by the server for every request.
pub const DECODE_POLICY: DecodePolicy = DecodePolicy::All;

/// Upper bound on instructions lifted into one function.
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Functions implementing instructions that are not lifted inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrImpls {
    pub syscall: FuncId,
    pub cpuid: FuncId,
    pub rdtsc: FuncId,
    pub fldcw: FuncId,
    pub ldmxcsr: FuncId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiftConfig {
    /// Treat guest flags as dead across call and ret.
    pub call_ret_clobber_flags: bool,
    /// Use the host FS/GS base instead of the CPU state copy.
    pub use_native_segment_base: bool,
    pub instr_impls: InstrImpls,
}

impl LiftConfig {
    pub fn new(server_config: &ServerConfig, instr_impls: InstrImpls) -> Self {
        Self {
            call_ret_clobber_flags: server_config.opt_unsafe_callret,
            use_native_segment_base: server_config.native_segments,
            instr_impls,
        }
    }
}

/// Name of the function translated from `addr`.
pub fn function_name(addr: u64) -> String {
    format!("func_{addr:x}")
}

pub struct Lifter {
    config: LiftConfig,
}

impl Lifter {
    pub fn new(config: LiftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LiftConfig {
        &self.config
    }

    /// Lift the function at `addr` and attach it to `module`.
    ///
    /// Fails with [`LiftError::NothingDecoded`] if not even the first instruction could be
    /// fetched and lifted. Later failures end the affected block with an exit to the
    /// failing address.
    pub fn lift(
        &self,
        module: &mut Module,
        addr: u64,
        policy: DecodePolicy,
        source: &mut dyn MemorySource,
        scratch: &Bump,
    ) -> Result<FuncId, LiftError> {
        let fetcher = CodeFetcher::new(source, scratch);
        let (body, decoded) = x86::FunctionLifter::new(&self.config, policy, fetcher, scratch)
            .lift(addr)
            .ok_or(LiftError::NothingDecoded { addr })?;
        log::debug!("lifted {decoded} instructions at {addr:#x}");

        let function = Function {
            name: function_name(addr),
            linkage: Linkage::External,
            always_inline: false,
            body: Some(body),
        };
        Ok(module.add_function(function)?)
    }
}
