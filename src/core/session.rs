// This module implements the translation session: the handshake followed by the request loop
// over one connection. Session owns every long-lived resource of the process: the connection,
// the immutable ServerConfig and the companion ClientConfig, the persistent Module with its
// helper manager, the lifter, optimizer and code generator built from the config, the
// profiling accumulator, the per-request scratch arena and the reusable object buffer. The
// loop is an explicit state machine; each state carries the data the next step needs (the
// requested address, the new function's id). Every error is fatal and ends the loop; the
// binary maps it to exit code 1. Debug dumps only log their own failures.
// A request runs lift, optimize, generate, send and cleanup strictly in that order, and the
// module is back to the helper set alone when the loop returns to AwaitRequest.

//! Translation session state machine.

use super::error::{SessionError, SessionResult};
use super::helpers::HelperManager;
use super::profile::{Phase, Profiler};
use crate::ir::{FuncId, Module};
use crate::lifter::{function_name, LiftConfig, Lifter, DECODE_POLICY};
use crate::opt::Optimizer;
use crate::protocol::{ClientConfig, Conn, MsgId, RemoteMemory, ServerConfig};
use crate::x64::CodeGenerator;
use bumpalo::Bump;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Name of the persistent module.
pub const MODULE_NAME: &str = "mod";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitRequest,
    Lifting { addr: u64 },
    Optimizing { addr: u64, func: FuncId },
    Generating { addr: u64, func: FuncId },
    Sending { addr: u64, func: FuncId },
    Cleanup { func: FuncId },
    Terminated,
}

pub struct Session<R, W> {
    conn: Conn<R, W>,
    config: ServerConfig,
    client_config: ClientConfig,
    module: Module,
    helpers: HelperManager,
    lifter: Lifter,
    optimizer: Optimizer,
    codegen: CodeGenerator,
    profiler: Profiler,
    scratch: Bump,
    obj_buffer: Vec<u8>,
    translated: usize,
}

impl<R: Read, W: Write> Session<R, W> {
    /// Wait for the client's init message and build the session from its configuration.
    pub fn handshake(mut conn: Conn<R, W>) -> SessionResult<Self> {
        let id = conn.recv_msg()?;
        if id != MsgId::C_INIT {
            return Err(SessionError::ExpectedInit { id });
        }
        let config = ServerConfig::read_from_conn(&mut conn)?;
        log::debug!("server config: {config:?}");
        Self::with_config(conn, config)
    }

    /// Build a session for an already decoded configuration.
    pub fn with_config(conn: Conn<R, W>, config: ServerConfig) -> SessionResult<Self> {
        let mut module = Module::new(MODULE_NAME);
        let helpers = HelperManager::install(&mut module)?;
        let lifter = Lifter::new(LiftConfig::new(&config, helpers.instr_impls()));

        Ok(Self {
            conn,
            client_config: ClientConfig::default(),
            module,
            helpers,
            lifter,
            optimizer: Optimizer::new(&config),
            codegen: CodeGenerator::new(&config),
            profiler: Profiler::new(config.debug_profile_server, config.debug_time_passes),
            scratch: Bump::new(),
            obj_buffer: Vec::new(),
            translated: 0,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn helpers(&self) -> &HelperManager {
        &self.helpers
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Number of requests answered so far.
    pub fn translated(&self) -> usize {
        self.translated
    }

    /// Serve requests until the client sends C_EXIT.
    pub fn run(&mut self) -> SessionResult<()> {
        let mut state = SessionState::AwaitRequest;
        while state != SessionState::Terminated {
            state = self.step(state)?;
        }
        Ok(())
    }

    fn step(&mut self, state: SessionState) -> SessionResult<SessionState> {
        let next = match state {
            SessionState::AwaitRequest => self.await_request()?,
            SessionState::Lifting { addr } => {
                let func = self.lift(addr)?;
                self.dump_ir(func, "lifted");
                SessionState::Optimizing { addr, func }
            }
            SessionState::Optimizing { addr, func } => {
                let start = self.profiler.start();
                self.helpers.detach_unused(&mut self.module)?;
                let timings = self.optimizer.optimize(&mut self.module, func)?;
                self.profiler.record(Phase::Optimizing, start);
                self.profiler.record_passes(&timings);
                self.dump_ir(func, "optimized");
                SessionState::Generating { addr, func }
            }
            SessionState::Generating { addr, func } => {
                let start = self.profiler.start();
                self.codegen.generate(&self.module, &mut self.obj_buffer)?;
                self.profiler.record(Phase::Codegen, start);
                self.dump_ir(func, "generated");
                SessionState::Sending { addr, func }
            }
            SessionState::Sending { addr, func } => {
                self.conn.send_msg(MsgId::S_OBJECT, &self.obj_buffer)?;
                log::debug!("sent object of {} bytes for {addr:#x}", self.obj_buffer.len());
                if self.config.debug_dump_objects {
                    self.dump_object(addr);
                }
                SessionState::Cleanup { func }
            }
            SessionState::Cleanup { func } => {
                self.module.erase(func)?;
                self.helpers.reattach_detached(&mut self.module)?;
                self.scratch.reset();
                self.translated += 1;
                debug_assert!(self.helpers.is_session_shape(&self.module));
                SessionState::AwaitRequest
            }
            SessionState::Terminated => SessionState::Terminated,
        };
        Ok(next)
    }

    fn await_request(&mut self) -> SessionResult<SessionState> {
        match self.conn.recv_msg()? {
            MsgId::C_EXIT => {
                log::debug!("client ended the session after {} requests", self.translated);
                for line in self.profiler.report_lines() {
                    eprintln!("{line}");
                }
                Ok(SessionState::Terminated)
            }
            MsgId::C_TRANSLATE => {
                let addr = self.conn.read::<u64>()?;
                log::debug!("translate {addr:#x}");
                Ok(SessionState::Lifting { addr })
            }
            id => Err(SessionError::UnexpectedMessage { id }),
        }
    }

    fn lift(&mut self, addr: u64) -> SessionResult<FuncId> {
        let start = self.profiler.start();
        let mut memory = RemoteMemory::new(&mut self.conn);
        let lifted = self
            .lifter
            .lift(&mut self.module, addr, DECODE_POLICY, &mut memory, &self.scratch);
        log::debug!("{} memory requests for {addr:#x}", memory.requests());

        // A dead connection outranks whatever the lifter made of the missing bytes.
        if let Some(err) = memory.into_transport_error() {
            return Err(err.into());
        }
        let func = lifted?;
        self.profiler.record(Phase::Lifting, start);
        Ok(func)
    }

    fn dump_ir(&self, func: FuncId, stage: &str) {
        if !self.config.debug_dump_ir {
            return;
        }
        if let Some(function) = self.module.function(func) {
            eprintln!("; {stage}\n{function}");
        }
    }

    /// Write the sent object to the dump directory. Failures are logged and never end the
    /// session.
    fn dump_object(&self, addr: u64) {
        let path = PathBuf::from(&self.config.debug_dump_dir)
            .join(format!("{}.elf", function_name(addr)));
        match std::fs::write(&path, &self.obj_buffer) {
            Ok(()) => log::debug!("dumped object to {}", path.display()),
            Err(err) => log::warn!("failed to dump object to {}: {err}", path.display()),
        }
    }
}
