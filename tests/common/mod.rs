//! In-process scripted client shared by the integration tests.
//!
//! The client hands the server a queue of top-level messages and answers every memory
//! request from a responder as soon as the server writes it.

#![allow(dead_code)]

use rewrite_server::core::{Session, SessionResult};
use rewrite_server::protocol::{Conn, MsgId, Payload, ServerConfig};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

/// Reply payload (data plus flag byte) for a memory request of `size` bytes at `addr`.
pub type Responder = Box<dyn FnMut(u64, u64) -> Vec<u8>>;

pub fn frame(id: MsgId, payload: &[u8]) -> Vec<u8> {
    let mut out = Payload::new();
    out.push(id.0).push(payload.len() as i32).push_bytes(payload);
    out.into_bytes()
}

pub fn init(config: &ServerConfig) -> Vec<u8> {
    frame(MsgId::C_INIT, config.to_payload().as_bytes())
}

pub fn translate(addr: u64) -> Vec<u8> {
    frame(MsgId::C_TRANSLATE, &addr.to_le_bytes())
}

pub fn exit() -> Vec<u8> {
    frame(MsgId::C_EXIT, &[])
}

/// Serve requests from `bytes` mapped at `base`; anything outside reports failure.
pub fn image(base: u64, bytes: &[u8]) -> Responder {
    let bytes = bytes.to_vec();
    Box::new(move |addr, size| {
        let end = base + bytes.len() as u64;
        if addr < base || addr >= end {
            return vec![1];
        }
        let start = (addr - base) as usize;
        let stop = start + (size as usize).min(bytes.len() - start);
        let mut reply = bytes[start..stop].to_vec();
        reply.push(0);
        reply
    })
}

/// Answer every request with the same payload.
pub fn fixed(reply: &[u8]) -> Responder {
    let reply = reply.to_vec();
    Box::new(move |_, _| reply.clone())
}

struct ClientState {
    script: VecDeque<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
    outbound: Vec<u8>,
    received: Vec<(MsgId, Vec<u8>)>,
    memory_requests: Vec<(u64, u64)>,
    responder: Responder,
}

impl ClientState {
    fn parse_outbound(&mut self) {
        loop {
            if self.outbound.len() < 8 {
                return;
            }
            let id = MsgId(u32::from_le_bytes(self.outbound[0..4].try_into().unwrap()));
            let size = i32::from_le_bytes(self.outbound[4..8].try_into().unwrap()) as usize;
            if self.outbound.len() < 8 + size {
                return;
            }
            let payload = self.outbound[8..8 + size].to_vec();
            self.outbound.drain(..8 + size);

            if id == MsgId::S_MEMREQ {
                let addr = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let len = u64::from_le_bytes(payload[8..16].try_into().unwrap());
                self.memory_requests.push((addr, len));
                let reply = (self.responder)(addr, len);
                self.replies.push_back(frame(MsgId::C_MEMBUF, &reply));
            }
            self.received.push((id, payload));
        }
    }
}

/// Client side of one session.
#[derive(Clone)]
pub struct ScriptedClient {
    state: Rc<RefCell<ClientState>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Vec<u8>>, responder: Responder) -> Self {
        Self {
            state: Rc::new(RefCell::new(ClientState {
                script: script.into(),
                replies: VecDeque::new(),
                current: Vec::new(),
                pos: 0,
                outbound: Vec::new(),
                received: Vec::new(),
                memory_requests: Vec::new(),
                responder,
            })),
        }
    }

    pub fn conn(&self) -> Conn<ClientReader, ClientWriter> {
        Conn::new(ClientReader(self.clone()), ClientWriter(self.clone()))
    }

    /// Every frame the server sent, in order.
    pub fn received(&self) -> Vec<(MsgId, Vec<u8>)> {
        self.state.borrow().received.clone()
    }

    pub fn objects(&self) -> Vec<Vec<u8>> {
        self.received()
            .into_iter()
            .filter(|(id, _)| *id == MsgId::S_OBJECT)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn memory_requests(&self) -> Vec<(u64, u64)> {
        self.state.borrow().memory_requests.clone()
    }

    /// Top-level messages the server never read.
    pub fn unread_script(&self) -> usize {
        self.state.borrow().script.len()
    }
}

pub struct ClientReader(ScriptedClient);

impl Read for ClientReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.state.borrow_mut();
        if state.pos == state.current.len() {
            let next = match state.replies.pop_front() {
                Some(reply) => Some(reply),
                None => state.script.pop_front(),
            };
            match next {
                Some(bytes) => {
                    state.current = bytes;
                    state.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(state.current.len() - state.pos);
        let pos = state.pos;
        buf[..n].copy_from_slice(&state.current[pos..pos + n]);
        state.pos += n;
        Ok(n)
    }
}

pub struct ClientWriter(ScriptedClient);

impl Write for ClientWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.state.borrow_mut();
        state.outbound.extend_from_slice(buf);
        state.parse_outbound();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run a whole session: handshake, then the request loop.
pub fn serve(client: &ScriptedClient) -> SessionResult<Session<ClientReader, ClientWriter>> {
    let mut session = Session::handshake(client.conn())?;
    session.run()?;
    Ok(session)
}
