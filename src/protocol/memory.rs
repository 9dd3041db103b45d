// This module implements the demand memory protocol the lifter uses to read guest code. The
// lifter only sees the MemorySource trait ("fetch up to buf.len() bytes at addr, get back how
// many were supplied, 0 meaning failure"). RemoteMemory implements it on top of the session
// connection: it sends S_MEMREQ, blocks for the reply and validates it. The reply payload is
// the data followed by one failure-flag byte, so its length must lie in 1..=requested+1. Any
// deviation (wrong message id, bad length, flag set) makes just this fetch return 0. Transport
// failures also return 0 to the lifter, but are kept so the session can terminate once the
// lift step is over instead of continuing on a dead connection.

//! Memory access mediator.

use super::{Conn, MsgId, Payload};
use crate::core::error::{ProtocolError, ProtocolResult};
use std::io::{Read, Write};

/// Pull interface for guest memory.
pub trait MemorySource {
    /// Copy up to `buf.len()` bytes at `addr` into `buf`; returns the number supplied.
    ///
    /// Zero signals failure. Short reads are allowed.
    fn fetch(&mut self, addr: u64, buf: &mut [u8]) -> usize;
}

/// [`MemorySource`] served by the client over the session connection.
pub struct RemoteMemory<'c, R, W> {
    conn: &'c mut Conn<R, W>,
    transport_error: Option<ProtocolError>,
    requests: usize,
}

impl<'c, R: Read, W: Write> RemoteMemory<'c, R, W> {
    pub fn new(conn: &'c mut Conn<R, W>) -> Self {
        Self {
            conn,
            transport_error: None,
            requests: 0,
        }
    }

    /// Number of memory requests sent so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// The first connection failure seen during a fetch, if any.
    pub fn into_transport_error(self) -> Option<ProtocolError> {
        self.transport_error
    }

    fn exchange(&mut self, addr: u64, buf: &mut [u8]) -> ProtocolResult<usize> {
        let mut request = Payload::new();
        request.push(addr).push(buf.len() as u64);
        self.conn.send_msg(MsgId::S_MEMREQ, request.as_bytes())?;
        self.requests += 1;

        let id = self.conn.recv_msg()?;
        let size = self.conn.remaining();

        if id != MsgId::C_MEMBUF {
            log::warn!("memory request {addr:#x}: expected C_MEMBUF, got {id}");
            return Ok(0);
        }
        if size < 1 || size > buf.len() + 1 {
            log::warn!(
                "memory request {addr:#x}: reply of {size} bytes outside 1..={}",
                buf.len() + 1
            );
            return Ok(0);
        }

        let data = size - 1;
        self.conn.read_bytes(&mut buf[..data])?;
        let failed = self.conn.read::<u8>()?;
        if failed != 0 {
            log::debug!("memory request {addr:#x}: client reported failure");
            return Ok(0);
        }

        Ok(data)
    }
}

impl<R: Read, W: Write> MemorySource for RemoteMemory<'_, R, W> {
    fn fetch(&mut self, addr: u64, buf: &mut [u8]) -> usize {
        if self.transport_error.is_some() {
            return 0;
        }
        match self.exchange(addr, buf) {
            Ok(fetched) => fetched,
            Err(err) => {
                log::error!("memory request {addr:#x} failed: {err}");
                self.transport_error = Some(err);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn membuf(data: &[u8], flag: Option<u8>) -> Vec<u8> {
        let mut payload = data.to_vec();
        payload.extend(flag);
        frame(MsgId::C_MEMBUF, &payload)
    }

    fn frame(id: MsgId, payload: &[u8]) -> Vec<u8> {
        let mut out = Payload::new();
        out.push(id.0).push(payload.len() as i32).push_bytes(payload);
        out.into_bytes()
    }

    fn fetch_with_reply(reply: Vec<u8>, capacity: usize) -> (usize, Vec<u8>, Vec<u8>) {
        let mut conn = Conn::new(Cursor::new(reply), Vec::new());
        let mut buf = vec![0u8; capacity];
        let fetched = RemoteMemory::new(&mut conn).fetch(0x1000, &mut buf);
        let (_, sent) = conn.into_parts();
        (fetched, buf, sent)
    }

    #[test]
    fn test_request_carries_address_and_size() {
        let (_, _, sent) = fetch_with_reply(membuf(&[0x90; 16], Some(0)), 16);
        let mut expected = Payload::new();
        expected.push(0x1000u64).push(16u64);
        assert_eq!(sent, frame(MsgId::S_MEMREQ, expected.as_bytes()));
    }

    #[test]
    fn test_full_reply_accepted() {
        let data: Vec<u8> = (0..16).collect();
        let (fetched, buf, _) = fetch_with_reply(membuf(&data, Some(0)), 16);
        assert_eq!(fetched, 16);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_short_reply_accepted() {
        let (fetched, buf, _) = fetch_with_reply(membuf(&[0xc3, 0x90], Some(0)), 16);
        assert_eq!(fetched, 2);
        assert_eq!(&buf[..2], &[0xc3, 0x90]);
    }

    #[test]
    fn test_flag_only_reply_is_zero_bytes() {
        let (fetched, _, _) = fetch_with_reply(membuf(&[], Some(0)), 16);
        assert_eq!(fetched, 0);
    }

    #[test]
    fn test_failure_flag_discards_data() {
        let (fetched, _, _) = fetch_with_reply(membuf(&[0xc3; 16], Some(1)), 16);
        assert_eq!(fetched, 0);
    }

    #[test]
    fn test_empty_reply_rejected() {
        let (fetched, _, _) = fetch_with_reply(membuf(&[], None), 16);
        assert_eq!(fetched, 0);
    }

    #[test]
    fn test_oversized_reply_rejected() {
        let (fetched, _, _) = fetch_with_reply(membuf(&[0xc3; 17], Some(0)), 16);
        assert_eq!(fetched, 0);
    }

    #[test]
    fn test_wrong_message_id_rejected() {
        let (fetched, _, _) = fetch_with_reply(frame(MsgId::C_TRANSLATE, &[0; 9]), 16);
        assert_eq!(fetched, 0);
    }

    #[test]
    fn test_disconnect_is_recorded() {
        let mut conn = Conn::new(Cursor::new(Vec::new()), Vec::new());
        let mut memory = RemoteMemory::new(&mut conn);
        let mut buf = [0u8; 16];
        assert_eq!(memory.fetch(0x1000, &mut buf), 0);
        // no further traffic once the connection is known dead
        assert_eq!(memory.fetch(0x1010, &mut buf), 0);
        assert_eq!(memory.requests(), 1);
        assert!(matches!(
            memory.into_transport_error(),
            Some(ProtocolError::Disconnected)
        ));
    }
}
