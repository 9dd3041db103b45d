// This module implements the framed connection the whole session runs over. Conn owns the
// reader and writer halves of the duplex channel (stdin/stdout in the binary, in-process
// pipes in tests) together with the payload of the most recently received message and a read
// cursor into it. recv_msg blocks until a complete frame has arrived and replaces the current
// payload; read::<T> and read_bytes consume typed values from it; remaining reports what is
// left. send_msg writes a whole frame and flushes before returning, so no two sends can
// interleave on the wire. WireValue describes the fixed-size little-endian scalar encodings
// and Payload is the matching builder for outgoing messages.

//! Framed message connection.

use super::MsgId;
use crate::core::error::{ProtocolError, ProtocolResult};
use std::io::{self, Read, Write};

/// Frame header: `u32` message id and `i32` payload size.
pub const HEADER_SIZE: usize = 8;

/// Largest payload accepted from the peer.
pub const MAX_PAYLOAD: usize = 64 << 20;

/// Fixed-size little-endian value that can be carried in a payload.
pub trait WireValue: Sized {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Self;
    fn encode(&self, out: &mut Vec<u8>);
}

macro_rules! wire_int {
    ($($ty:ty),*) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

wire_int!(u8, u32, i32, u64);

impl WireValue for bool {
    const SIZE: usize = 1;

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

/// Builder for an outgoing payload.
#[derive(Debug, Default, Clone)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: WireValue>(&mut self, value: T) -> &mut Self {
        value.encode(&mut self.bytes);
        self
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed (`u32`) UTF-8 string.
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.push(value.len() as u32);
        self.push_bytes(value.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// One end of the framed duplex channel.
pub struct Conn<R, W> {
    reader: R,
    writer: W,
    payload: Vec<u8>,
    cursor: usize,
}

fn map_read_error(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Disconnected
    } else {
        ProtocolError::Io(err)
    }
}

impl<R: Read, W: Write> Conn<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            payload: Vec::new(),
            cursor: 0,
        }
    }

    /// Block until the next complete message arrives.
    ///
    /// Unread bytes of the previous payload are discarded.
    pub fn recv_msg(&mut self) -> ProtocolResult<MsgId> {
        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header).map_err(map_read_error)?;

        let id = MsgId(u32::decode(&header[0..4]));
        let size = i32::decode(&header[4..8]);
        if size < 0 {
            return Err(ProtocolError::NegativeSize { id, size });
        }
        let size = size as usize;
        if size > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { id, size });
        }

        self.payload.clear();
        self.payload.resize(size, 0);
        self.cursor = 0;
        self.reader
            .read_exact(&mut self.payload)
            .map_err(map_read_error)?;

        log::trace!("recv {} ({} bytes)", id, size);
        Ok(id)
    }

    /// Bytes of the current payload not consumed yet.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    fn take(&mut self, needed: usize) -> ProtocolResult<&[u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ProtocolError::ShortPayload { needed, remaining });
        }
        let start = self.cursor;
        self.cursor += needed;
        Ok(&self.payload[start..self.cursor])
    }

    /// Consume the next typed value of the current payload.
    pub fn read<T: WireValue>(&mut self) -> ProtocolResult<T> {
        self.take(T::SIZE).map(T::decode)
    }

    /// Consume exactly `buf.len()` raw bytes.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> ProtocolResult<()> {
        let bytes = self.take(buf.len())?;
        buf.copy_from_slice(bytes);
        Ok(())
    }

    /// Consume a `u32` length-prefixed byte string.
    pub fn read_byte_string(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.read::<u32>()? as usize;
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Write one complete frame and flush it.
    pub fn send_msg(&mut self, id: MsgId, payload: &[u8]) -> ProtocolResult<()> {
        let size = i32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            id,
            size: payload.len(),
        })?;

        let mut header = Vec::with_capacity(HEADER_SIZE);
        id.0.encode(&mut header);
        size.encode(&mut header);

        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        self.writer.flush()?;

        log::trace!("sent {} ({} bytes)", id, payload.len());
        Ok(())
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(id: MsgId, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        id.0.encode(&mut out);
        (payload.len() as i32).encode(&mut out);
        out.extend_from_slice(payload);
        out
    }

    fn conn_over(input: Vec<u8>) -> Conn<Cursor<Vec<u8>>, Vec<u8>> {
        Conn::new(Cursor::new(input), Vec::new())
    }

    #[test]
    fn test_recv_and_typed_reads() {
        let mut payload = Payload::new();
        payload.push(0x1000u64).push(7u32).push(true);
        let mut conn = conn_over(frame(MsgId::C_TRANSLATE, payload.as_bytes()));

        assert_eq!(conn.recv_msg().unwrap(), MsgId::C_TRANSLATE);
        assert_eq!(conn.remaining(), 13);
        assert_eq!(conn.read::<u64>().unwrap(), 0x1000);
        assert_eq!(conn.read::<u32>().unwrap(), 7);
        assert!(conn.read::<bool>().unwrap());
        assert_eq!(conn.remaining(), 0);
    }

    #[test]
    fn test_short_payload_read_fails() {
        let mut conn = conn_over(frame(MsgId::C_TRANSLATE, &[1, 2, 3]));
        conn.recv_msg().unwrap();
        assert!(matches!(
            conn.read::<u64>(),
            Err(ProtocolError::ShortPayload {
                needed: 8,
                remaining: 3
            })
        ));
    }

    #[test]
    fn test_unread_payload_is_discarded() {
        let mut input = frame(MsgId::C_TRANSLATE, &[0xaa; 8]);
        input.extend(frame(MsgId::C_EXIT, &[]));
        let mut conn = conn_over(input);

        conn.recv_msg().unwrap();
        assert_eq!(conn.recv_msg().unwrap(), MsgId::C_EXIT);
        assert_eq!(conn.remaining(), 0);
    }

    #[test]
    fn test_truncated_stream_is_disconnect() {
        let mut input = frame(MsgId::C_MEMBUF, &[0; 4]);
        input.truncate(6);
        let mut conn = conn_over(input);
        assert!(matches!(conn.recv_msg(), Err(ProtocolError::Disconnected)));
    }

    #[test]
    fn test_negative_size_rejected() {
        let mut input = Vec::new();
        MsgId::C_TRANSLATE.0.encode(&mut input);
        (-1i32).encode(&mut input);
        let mut conn = conn_over(input);
        assert!(matches!(
            conn.recv_msg(),
            Err(ProtocolError::NegativeSize { size: -1, .. })
        ));
    }

    #[test]
    fn test_send_writes_complete_frame() {
        let mut conn = conn_over(Vec::new());
        conn.send_msg(MsgId::S_OBJECT, b"ELF").unwrap();
        assert_eq!(conn.writer(), &frame(MsgId::S_OBJECT, b"ELF"));
    }

    #[test]
    fn test_byte_string() {
        let mut payload = Payload::new();
        payload.push_str("out/");
        let mut conn = conn_over(frame(MsgId::C_INIT, payload.as_bytes()));
        conn.recv_msg().unwrap();
        assert_eq!(conn.read_byte_string().unwrap(), b"out/");
    }
}
