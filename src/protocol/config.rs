// This module declares the handshake schema. The C_INIT payload is a fixed, ordered sequence
// of typed fields (bool as one byte, int32 little-endian, strings as u32 length + UTF-8); the
// server_config! table below is the single place that lists them, generating the
// ServerConfig struct, its defaults and the decoder/encoder that walk the fields in declared
// order. Adding a field means appending a line to the table and bumping
// CONFIG_SCHEMA_VERSION. ClientConfig is the packed companion record of i32 counters the
// protocol reserves for the server-to-client direction; the server builds it zeroed.

//! Handshake configuration records.

use super::connection::{Conn, Payload};
use crate::core::error::{ProtocolError, ProtocolResult};
use std::io::{Read, Write};

/// Version of the field table below.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// A type that can appear as a configuration field.
pub trait ConfigField: Sized {
    fn read_field<R: Read, W: Write>(
        conn: &mut Conn<R, W>,
        field: &'static str,
    ) -> ProtocolResult<Self>;

    fn write_field(&self, payload: &mut Payload);
}

fn truncated(field: &'static str) -> impl FnOnce(ProtocolError) -> ProtocolError {
    move |err| match err {
        ProtocolError::ShortPayload { .. } => ProtocolError::TruncatedConfig { field },
        other => other,
    }
}

impl ConfigField for bool {
    fn read_field<R: Read, W: Write>(
        conn: &mut Conn<R, W>,
        field: &'static str,
    ) -> ProtocolResult<Self> {
        conn.read::<bool>().map_err(truncated(field))
    }

    fn write_field(&self, payload: &mut Payload) {
        payload.push(*self);
    }
}

impl ConfigField for i32 {
    fn read_field<R: Read, W: Write>(
        conn: &mut Conn<R, W>,
        field: &'static str,
    ) -> ProtocolResult<Self> {
        conn.read::<i32>().map_err(truncated(field))
    }

    fn write_field(&self, payload: &mut Payload) {
        payload.push(*self);
    }
}

impl ConfigField for String {
    fn read_field<R: Read, W: Write>(
        conn: &mut Conn<R, W>,
        field: &'static str,
    ) -> ProtocolResult<Self> {
        let bytes = conn.read_byte_string().map_err(truncated(field))?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString { field })
    }

    fn write_field(&self, payload: &mut Payload) {
        payload.push_str(self);
    }
}

macro_rules! server_config {
    ($( $(#[$doc:meta])* $name:ident : $ty:ty = $default:expr ),* $(,)?) => {
        /// Run-time configuration received in the handshake; immutable afterwards.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct ServerConfig {
            $( $(#[$doc])* pub $name: $ty, )*
        }

        impl Default for ServerConfig {
            fn default() -> Self {
                Self { $( $name: $default, )* }
            }
        }

        impl ServerConfig {
            /// Field names in wire order.
            pub const FIELDS: &'static [&'static str] = &[$( stringify!($name) ),*];

            /// Decode the schema from the current payload of `conn`.
            pub fn read_from_conn<R: Read, W: Write>(conn: &mut Conn<R, W>) -> ProtocolResult<Self> {
                let config = Self {
                    $( $name: <$ty as ConfigField>::read_field(conn, stringify!($name))?, )*
                };
                if conn.remaining() > 0 {
                    log::debug!(
                        "ignoring {} trailing configuration bytes (schema v{})",
                        conn.remaining(),
                        CONFIG_SCHEMA_VERSION
                    );
                }
                Ok(config)
            }

            /// Encode in wire order, as a client would send it.
            pub fn to_payload(&self) -> Payload {
                let mut payload = Payload::new();
                $( ConfigField::write_field(&self.$name, &mut payload); )*
                payload
            }
        }
    };
}

server_config! {
    /// Allow call and return to clobber guest flags.
    opt_unsafe_callret: bool = false,
    /// Address FS/GS-relative operands through the host segment bases.
    native_segments: bool = false,
    /// Alternate entry calling convention.
    hhvm: bool = false,
    /// Optimization level, see [`crate::opt::Optimizer`].
    opt_pass_pipeline: i32 = 2,
    debug_profile_server: bool = false,
    debug_dump_ir: bool = false,
    debug_dump_objects: bool = false,
    debug_time_passes: bool = false,
    /// Directory for object dumps, empty for the working directory.
    debug_dump_dir: String = String::new(),
}

macro_rules! client_config {
    ($( $name:ident ),* $(,)?) => {
        /// Packed counter record reserved for the server-to-client direction.
        #[repr(C, packed)]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct ClientConfig {
            $( pub $name: i32, )*
        }

        impl ClientConfig {
            pub const FIELDS: &'static [&'static str] = &[$( stringify!($name) ),*];

            /// Packed little-endian encoding.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut payload = Payload::new();
                $( payload.push({ self.$name }); )*
                payload.into_bytes()
            }
        }
    };
}

client_config!(tc_callconv, tc_profile, tc_perf, tc_print_trace);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgId;
    use std::io::Cursor;

    fn conn_with_payload(payload: &[u8]) -> Conn<Cursor<Vec<u8>>, Vec<u8>> {
        let mut frame = Payload::new();
        frame
            .push(MsgId::C_INIT.0)
            .push(payload.len() as i32)
            .push_bytes(payload);
        let mut conn = Conn::new(Cursor::new(frame.into_bytes()), Vec::new());
        conn.recv_msg().unwrap();
        conn
    }

    #[test]
    fn test_defaults_decode_from_default_payload() {
        let payload = ServerConfig::default().to_payload();
        // eight scalar fields (one int32) plus an empty string
        assert_eq!(payload.as_bytes().len(), 7 + 4 + 4);
        let mut conn = conn_with_payload(payload.as_bytes());
        let config = ServerConfig::read_from_conn(&mut conn).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_fields_decode_in_declared_order() {
        let expected = ServerConfig {
            opt_unsafe_callret: true,
            native_segments: false,
            hhvm: true,
            opt_pass_pipeline: 1,
            debug_profile_server: true,
            debug_dump_ir: false,
            debug_dump_objects: true,
            debug_time_passes: false,
            debug_dump_dir: "/tmp/objs".to_string(),
        };
        let mut conn = conn_with_payload(expected.to_payload().as_bytes());
        assert_eq!(ServerConfig::read_from_conn(&mut conn).unwrap(), expected);
        assert_eq!(ServerConfig::FIELDS[0], "opt_unsafe_callret");
        assert_eq!(ServerConfig::FIELDS.len(), 9);
    }

    #[test]
    fn test_truncated_schema_names_field() {
        let mut conn = conn_with_payload(&[0, 0, 0, 2, 0]);
        assert!(matches!(
            ServerConfig::read_from_conn(&mut conn),
            Err(ProtocolError::TruncatedConfig {
                field: "opt_pass_pipeline"
            })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_tolerated() {
        let mut payload = ServerConfig::default().to_payload();
        payload.push(0xdead_beefu32);
        let mut conn = conn_with_payload(payload.as_bytes());
        assert!(ServerConfig::read_from_conn(&mut conn).is_ok());
    }

    #[test]
    fn test_client_config_is_packed() {
        assert_eq!(std::mem::size_of::<ClientConfig>(), 16);
        let config = ClientConfig {
            tc_profile: 3,
            ..ClientConfig::default()
        };
        assert_eq!(config.to_bytes(), vec![0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
