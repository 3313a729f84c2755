//! The fixed 72-byte header shared by every inter-process message
//! (spec §4.1): a 28-byte magic, a version byte, a serial, a payload
//! length, a message kind, a 32-byte zero-padded command name, and two
//! reserved bytes that must be zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fusion_core::error::{FusionError, Result};

pub const MAGIC: &[u8; 28] = b"Keyhole Fusion Wire Protocol";
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 28 + 1 + 4 + 4 + 1 + 32 + 1 + 1;
const COMMAND_LEN: usize = 32;

const _: () = assert!(HEADER_LEN == 72);

/// One of the five message kinds the wire protocol speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invalid = 0,
    Register = 1,
    Notify = 2,
    Request = 3,
    Reply = 4,
    Exception = 5,
}

impl MessageKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => MessageKind::Invalid,
            1 => MessageKind::Register,
            2 => MessageKind::Notify,
            3 => MessageKind::Request,
            4 => MessageKind::Reply,
            5 => MessageKind::Exception,
            _ => return None,
        })
    }
}

/// A command name, zero-padded to 32 ASCII bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandName(String);

impl CommandName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.len() > COMMAND_LEN {
            return Err(FusionError::protocol(format!(
                "command name `{name}` exceeds {COMMAND_LEN} bytes"
            )));
        }
        if !name.is_ascii() {
            return Err(FusionError::protocol(format!(
                "command name `{name}` is not ASCII"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn write_padded(&self, buf: &mut [u8; COMMAND_LEN]) {
        buf.fill(0);
        buf[..self.0.len()].copy_from_slice(self.0.as_bytes());
    }

    fn read_padded(buf: &[u8; COMMAND_LEN]) -> Result<Self> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        if buf[end..].iter().any(|&b| b != 0) {
            return Err(FusionError::protocol(
                "command name has non-zero bytes after the first NUL",
            ));
        }
        let s = std::str::from_utf8(&buf[..end])
            .map_err(|_| FusionError::protocol("command name is not valid UTF-8"))?;
        CommandName::new(s)
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully parsed 72-byte header, minus the magic/version/reserved bytes
/// (already validated by the time a `Header` exists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub serial: u32,
    pub payload_len: u32,
    pub kind: MessageKind,
    pub command: CommandName,
}

impl Header {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(self.serial);
        buf.put_u32(self.payload_len);
        buf.put_u8(self.kind as u8);
        let mut command_buf = [0u8; COMMAND_LEN];
        self.command.write_padded(&mut command_buf);
        buf.put_slice(&command_buf);
        buf.put_u8(0);
        buf.put_u8(0);
        buf
    }

    /// Parses exactly `HEADER_LEN` bytes. Fails with `FusionError::Protocol`
    /// on magic mismatch, version mismatch, unknown kind, or non-zero
    /// reserved bytes — never panics on attacker-controlled input.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(FusionError::protocol(format!(
                "expected {HEADER_LEN}-byte header, got {}",
                bytes.len()
            )));
        }
        let magic = &bytes[..28];
        if magic != MAGIC {
            return Err(FusionError::protocol("bad magic"));
        }
        bytes.advance(28);
        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FusionError::protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        let serial = bytes.get_u32();
        let payload_len = bytes.get_u32();
        let kind_byte = bytes.get_u8();
        let kind = MessageKind::from_u8(kind_byte)
            .ok_or_else(|| FusionError::protocol(format!("unknown message kind {kind_byte}")))?;
        let mut command_buf = [0u8; COMMAND_LEN];
        command_buf.copy_from_slice(&bytes[..COMMAND_LEN]);
        bytes.advance(COMMAND_LEN);
        let command = CommandName::read_padded(&command_buf)?;
        let reserved = [bytes.get_u8(), bytes.get_u8()];
        if reserved != [0, 0] {
            return Err(FusionError::protocol("reserved header bytes must be zero"));
        }
        Ok(Self {
            serial,
            payload_len,
            kind,
            command,
        })
    }
}

/// A full message: header plus payload, ready to serialise in one
/// write-all call (spec §4.1 "Send contract").
#[derive(Debug, Clone)]
pub struct Message {
    pub serial: u32,
    pub kind: MessageKind,
    pub command: CommandName,
    pub payload: Bytes,
}

impl Message {
    pub fn register(serial: u32, command: CommandName) -> Self {
        Self {
            serial,
            kind: MessageKind::Register,
            command,
            payload: Bytes::new(),
        }
    }

    pub fn notify(command: CommandName, payload: impl Into<Bytes>) -> Self {
        Self {
            serial: 0,
            kind: MessageKind::Notify,
            command,
            payload: payload.into(),
        }
    }

    pub fn request(serial: u32, command: CommandName, payload: impl Into<Bytes>) -> Self {
        Self {
            serial,
            kind: MessageKind::Request,
            command,
            payload: payload.into(),
        }
    }

    pub fn reply(serial: u32, command: CommandName, payload: impl Into<Bytes>) -> Self {
        Self {
            serial,
            kind: MessageKind::Reply,
            command,
            payload: payload.into(),
        }
    }

    pub fn exception(serial: u32, command: CommandName, message: &str) -> Self {
        Self {
            serial,
            kind: MessageKind::Exception,
            command,
            payload: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn header(&self) -> Result<Header> {
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| FusionError::protocol("payload exceeds u32::MAX bytes"))?;
        Ok(Header {
            serial: self.serial,
            payload_len,
            kind: self.kind,
            command: self.command.clone(),
        })
    }

    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = self.header()?.encode();
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn exception_text(&self) -> Result<String> {
        String::from_utf8(self.payload.to_vec())
            .map_err(|_| FusionError::protocol("exception payload is not valid UTF-8"))
    }
}
