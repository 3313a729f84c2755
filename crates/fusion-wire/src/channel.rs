//! A single TCP connection framed with the fixed 72-byte header
//! (spec §4.1 "Receive contract": read the header, then read exactly
//! `payload_len` more bytes).

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fusion_core::error::{FusionError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::frame::{CommandName, Header, Message, MessageKind, HEADER_LEN};

/// Caps a single payload so a corrupt or hostile peer can't make us
/// allocate unbounded memory for one message.
const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

/// One framed connection, split into independent read/write halves
/// behind a single stream. Reads and writes each take their own lock so
/// a blocked writer never stalls the read loop (mirrors the teacher's
/// channel, minus the pipeline/backpressure machinery this protocol has
/// no use for: every message here is a single bounded-length frame).
pub struct WireChannel {
    stream: AsyncMutex<TcpStream>,
}

impl WireChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: AsyncMutex::new(stream),
        }
    }

    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| FusionError::protocol_io("connect failed", err))?;
        Ok(Self::new(stream))
    }

    /// Sends a message in one `write_all` call, per the send contract.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let encoded = message.encode()?;
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&encoded)
            .await
            .map_err(|err| FusionError::protocol_io("write failed", err))?;
        stream
            .flush()
            .await
            .map_err(|err| FusionError::protocol_io("flush failed", err))?;
        Ok(())
    }

    pub async fn send_timeout(&self, message: &Message, deadline: Duration) -> Result<()> {
        timeout(deadline, self.send(message))
            .await
            .map_err(|_| FusionError::provider_communication("", "send timed out"))?
    }

    /// Reads exactly one message: the 72-byte header, then its payload.
    /// Returns `Ok(None)` on a clean EOF with zero bytes read (peer
    /// closed between messages); any other short read is an error.
    pub async fn recv(&self) -> Result<Option<Message>> {
        let mut stream = self.stream.lock().await;
        let mut header_buf = [0u8; HEADER_LEN];
        let mut read = 0usize;
        while read < HEADER_LEN {
            let n = stream
                .read(&mut header_buf[read..])
                .await
                .map_err(|err| FusionError::protocol_io("read failed", err))?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(FusionError::protocol("connection closed mid-header"));
            }
            read += n;
        }
        let header = Header::decode(&header_buf)?;
        if header.payload_len > MAX_PAYLOAD_BYTES {
            return Err(FusionError::protocol(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_BYTES}-byte cap",
                header.payload_len
            )));
        }
        let mut payload = BytesMut::zeroed(header.payload_len as usize);
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| FusionError::protocol_io("payload read failed", err))?;
        Ok(Some(Message {
            serial: header.serial,
            kind: header.kind,
            command: header.command,
            payload: payload.freeze(),
        }))
    }

    pub async fn recv_timeout(&self, deadline: Duration) -> Result<Option<Message>> {
        timeout(deadline, self.recv())
            .await
            .map_err(|_| FusionError::provider_communication("", "recv timed out"))?
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream
            .shutdown()
            .await
            .map_err(|err| FusionError::protocol_io("shutdown failed", err))
    }
}

/// Reads and validates the first message on a freshly accepted
/// connection: it must be `Request("ValidateProtocolVersion", <version>)`
/// carrying a version string equal to `expected` (the version gate every
/// client-to-server connection opens with). A match gets an empty
/// `Reply`; a mismatch or a malformed first message gets an `Exception`
/// whose payload names the mismatch, after which the caller must close
/// the connection.
pub async fn validate_protocol_version(channel: &WireChannel, expected: &str) -> Result<()> {
    let message = channel
        .recv()
        .await?
        .ok_or_else(|| FusionError::protocol("connection closed before the version gate"))?;
    if message.kind != MessageKind::Request || message.command.as_str() != "ValidateProtocolVersion" {
        return Err(FusionError::protocol(
            "first message must be Request(\"ValidateProtocolVersion\", <version>)",
        ));
    }
    let client_version = String::from_utf8_lossy(&message.payload).into_owned();
    if client_version != expected {
        let text = format!(
            "Invalid protocol version: client/server mismatch (server={expected}, client={client_version})"
        );
        let reply = Message::exception(message.serial, message.command.clone(), &text);
        let _ = channel.send(&reply).await;
        return Err(FusionError::protocol(text));
    }
    let reply = Message::reply(message.serial, message.command.clone(), Bytes::new());
    channel.send(&reply).await?;
    Ok(())
}

pub fn empty_payload() -> Bytes {
    Bytes::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_then_recv_round_trips_a_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WireChannel::new(stream);
            let msg = channel.recv().await.unwrap().unwrap();
            assert_eq!(msg.kind, MessageKind::Request);
            assert_eq!(msg.command.as_str(), "Build");
            assert_eq!(&msg.payload[..], b"hello");
        });

        let client = WireChannel::connect(addr).await.unwrap();
        let msg = Message::request(9, CommandName::new("Build").unwrap(), &b"hello"[..]);
        client.send(&msg).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_returns_none_on_clean_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WireChannel::new(stream);
            assert!(channel.recv().await.unwrap().is_none());
        });
        let client = WireChannel::connect(addr).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn validate_protocol_version_rejects_non_request_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WireChannel::new(stream);
            let err = validate_protocol_version(&channel, "1").await.unwrap_err();
            assert!(err.to_string().contains("ValidateProtocolVersion"));
        });
        let client = WireChannel::connect(addr).await.unwrap();
        let msg = Message::notify(CommandName::new("TaskDone").unwrap(), &b""[..]);
        client.send(&msg).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn validate_protocol_version_rejects_mismatched_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WireChannel::new(stream);
            let err = validate_protocol_version(&channel, "1").await.unwrap_err();
            assert!(err.to_string().contains("Invalid protocol version"));
        });
        let client = WireChannel::connect(addr).await.unwrap();
        let msg = Message::request(7, CommandName::new("ValidateProtocolVersion").unwrap(), &b"0.0.0"[..]);
        client.send(&msg).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Exception);
        assert!(reply.exception_text().unwrap().contains("Invalid protocol version"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn validate_protocol_version_accepts_matching_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WireChannel::new(stream);
            validate_protocol_version(&channel, "1").await.unwrap();
        });
        let client = WireChannel::connect(addr).await.unwrap();
        let msg = Message::request(1, CommandName::new("ValidateProtocolVersion").unwrap(), &b"1"[..]);
        client.send(&msg).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Reply);
        server.await.unwrap();
    }
}
