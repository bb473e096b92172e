//! MySQL packet framing
//!
//! ```text
//! [3 bytes: payload length, little endian]
//! [1 byte:  sequence id]
//! [N bytes: payload]
//! ```
//!
//! A payload of exactly `MAX_PACKET_LENGTH` bytes is continued in the next
//! frame; the reader reassembles such chains up to `max_allowed_packet`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{Command, MAX_PACKET_LENGTH};
use crate::core::{ServerError, Timeout};

const HEADER_SIZE: usize = 4;

/// Transport-level read failures. `Closed` is the orderly end of a session.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("connection closed by peer")]
    Closed,
    #[error("timed out reading packet")]
    Timeout,
    #[error("packet larger than max_allowed_packet ({0} bytes)")]
    TooLarge(usize),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PacketError {
    /// Error to flush to the client before dropping the connection, if any.
    #[must_use]
    pub const fn client_error(&self) -> Option<ServerError> {
        match self {
            Self::Closed => None,
            Self::Timeout => Some(ServerError::NetReadTimeout),
            Self::TooLarge(_) => Some(ServerError::PacketTooLarge),
            Self::Malformed(_) => Some(ServerError::MalformedPacket),
            Self::Io(_) => Some(ServerError::NetReadError),
        }
    }
}

/// One decoded client command. Built by the reader, consumed once by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    code: u8,
    payload: Bytes,
}

impl CommandEnvelope {
    #[must_use]
    pub const fn new(code: u8, payload: Bytes) -> Self {
        Self { code, payload }
    }

    /// Splits a raw packet into command byte and arguments. An empty packet
    /// becomes COM_SLEEP.
    #[must_use]
    pub fn from_packet(mut packet: Bytes) -> Self {
        if packet.is_empty() {
            return Self::new(Command::Sleep.code(), Bytes::new());
        }
        let code = packet.get_u8();
        Self::new(code, packet)
    }

    #[must_use]
    pub fn from_command(command: Command, payload: impl Into<Bytes>) -> Self {
        Self::new(command.code(), payload.into())
    }

    #[must_use]
    pub const fn code(&self) -> u8 {
        self.code
    }

    #[must_use]
    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.code)
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Reads framed packets from the client side of a connection.
pub struct PacketReader<R> {
    inner: R,
    next_seq: u8,
    max_allowed_packet: usize,
    idle: Option<Arc<AtomicBool>>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, max_allowed_packet: usize) -> Self {
        Self {
            inner,
            next_seq: 0,
            max_allowed_packet,
            idle: None,
        }
    }

    /// Flag raised while blocked waiting for the first byte of a packet.
    pub fn set_idle_marker(&mut self, idle: Arc<AtomicBool>) {
        self.idle = Some(idle);
    }

    pub fn set_max_allowed_packet(&mut self, max: usize) {
        self.max_allowed_packet = max;
    }

    /// Sequence id the server must use for its first reply packet.
    #[must_use]
    pub const fn reply_seq(&self) -> u8 {
        self.next_seq
    }

    /// Waits for the next command: `idle` bounds the wait for its first
    /// byte, `read` bounds the rest of it.
    pub async fn read_command(
        &mut self,
        idle: Timeout,
        read: Timeout,
    ) -> Result<CommandEnvelope, PacketError> {
        self.next_seq = 0;
        let packet = self.read_packet_with(idle, read).await?;
        Ok(CommandEnvelope::from_packet(packet))
    }

    /// Reads one logical packet (handshake phase), continuing the current
    /// sequence.
    pub async fn read_packet(&mut self, timeout: Timeout) -> Result<Bytes, PacketError> {
        self.read_packet_with(timeout, timeout).await
    }

    async fn read_packet_with(
        &mut self,
        first: Timeout,
        rest: Timeout,
    ) -> Result<Bytes, PacketError> {
        self.mark_idle(true);
        let header = with_timeout(first, read_header(&mut self.inner)).await;
        self.mark_idle(false);

        let Some((mut len, seq)) = header?? else {
            return Err(PacketError::Closed);
        };
        self.check_seq(seq)?;

        // grows only after each frame's claimed length passed the limit
        let mut payload = BytesMut::new();
        loop {
            if payload.len() + len > self.max_allowed_packet {
                return Err(PacketError::TooLarge(self.max_allowed_packet));
            }
            let start = payload.len();
            payload.resize(start + len, 0);
            with_timeout(rest, self.inner.read_exact(&mut payload[start..])).await??;

            if len < MAX_PACKET_LENGTH {
                break;
            }
            let (next_len, next_seq) = with_timeout(rest, read_header(&mut self.inner))
                .await??
                .ok_or_else(|| PacketError::Malformed("connection closed mid-packet".into()))?;
            self.check_seq(next_seq)?;
            len = next_len;
        }

        Ok(payload.freeze())
    }

    fn check_seq(&mut self, seq: u8) -> Result<(), PacketError> {
        if seq != self.next_seq {
            return Err(PacketError::Malformed(format!(
                "packets out of order (got {seq}, expected {})",
                self.next_seq
            )));
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(())
    }

    fn mark_idle(&self, idle: bool) {
        if let Some(flag) = &self.idle {
            flag.store(idle, Ordering::Relaxed);
        }
    }
}

/// `Ok(None)` on a clean EOF before the first header byte.
async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(usize, u8)>, PacketError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PacketError::Malformed("truncated packet header".into()));
        }
        filled += n;
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    Ok(Some((len, header[3])))
}

async fn with_timeout<F, T>(timeout: Timeout, fut: F) -> Result<T, PacketError>
where
    F: std::future::Future<Output = T>,
{
    match timeout.as_duration() {
        None => Ok(fut.await),
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PacketError::Timeout),
    }
}

/// Appends `payload` as one or more frames starting at `seq`; returns the
/// next sequence id.
pub fn write_frames(out: &mut BytesMut, payload: &[u8], mut seq: u8) -> u8 {
    let mut remaining = payload;
    loop {
        let chunk = remaining.len().min(MAX_PACKET_LENGTH);
        let len = (chunk as u32).to_le_bytes();
        out.put_slice(&len[..3]);
        out.put_u8(seq);
        out.put_slice(&remaining[..chunk]);
        seq = seq.wrapping_add(1);
        remaining = &remaining[chunk..];
        // A full-length frame must be followed by another, possibly empty.
        if chunk < MAX_PACKET_LENGTH {
            return seq;
        }
    }
}

/// Writes already-framed bytes and flushes.
pub async fn send_frames<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frames: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frames).await?;
    writer.flush().await
}

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 0x1_0000 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 0x100_0000 {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_str(buf: &mut BytesMut, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn put_null_str(buf: &mut BytesMut, data: &str) {
    buf.put_slice(data.as_bytes());
    buf.put_u8(0);
}

// Payload decoding helpers. A short payload is a statement-level error, not
// a transport failure.

fn need(buf: &Bytes, n: usize) -> Result<(), ServerError> {
    if buf.remaining() < n {
        Err(ServerError::MalformedPacket)
    } else {
        Ok(())
    }
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, ServerError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16, ServerError> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32, ServerError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64, ServerError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_bytes(buf: &mut Bytes, n: usize) -> Result<Bytes, ServerError> {
    need(buf, n)?;
    Ok(buf.split_to(n))
}

pub fn get_lenenc_int(buf: &mut Bytes) -> Result<u64, ServerError> {
    match get_u8(buf)? {
        first @ 0..=250 => Ok(u64::from(first)),
        0xFC => get_u16(buf).map(u64::from),
        0xFD => {
            need(buf, 3)?;
            Ok(buf.get_uint_le(3))
        }
        0xFE => get_u64(buf),
        _ => Err(ServerError::MalformedPacket),
    }
}

pub fn get_lenenc_bytes(buf: &mut Bytes) -> Result<Bytes, ServerError> {
    let len = get_lenenc_int(buf)?;
    let len = usize::try_from(len).map_err(|_| ServerError::MalformedPacket)?;
    get_bytes(buf, len)
}

/// NUL-terminated string; a missing terminator consumes the rest.
pub fn get_null_str(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let s = buf.split_to(end);
    if buf.has_remaining() {
        buf.advance(1);
    }
    String::from_utf8_lossy(&s).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(payload: &[u8], seq: u8) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_frames(&mut out, payload, seq);
        out.to_vec()
    }

    #[tokio::test]
    async fn test_read_simple_command() {
        let (mut client, server) = duplex(1024);
        client.write_all(&frame(b"\x03SELECT 1", 0)).await.unwrap();

        let mut reader = PacketReader::new(server, 1024);
        let env = reader
            .read_command(Timeout::from_seconds(1), Timeout::from_seconds(1))
            .await
            .unwrap();
        assert_eq!(env.command(), Some(Command::Query));
        assert_eq!(&env.payload()[..], b"SELECT 1");
        assert_eq!(reader.reply_seq(), 1);
    }

    #[tokio::test]
    async fn test_zero_length_packet_is_sleep() {
        let (mut client, server) = duplex(64);
        client.write_all(&frame(b"", 0)).await.unwrap();

        let mut reader = PacketReader::new(server, 1024);
        let env = reader
            .read_command(Timeout::infinite(), Timeout::infinite())
            .await
            .unwrap();
        assert_eq!(env.command(), Some(Command::Sleep));
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_is_distinct() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = PacketReader::new(server, 1024);
        let err = reader
            .read_command(Timeout::infinite(), Timeout::infinite())
            .await
            .unwrap_err();
        assert!(matches!(err, PacketError::Closed));
        assert!(err.client_error().is_none());
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let (mut client, server) = duplex(4096);
        client.write_all(&frame(&[3u8; 200], 0)).await.unwrap();
        let mut reader = PacketReader::new(server, 100);
        let err = reader
            .read_command(Timeout::infinite(), Timeout::infinite())
            .await
            .unwrap_err();
        assert!(matches!(err, PacketError::TooLarge(100)));
        assert_eq!(err.client_error(), Some(ServerError::PacketTooLarge));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected_before_payload() {
        let (mut client, server) = duplex(64);
        // claims a full 16 MiB frame but never sends it
        client.write_all(&[0xff, 0xff, 0xff, 0]).await.unwrap();
        let mut reader = PacketReader::new(server, 1024);
        let err = reader
            .read_command(Timeout::from_seconds(1), Timeout::from_seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PacketError::TooLarge(1024)));
    }

    #[tokio::test]
    async fn test_out_of_order_sequence_is_malformed() {
        let (mut client, server) = duplex(64);
        client.write_all(&frame(b"\x0e", 5)).await.unwrap();
        let mut reader = PacketReader::new(server, 1024);
        let err = reader
            .read_command(Timeout::infinite(), Timeout::infinite())
            .await
            .unwrap_err();
        assert!(matches!(err, PacketError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_idle_marker_raised_only_while_waiting() {
        let (mut client, server) = duplex(64);
        let idle = Arc::new(AtomicBool::new(false));
        let mut reader = PacketReader::new(server, 1024);
        reader.set_idle_marker(Arc::clone(&idle));

        let read = tokio::spawn(async move {
            let env = reader.read_command(Timeout::infinite(), Timeout::infinite()).await;
            (reader, env)
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(idle.load(Ordering::Relaxed));

        client.write_all(&frame(b"\x0e", 0)).await.unwrap();
        let (_reader, env) = read.await.unwrap();
        assert_eq!(env.unwrap().command(), Some(Command::Ping));
        assert!(!idle.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_client, server) = duplex(64);
        let mut reader = PacketReader::new(server, 1024);
        let err = reader
            .read_command(Timeout::from_millis(20), Timeout::infinite())
            .await
            .unwrap_err();
        assert!(matches!(err, PacketError::Timeout));
    }

    #[tokio::test]
    async fn test_multi_frame_reassembly() {
        let payload = vec![7u8; MAX_PACKET_LENGTH + 10];
        let framed = frame(&payload, 0);
        let (mut client, server) = duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            client.write_all(&framed).await.unwrap();
            client
        });
        let mut reader = PacketReader::new(server, MAX_PACKET_LENGTH * 2);
        let packet = reader.read_packet(Timeout::from_seconds(5)).await.unwrap();
        assert_eq!(packet.len(), MAX_PACKET_LENGTH + 10);
        assert_eq!(reader.reply_seq(), 2);
        writer.await.unwrap();
    }

    #[test]
    fn test_lenenc_round_trip() {
        let mut buf = BytesMut::new();
        for v in [0u64, 250, 251, 65_535, 65_536, 0x00FF_FFFF, 0x0100_0000] {
            put_lenenc_int(&mut buf, v);
        }
        let mut bytes = buf.freeze();
        for v in [0u64, 250, 251, 65_535, 65_536, 0x00FF_FFFF, 0x0100_0000] {
            assert_eq!(get_lenenc_int(&mut bytes).unwrap(), v);
        }
        assert_eq!(get_u8(&mut bytes), Err(ServerError::MalformedPacket));
    }

    #[test]
    fn test_full_length_payload_gets_empty_trailer() {
        let mut out = BytesMut::new();
        let next = write_frames(&mut out, &vec![0u8; MAX_PACKET_LENGTH], 0);
        assert_eq!(next, 2);
        assert_eq!(out.len(), 2 * HEADER_SIZE + MAX_PACKET_LENGTH);
    }
}
