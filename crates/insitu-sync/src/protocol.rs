//! Wire protocol between analysis daemons and the parameter server.
//!
//! Every message is a fixed 24-byte header of six little-endian `i32`
//! followed by `size` bytes of body:
//!
//! ```text
//!   0        4        8        12       16       20       24
//!   ┌────────┬────────┬────────┬────────┬────────┬────────┬──────────┐
//!   │  src   │  dst   │  type  │  kind  │  size  │ frame  │ body ... │
//!   └────────┴────────┴────────┴────────┴────────┴────────┴──────────┘
//! ```
//!
//! Replies carry the request type plus [`REPLY_OFFSET`], the request's
//! kind and frame, and swap `src`/`dst`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SyncError, SyncResult};

/// Header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Added to a request type to obtain its reply type.
pub const REPLY_OFFSET: i32 = 10;

/// Default upper bound on a message body.
pub const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;

/// Request and reply types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    ReqAdd = 1,
    ReqGet = 2,
    ReqCmd = 3,
    ReqQuit = 4,
    ReqEcho = 5,
    RepAdd = 11,
    RepGet = 12,
    RepCmd = 13,
    RepQuit = 14,
    RepEcho = 15,
    RepError = 99,
}

impl MessageType {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::ReqAdd,
            2 => Self::ReqGet,
            3 => Self::ReqCmd,
            4 => Self::ReqQuit,
            5 => Self::ReqEcho,
            11 => Self::RepAdd,
            12 => Self::RepGet,
            13 => Self::RepCmd,
            14 => Self::RepQuit,
            15 => Self::RepEcho,
            99 => Self::RepError,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_request(self) -> bool {
        (1..REPLY_OFFSET).contains(&self.as_i32())
    }

    /// Reply type for a request; `None` for replies.
    pub fn reply(self) -> Option<Self> {
        if self.is_request() {
            Self::from_i32(self.as_i32() + REPLY_OFFSET)
        } else {
            None
        }
    }
}

/// Which subsystem a message addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Default = 0,
    Parameters = 1,
    AnomalyStats = 2,
    CounterStats = 3,
    FunctionIndex = 4,
    AnomalyMetrics = 5,
    AdPsCombinedStats = 6,
    Cmd = 7,
}

impl MessageKind {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Default,
            1 => Self::Parameters,
            2 => Self::AnomalyStats,
            3 => Self::CounterStats,
            4 => Self::FunctionIndex,
            5 => Self::AnomalyMetrics,
            6 => Self::AdPsCombinedStats,
            7 => Self::Cmd,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Fixed-size message header. Type and kind are kept raw so that unknown
/// values can still be answered with an error reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub src: i32,
    pub dst: i32,
    pub msg_type: i32,
    pub kind: i32,
    pub size: i32,
    pub frame: i32,
}

impl Header {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.src);
        buf.put_i32_le(self.dst);
        buf.put_i32_le(self.msg_type);
        buf.put_i32_le(self.kind);
        buf.put_i32_le(self.size);
        buf.put_i32_le(self.frame);
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> SyncResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(SyncError::Protocol(format!(
                "short header: {} of {HEADER_LEN} bytes",
                buf.len()
            )));
        }
        let header = Self::from_wire(&buf[..HEADER_LEN]);
        if header.size < 0 {
            return Err(SyncError::Protocol(format!(
                "negative body size {}",
                header.size
            )));
        }
        Ok(header)
    }

    fn from_wire(mut buf: &[u8]) -> Self {
        Header {
            src: buf.get_i32_le(),
            dst: buf.get_i32_le(),
            msg_type: buf.get_i32_le(),
            kind: buf.get_i32_le(),
            size: buf.get_i32_le(),
            frame: buf.get_i32_le(),
        }
    }

    /// Reject negative sizes and bodies over `max_body`.
    pub fn check_size(&self, max_body: usize) -> SyncResult<()> {
        if self.size < 0 {
            return Err(SyncError::Protocol(format!(
                "negative body size {}",
                self.size
            )));
        }
        let size = self.body_len();
        if size > max_body {
            return Err(SyncError::BodyTooLarge {
                size,
                max: max_body,
            });
        }
        Ok(())
    }

    pub fn body_len(&self) -> usize {
        self.size.max(0) as usize
    }

    pub fn message_type(&self) -> SyncResult<MessageType> {
        MessageType::from_i32(self.msg_type).ok_or(SyncError::UnknownMessageType(self.msg_type))
    }

    pub fn message_kind(&self) -> SyncResult<MessageKind> {
        MessageKind::from_i32(self.kind).ok_or(SyncError::UnknownMessageKind(self.kind))
    }
}

/// A framed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Bytes,
}

impl Message {
    pub fn new(
        src: i32,
        dst: i32,
        msg_type: MessageType,
        kind: MessageKind,
        frame: i32,
        body: impl Into<Bytes>,
    ) -> Self {
        let body = body.into();
        Self {
            header: Header {
                src,
                dst,
                msg_type: msg_type.as_i32(),
                kind: kind.as_i32(),
                size: body.len() as i32,
                frame,
            },
            body,
        }
    }

    /// Reply to this message with the given type, keeping kind and frame.
    pub fn reply(&self, msg_type: MessageType, body: impl Into<Bytes>) -> Message {
        let body = body.into();
        Message {
            header: Header {
                src: self.header.dst,
                dst: self.header.src,
                msg_type: msg_type.as_i32(),
                kind: self.header.kind,
                size: body.len() as i32,
                frame: self.header.frame,
            },
            body,
        }
    }

    pub fn message_type(&self) -> SyncResult<MessageType> {
        self.header.message_type()
    }

    pub fn message_kind(&self) -> SyncResult<MessageKind> {
        self.header.message_kind()
    }

    /// The distinguished shutdown request: `ReqQuit` with an empty body.
    pub fn is_quit(&self) -> bool {
        self.header.msg_type == MessageType::ReqQuit.as_i32() && self.body.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode one complete frame; trailing bytes are an error.
    pub fn decode(buf: &[u8]) -> SyncResult<Self> {
        let header = Header::decode(buf)?;
        let body = &buf[HEADER_LEN..];
        if body.len() != header.body_len() {
            return Err(SyncError::Protocol(format!(
                "body length {} does not match header size {}",
                body.len(),
                header.size
            )));
        }
        Ok(Message {
            header,
            body: Bytes::copy_from_slice(body),
        })
    }
}

/// Read one message. Returns `Ok(None)` on a clean end of stream before a
/// header starts.
pub async fn read_message<R>(reader: &mut R, max_body: usize) -> SyncResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let Some(header) = read_header(reader).await? else {
        return Ok(None);
    };
    let body = read_body(reader, &header, max_body).await?;
    Ok(Some(Message { header, body }))
}

/// Read the next header. The size field is returned as sent; it is checked
/// by [`read_body`]. Returns `Ok(None)` on a clean end of stream.
pub async fn read_header<R>(reader: &mut R) -> SyncResult<Option<Header>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(SyncError::Disconnected)
            };
        }
        filled += n;
    }
    Ok(Some(Header::from_wire(&head)))
}

/// Read the body announced by `header`.
pub async fn read_body<R>(reader: &mut R, header: &Header, max_body: usize) -> SyncResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    header.check_size(max_body)?;
    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body).await.map_err(eof_as_disconnect)?;
    Ok(Bytes::from(body))
}

/// Skip `size` body bytes, keeping the stream aligned on the next header.
pub async fn discard_body<R>(reader: &mut R, size: usize) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
{
    let skipped = tokio::io::copy(&mut (&mut *reader).take(size as u64), &mut tokio::io::sink()).await?;
    if skipped < size as u64 {
        return Err(SyncError::Disconnected);
    }
    Ok(())
}

fn eof_as_disconnect(e: std::io::Error) -> SyncError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SyncError::Disconnected
    } else {
        SyncError::Io(e)
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}
