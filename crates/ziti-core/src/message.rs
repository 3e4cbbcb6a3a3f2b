//! Edge wire message encoding and decoding.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! +----------+--------------+-----+-------------+----------+---------+------+
//! | magic(4) | content(i32) | seq | headers_len | body_len | headers | body |
//! +----------+--------------+-----+-------------+----------+---------+------+
//!
//! header := id(i32) len(i32) value(len bytes)
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    ContentType, FRAME_HEADER_SIZE, MAGIC, MAX_BODY_LEN, MAX_HEADERS, MAX_HEADERS_LEN, header,
};

/// Message codec errors
#[derive(Debug, Error)]
pub enum MessageError {
    /// Frame violates the wire format or its size caps
    #[error("malformed frame: {0}")]
    Malformed(Cow<'static, str>),

    /// Transport read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn malformed(msg: &'static str) -> MessageError {
    MessageError::Malformed(Cow::Borrowed(msg))
}

/// One framed edge message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Content type
    pub content_type: ContentType,
    /// Channel sequence number, assigned by the channel at enqueue time
    pub seq: i32,
    headers: BTreeMap<i32, Vec<u8>>,
    /// Payload
    pub body: Vec<u8>,
}

impl Message {
    /// Create an empty message of the given type.
    #[must_use]
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            seq: 0,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Set the body (builder style).
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a raw header (builder style).
    #[must_use]
    pub fn with_header(mut self, id: i32, value: impl Into<Vec<u8>>) -> Self {
        self.set_header(id, value);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Constructors
    // ═══════════════════════════════════════════════════════════════════════

    /// Channel hello carrying the identity name, API session token and the
    /// client's key agreement public key.
    #[must_use]
    pub fn hello(identity_name: &str, session_token: &str, public_key: &[u8]) -> Self {
        Self::new(ContentType::Hello)
            .with_body(identity_name.as_bytes())
            .with_header(header::SESSION_TOKEN, session_token.as_bytes())
            .with_header(header::PUBLIC_KEY, public_key)
    }

    /// Generic RESULT reply.
    #[must_use]
    pub fn result(reply_for: i32, success: bool, body: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(ContentType::Result).with_body(body);
        msg.set_i32_header(header::REPLY_FOR, reply_for);
        msg.set_bool_header(header::RESULT_SUCCESS, success);
        msg
    }

    /// CONNECT request for a new virtual connection.
    #[must_use]
    pub fn connect(conn_id: u32, session_token: &str, stream_header: &[u8]) -> Self {
        let mut msg = Self::new(ContentType::Connect)
            .with_header(header::SESSION_TOKEN, session_token.as_bytes())
            .with_header(header::PUBLIC_KEY, stream_header);
        msg.set_u32_header(header::CONN_ID, conn_id);
        msg
    }

    /// DATA frame for a virtual connection.
    #[must_use]
    pub fn data(conn_id: u32, seq: i32, payload: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(ContentType::Data).with_body(payload);
        msg.set_u32_header(header::CONN_ID, conn_id);
        msg.set_i32_header(header::SEQ, seq);
        msg
    }

    /// STATE_CLOSED frame, with an optional reason in the body.
    #[must_use]
    pub fn state_closed(conn_id: u32, reason: &str) -> Self {
        let mut msg = Self::new(ContentType::StateClosed).with_body(reason.as_bytes());
        msg.set_u32_header(header::CONN_ID, conn_id);
        msg
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Headers
    // ═══════════════════════════════════════════════════════════════════════

    /// Set a raw header, replacing any previous value.
    pub fn set_header(&mut self, id: i32, value: impl Into<Vec<u8>>) {
        self.headers.insert(id, value.into());
    }

    /// Set an `i32` header.
    pub fn set_i32_header(&mut self, id: i32, value: i32) {
        self.set_header(id, value.to_le_bytes());
    }

    /// Set a `u32` header.
    pub fn set_u32_header(&mut self, id: i32, value: u32) {
        self.set_header(id, value.to_le_bytes());
    }

    /// Set a boolean header (one byte).
    pub fn set_bool_header(&mut self, id: i32, value: bool) {
        self.set_header(id, [u8::from(value)]);
    }

    /// Raw header value.
    #[must_use]
    pub fn header(&self, id: i32) -> Option<&[u8]> {
        self.headers.get(&id).map(Vec::as_slice)
    }

    /// `i32` header, if present and four bytes long.
    #[must_use]
    pub fn i32_header(&self, id: i32) -> Option<i32> {
        let raw: [u8; 4] = self.header(id)?.try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }

    /// `u32` header, if present and four bytes long.
    #[must_use]
    pub fn u32_header(&self, id: i32) -> Option<u32> {
        let raw: [u8; 4] = self.header(id)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Boolean header: present and first byte non-zero.
    #[must_use]
    pub fn bool_header(&self, id: i32) -> Option<bool> {
        self.header(id)?.first().map(|b| *b != 0)
    }

    /// UTF-8 header value.
    #[must_use]
    pub fn str_header(&self, id: i32) -> Option<&str> {
        std::str::from_utf8(self.header(id)?).ok()
    }

    /// Number of headers.
    #[must_use]
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// The `ReplyFor` header.
    #[must_use]
    pub fn reply_for(&self) -> Option<i32> {
        self.i32_header(header::REPLY_FOR)
    }

    /// The `ConnId` header.
    #[must_use]
    pub fn conn_id(&self) -> Option<u32> {
        self.u32_header(header::CONN_ID)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Encoding
    // ═══════════════════════════════════════════════════════════════════════

    fn headers_len(&self) -> usize {
        self.headers.values().map(|v| 8 + v.len()).sum()
    }

    /// Encode into a complete frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let headers_len = self.headers_len();
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + headers_len + self.body.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&i32::from(self.content_type).to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&(headers_len as i32).to_le_bytes());
        out.extend_from_slice(&(self.body.len() as i32).to_le_bytes());
        for (id, value) in &self.headers {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(value.len() as i32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode exactly one frame from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Malformed`] if the buffer is not exactly one
    /// well-formed frame within the size caps.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(malformed("truncated frame header"));
        }
        let prefix: &[u8; FRAME_HEADER_SIZE] = buf[..FRAME_HEADER_SIZE]
            .try_into()
            .map_err(|_| malformed("truncated frame header"))?;
        let (content_type, seq, headers_len, body_len) = parse_prefix(prefix)?;

        let rest = &buf[FRAME_HEADER_SIZE..];
        if rest.len() != headers_len + body_len {
            return Err(malformed("frame length mismatch"));
        }
        let headers = parse_headers(&rest[..headers_len])?;
        Ok(Self {
            content_type,
            seq,
            headers,
            body: rest[headers_len..].to_vec(),
        })
    }

    /// Read one frame from `reader`.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Malformed`] for framing violations and
    /// [`MessageError::Io`] for transport failures, including end of stream
    /// inside a frame.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
    ) -> Result<Option<Self>, MessageError> {
        let mut prefix = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }

        let (content_type, seq, headers_len, body_len) = parse_prefix(&prefix)?;

        let mut raw_headers = vec![0u8; headers_len];
        reader.read_exact(&mut raw_headers).await?;
        let headers = parse_headers(&raw_headers)?;

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        Ok(Some(Self {
            content_type,
            seq,
            headers,
            body,
        }))
    }

    /// Write this frame to `writer` in a single buffered write.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Io`] if the write fails.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<(), MessageError> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(raw)
}

fn parse_prefix(
    prefix: &[u8; FRAME_HEADER_SIZE],
) -> Result<(ContentType, i32, usize, usize), MessageError> {
    if prefix[..4] != MAGIC {
        return Err(malformed("bad magic"));
    }
    let content_type = ContentType::from(read_i32(prefix, 4));
    let seq = read_i32(prefix, 8);
    let headers_len =
        usize::try_from(read_i32(prefix, 12)).map_err(|_| malformed("negative headers length"))?;
    let body_len =
        usize::try_from(read_i32(prefix, 16)).map_err(|_| malformed("negative body length"))?;

    if headers_len > MAX_HEADERS_LEN {
        return Err(malformed("headers section too large"));
    }
    if body_len > MAX_BODY_LEN {
        return Err(malformed("body too large"));
    }
    Ok((content_type, seq, headers_len, body_len))
}

fn parse_headers(mut raw: &[u8]) -> Result<BTreeMap<i32, Vec<u8>>, MessageError> {
    let mut headers = BTreeMap::new();
    let mut count = 0usize;
    while !raw.is_empty() {
        if raw.len() < 8 {
            return Err(malformed("truncated header"));
        }
        count += 1;
        if count > MAX_HEADERS {
            return Err(malformed("too many headers"));
        }
        let id = read_i32(raw, 0);
        let len = usize::try_from(read_i32(raw, 4)).map_err(|_| malformed("negative header length"))?;
        raw = &raw[8..];
        if raw.len() < len {
            return Err(malformed("header value overruns section"));
        }
        headers.insert(id, raw[..len].to_vec());
        raw = &raw[len..];
    }
    Ok(headers)
}
