//! `OP_MSG` Wire Codec and TCP Transport
//!
//! Every message is a 16-byte little-endian header followed by a body:
//!
//! ```text
//! int32 messageLength | int32 requestID | int32 responseTo | int32 opCode (2013)
//! uint32 flagBits
//! section*: kind 0 -> one BSON document
//!           kind 1 -> int32 size, cstring identifier, BSON documents
//! [uint32 checksum]   when flagBits bit 0 is set
//! ```
//!
//! Requests carry a single kind-0 section. Replies may also carry kind-1
//! sections, which are skipped. Checksums are never sent and are ignored on
//! receipt.

use async_trait::async_trait;
use bson::Document;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Connector, ServerDescription, Transport};
use crate::error::{DocpoolError, Result};
use crate::uri::Endpoint;

/// Opcode of `OP_MSG`
pub const OP_MSG: i32 = 2013;

/// Length of the standard message header
pub const HEADER_LEN: usize = 16;

/// Bytes an `OP_MSG` frame adds around a single kind-0 body
pub const OP_MSG_OVERHEAD: usize = HEADER_LEN + 4 + 1;

/// Largest message accepted before the handshake reports a limit
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

const CHECKSUM_PRESENT: u32 = 1;
const MORE_TO_COME: u32 = 1 << 1;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate a process-unique request id
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Standard message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let field = |at: usize| {
            i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self { length: field(0), request_id: field(4), response_to: field(8), op_code: field(12) }
    }
}

/// Encode `body` as a complete `OP_MSG` frame
pub fn encode_op_msg(request_id: i32, response_to: i32, body: &Document) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    body.to_writer(&mut payload)?;

    let length = OP_MSG_OVERHEAD + payload.len();
    let length = i32::try_from(length)
        .map_err(|_| {
            DocpoolError::invalid_input(format!("message of {length} bytes is too large"))
        })?;

    let mut frame = Vec::with_capacity(length as usize);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&request_id.to_le_bytes());
    frame.extend_from_slice(&response_to.to_le_bytes());
    frame.extend_from_slice(&OP_MSG.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.push(0);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one `OP_MSG` frame and return its header and body document
///
/// Any framing problem is a [`DocpoolError::TransportFailure`]: the stream
/// position can no longer be trusted.
pub async fn read_op_msg<R>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<(MessageHeader, Document)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(io_failure)?;
    let header = MessageHeader::from_bytes(&header);

    let length = usize::try_from(header.length).unwrap_or(0);
    if length < HEADER_LEN + 5 || length > max_message_size {
        return Err(DocpoolError::transport_failure(format!(
            "invalid message length {}",
            header.length
        )));
    }
    if header.op_code != OP_MSG {
        return Err(DocpoolError::transport_failure(format!(
            "unsupported opcode {}",
            header.op_code
        )));
    }

    let mut body = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut body).await.map_err(io_failure)?;
    let document = decode_body(&body)?;
    Ok((header, document))
}

fn decode_body(body: &[u8]) -> Result<Document> {
    let flags = le_u32(body).ok_or_else(|| malformed("missing flag bits"))?;
    if flags & MORE_TO_COME != 0 {
        return Err(malformed("streamed replies are not supported"));
    }

    let mut sections = &body[4..];
    if flags & CHECKSUM_PRESENT != 0 {
        let end = sections.len().checked_sub(4).ok_or_else(|| malformed("truncated checksum"))?;
        sections = &sections[..end];
    }

    let mut document = None;
    while let Some((&kind, rest)) = sections.split_first() {
        let size = le_u32(rest).ok_or_else(|| malformed("truncated section"))? as usize;
        if size < 5 || size > rest.len() {
            return Err(malformed("section length out of range"));
        }
        match kind {
            0 => {
                let mut bytes = &rest[..size];
                let parsed = Document::from_reader(&mut bytes)
                    .map_err(|e| malformed(&format!("invalid body document: {e}")))?;
                if document.replace(parsed).is_some() {
                    return Err(malformed("more than one body section"));
                }
            }
            1 => {}
            other => return Err(malformed(&format!("unknown section kind {other}"))),
        }
        sections = &rest[size..];
    }

    document.ok_or_else(|| malformed("no body section"))
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(word))
}

fn malformed(detail: &str) -> DocpoolError {
    DocpoolError::transport_failure(format!("malformed OP_MSG: {detail}"))
}

fn io_failure(err: std::io::Error) -> DocpoolError {
    DocpoolError::transport_failure(err.to_string())
}

/// `OP_MSG` over a TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    max_message_size: usize,
}

impl TcpTransport {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { stream: Some(stream), max_message_size: DEFAULT_MAX_MESSAGE_SIZE }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn round_trip(&mut self, request: &Document) -> Result<Document> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DocpoolError::transport_failure("stream already shut down"))?;

        let request_id = next_request_id();
        let frame = encode_op_msg(request_id, 0, request)?;
        if frame.len() > self.max_message_size {
            return Err(DocpoolError::invalid_input(format!(
                "message of {} bytes exceeds the server limit of {} bytes",
                frame.len(),
                self.max_message_size
            )));
        }
        stream.write_all(&frame).await.map_err(io_failure)?;
        stream.flush().await.map_err(io_failure)?;

        let (header, reply) = read_op_msg(stream, self.max_message_size).await?;
        if header.response_to != request_id {
            return Err(DocpoolError::transport_failure(format!(
                "reply to request {} received while waiting for {request_id}",
                header.response_to
            )));
        }
        Ok(reply)
    }

    fn apply_limits(&mut self, server: &ServerDescription) {
        self.max_message_size = server.max_message_size_bytes;
    }

    fn shutdown(&mut self) {
        // dropping the stream closes the socket
        self.stream = None;
    }
}

/// Opens [`TcpTransport`]s with `TCP_NODELAY` set
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(endpoint.address())
            .await
            .map_err(|e| DocpoolError::connect_failure(format!("{endpoint}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DocpoolError::connect_failure(format!("{endpoint}: {e}")))?;
        Ok(Box::new(TcpTransport::new(stream)))
    }
}
