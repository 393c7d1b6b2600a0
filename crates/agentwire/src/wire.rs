//! Wire framing for requests and responses.
//!
//! Every frame starts with its own length so a reader can find the frame
//! boundary under partial reads without help from the application.
//!
//! # Request frame (client -> agent)
//!
//! ```text
//! +--------+------+---------+----------+------------------+
//! | Size   | Kind | Version | Sequence | Payload          |
//! | 4 bytes| 1    | 4 bytes | 8 bytes  | variable         |
//! | BE u32 | u8   | BE u32  | BE u64   | opaque           |
//! +--------+------+---------+----------+------------------+
//! ```
//!
//! # Response frame (agent -> client)
//!
//! ```text
//! +--------+----------+--------+------------------+
//! | Size   | Sequence | Status | Payload          |
//! | 4 bytes| 8 bytes  | 1 byte | variable         |
//! | BE u32 | BE u64   | u8     | opaque           |
//! +--------+----------+--------+------------------+
//! ```
//!
//! `Size` counts the bytes after the size field itself. On a success status
//! the payload is the call-specific response; on an error status it is a
//! `BE u16` error code followed by a UTF-8 message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use agentwire_common::{RpcError, RpcResult};

/// Interface version spoken when callers do not pick one.
pub const PROTOCOL_VERSION: u32 = 1;

const SIZE_LEN: usize = 4;
/// kind + version + sequence
const REQUEST_HEADER_LEN: usize = 1 + 4 + 8;
/// sequence + status
const RESPONSE_HEADER_LEN: usize = 8 + 1;

/// Per-connection tag matching a response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Return the current value and advance.
    pub fn next(&mut self) -> SequenceNumber {
        let current = *self;
        self.0 = self.0.wrapping_add(1);
        current
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a request frame asks the agent to do.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Execute a call
    Call = 0x01,
    /// The caller no longer wants the answer to `sequence`
    Cancel = 0x02,
}

impl TryFrom<u8> for RequestKind {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(RequestKind::Call),
            0x02 => Ok(RequestKind::Cancel),
            _ => Err(RpcError::InvalidMessage(format!(
                "Unknown request kind: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Generic outcome shared by every call type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0x00,
    Error = 0x01,
}

impl TryFrom<u8> for Status {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, RpcError> {
        match value {
            0x00 => Ok(Status::Success),
            0x01 => Ok(Status::Error),
            _ => Err(RpcError::InvalidMessage(format!(
                "Unknown response status: 0x{:02x}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Bytes following the size field
    pub size: u32,
    pub kind: RequestKind,
    pub version: u32,
    pub sequence: SequenceNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Bytes following the size field
    pub size: u32,
    pub sequence: SequenceNumber,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn call(version: u32, sequence: SequenceNumber, payload: Bytes) -> Self {
        Self {
            header: RequestHeader {
                size: (REQUEST_HEADER_LEN + payload.len()) as u32,
                kind: RequestKind::Call,
                version,
                sequence,
            },
            payload,
        }
    }

    pub fn cancel(version: u32, sequence: SequenceNumber) -> Self {
        Self {
            header: RequestHeader {
                size: REQUEST_HEADER_LEN as u32,
                kind: RequestKind::Cancel,
                version,
                sequence,
            },
            payload: Bytes::new(),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.header.sequence
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn success(sequence: SequenceNumber, payload: Bytes) -> Self {
        Self {
            header: ResponseHeader {
                size: (RESPONSE_HEADER_LEN + payload.len()) as u32,
                sequence,
                status: Status::Success,
            },
            payload,
        }
    }

    pub fn failure(sequence: SequenceNumber, error: &RpcError) -> Self {
        let message = error.wire_message();
        let mut payload = BytesMut::with_capacity(2 + message.len());
        payload.put_u16(error.wire_code());
        payload.put_slice(message.as_bytes());
        let payload = payload.freeze();
        Self {
            header: ResponseHeader {
                size: (RESPONSE_HEADER_LEN + payload.len()) as u32,
                sequence,
                status: Status::Error,
            },
            payload,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.header.sequence
    }

    /// Split into the success payload or the error it carries.
    pub fn into_result(self) -> RpcResult<Bytes> {
        match self.header.status {
            Status::Success => Ok(self.payload),
            Status::Error => {
                let mut payload = self.payload;
                if payload.len() < 2 {
                    return Err(RpcError::InvalidMessage(
                        "Error response without error code".to_string(),
                    ));
                }
                let code = payload.get_u16();
                let message = String::from_utf8_lossy(&payload).into_owned();
                Err(RpcError::from_wire(code, message))
            }
        }
    }
}

/// Read the size prefix and check it against the frame limits.
///
/// Returns the total frame length (prefix included) once the whole frame is
/// buffered.
fn complete_frame_len(src: &mut BytesMut, min_body: usize, max: usize) -> RpcResult<Option<usize>> {
    if src.len() < SIZE_LEN {
        return Ok(None);
    }
    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if size < min_body {
        return Err(RpcError::InvalidMessage(format!(
            "Frame size {} shorter than header ({} bytes)",
            size, min_body
        )));
    }
    if size > max {
        return Err(RpcError::MessageTooLarge { size, max });
    }
    let total = SIZE_LEN + size;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    Ok(Some(total))
}

/// Codec for request frames.
///
/// Agents decode with it, clients encode with it.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_message_size: usize,
}

impl RequestCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Kind of the next frame, if its header has arrived.
    pub fn peek_kind(src: &[u8]) -> Option<u8> {
        src.get(SIZE_LEN).copied()
    }

    /// Whether `src` starts with a complete cancel frame.
    pub fn next_is_cancel(src: &[u8]) -> bool {
        Self::peek_kind(src) == Some(RequestKind::Cancel as u8)
            && src.len() >= SIZE_LEN + REQUEST_HEADER_LEN
    }

    /// Sequences named by the complete cancel frames buffered in `src`,
    /// without consuming anything. Stops at the first partial or malformed
    /// frame.
    pub fn buffered_cancels(src: &[u8]) -> Vec<SequenceNumber> {
        let mut cancels = Vec::new();
        let mut rest = src;
        while rest.len() >= SIZE_LEN {
            let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if size < REQUEST_HEADER_LEN || rest.len() < SIZE_LEN + size {
                break;
            }
            if rest[SIZE_LEN] == RequestKind::Cancel as u8 {
                let mut header = &rest[SIZE_LEN + 1 + 4..];
                cancels.push(SequenceNumber(header.get_u64()));
            }
            rest = &rest[SIZE_LEN + size..];
        }
        cancels
    }
}

impl Decoder for RequestCodec {
    type Item = RequestFrame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = complete_frame_len(src, REQUEST_HEADER_LEN, self.max_message_size)?
        else {
            return Ok(None);
        };

        let mut frame = src.split_to(total).freeze();
        let size = frame.get_u32();
        let kind = RequestKind::try_from(frame.get_u8())?;
        let version = frame.get_u32();
        let sequence = SequenceNumber(frame.get_u64());

        trace!(
            kind = ?kind,
            version = version,
            sequence = sequence.0,
            payload_len = frame.len(),
            "Decoded request frame"
        );

        Ok(Some(RequestFrame {
            header: RequestHeader {
                size,
                kind,
                version,
                sequence,
            },
            payload: frame,
        }))
    }
}

impl Encoder<RequestFrame> for RequestCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = REQUEST_HEADER_LEN + frame.payload.len();
        if size > self.max_message_size {
            return Err(RpcError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        dst.reserve(SIZE_LEN + size);
        dst.put_u32(size as u32);
        dst.put_u8(frame.header.kind as u8);
        dst.put_u32(frame.header.version);
        dst.put_u64(frame.header.sequence.0);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Codec for response frames.
///
/// Clients decode with it, agents encode with it.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    max_message_size: usize,
}

impl ResponseCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for ResponseCodec {
    type Item = ResponseFrame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = complete_frame_len(src, RESPONSE_HEADER_LEN, self.max_message_size)?
        else {
            return Ok(None);
        };

        let mut frame = src.split_to(total).freeze();
        let size = frame.get_u32();
        let sequence = SequenceNumber(frame.get_u64());
        let status = Status::try_from(frame.get_u8())?;

        trace!(
            sequence = sequence.0,
            status = ?status,
            payload_len = frame.len(),
            "Decoded response frame"
        );

        Ok(Some(ResponseFrame {
            header: ResponseHeader {
                size,
                sequence,
                status,
            },
            payload: frame,
        }))
    }
}

impl Encoder<ResponseFrame> for ResponseCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = RESPONSE_HEADER_LEN + frame.payload.len();
        if size > self.max_message_size {
            return Err(RpcError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        dst.reserve(SIZE_LEN + size);
        dst.put_u32(size as u32);
        dst.put_u64(frame.header.sequence.0);
        dst.put_u8(frame.header.status as u8);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_common::config::DEFAULT_MAX_MESSAGE_SIZE;

    fn encode_request(frame: RequestFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE)
            .encode(frame, &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_request_kind_from_byte() {
        assert_eq!(RequestKind::try_from(0x01).unwrap(), RequestKind::Call);
        assert_eq!(RequestKind::try_from(0x02).unwrap(), RequestKind::Cancel);
        assert!(RequestKind::try_from(0xFF).is_err());
    }

    #[test]
    fn test_sequence_next_is_monotonic() {
        let mut seq = SequenceNumber::default();
        assert_eq!(seq.next(), SequenceNumber(0));
        assert_eq!(seq.next(), SequenceNumber(1));
        assert_eq!(seq, SequenceNumber(2));
    }

    #[test]
    fn test_request_header_layout() {
        let buf = encode_request(RequestFrame::call(
            7,
            SequenceNumber(0x0102),
            Bytes::from_static(b"HELLO!"),
        ));
        assert_eq!(&buf[0..4], &(13u32 + 6).to_be_bytes());
        assert_eq!(buf[4], RequestKind::Call as u8);
        assert_eq!(&buf[5..9], &7u32.to_be_bytes());
        assert_eq!(&buf[9..17], &0x0102u64.to_be_bytes());
        assert_eq!(&buf[17..], b"HELLO!");
    }

    #[test]
    fn test_request_decode_waits_for_partial_frame() {
        let full = encode_request(RequestFrame::call(
            1,
            SequenceNumber(9),
            Bytes::from_static(b"payload"),
        ));
        let mut codec = RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE);

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.sequence(), SequenceNumber(9));
        assert_eq!(frame.payload, Bytes::from_static(b"payload"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode_request(RequestFrame::call(1, SequenceNumber(1), Bytes::new()));
        buf.extend_from_slice(&encode_request(RequestFrame::cancel(1, SequenceNumber(1))));

        let mut codec = RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.kind, RequestKind::Call);
        assert!(RequestCodec::next_is_cancel(&buf));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.header.kind, RequestKind::Cancel);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_cancels_found_behind_a_call() {
        let mut buf = encode_request(RequestFrame::call(1, SequenceNumber(0), Bytes::from_static(b"held")));
        buf.extend_from_slice(&encode_request(RequestFrame::cancel(1, SequenceNumber(7))));
        buf.extend_from_slice(&encode_request(RequestFrame::call(1, SequenceNumber(8), Bytes::new())));
        let partial = encode_request(RequestFrame::cancel(1, SequenceNumber(9)));
        buf.extend_from_slice(&partial[..partial.len() - 1]);

        assert!(!RequestCodec::next_is_cancel(&buf));
        assert_eq!(RequestCodec::buffered_cancels(&buf), vec![SequenceNumber(7)]);

        // nothing consumed
        let mut codec = RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().sequence(), SequenceNumber(0));
    }

    #[test]
    fn test_cancel_scan_stops_at_garbage() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0x02, 0x00]);
        buf.extend_from_slice(&encode_request(RequestFrame::cancel(1, SequenceNumber(3))));
        assert!(RequestCodec::buffered_cancels(&buf).is_empty());
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let mut codec = RequestCodec::new(512);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RpcError::MessageTooLarge { size: 1024, max: 512 })
        ));

        let frame = RequestFrame::call(1, SequenceNumber(0), Bytes::from(vec![0u8; 600]));
        assert!(codec.encode(frame, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_undersized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0x01, 0x00]);
        let mut codec = RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RpcError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_response_success_and_failure() {
        let mut codec = ResponseCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        codec
            .encode(
                ResponseFrame::success(SequenceNumber(4), Bytes::from_static(b"ok")),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                ResponseFrame::failure(SequenceNumber(5), &RpcError::application(1200, "bad job")),
                &mut buf,
            )
            .unwrap();

        let ok = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ok.sequence(), SequenceNumber(4));
        assert_eq!(ok.into_result().unwrap(), Bytes::from_static(b"ok"));

        let failed = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(failed.sequence(), SequenceNumber(5));
        assert_eq!(
            failed.into_result().unwrap_err(),
            RpcError::application(1200, "bad job")
        );
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u64(1);
        buf.put_u8(0x7F);
        let mut codec = ResponseCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        use futures::SinkExt;
        use tokio_stream::StreamExt;
        use tokio_util::codec::{FramedRead, FramedWrite};

        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE));
        let mut reader = FramedRead::new(server, RequestCodec::new(DEFAULT_MAX_MESSAGE_SIZE));

        let payload = Bytes::from(vec![0xAB; 300]);
        let send = tokio::spawn(async move {
            writer
                .send(RequestFrame::call(3, SequenceNumber(11), payload))
                .await
                .unwrap();
        });

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.header.version, 3);
        assert_eq!(frame.sequence(), SequenceNumber(11));
        assert_eq!(frame.payload.len(), 300);
        send.await.unwrap();
    }
}
