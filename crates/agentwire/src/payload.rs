//! Payload contract for request and response types.
//!
//! The substrate never interprets payload bytes. A type crosses the wire by
//! implementing [`Encode`] (append itself to a buffer) and [`Decode`] (read
//! itself back from a [`PayloadReader`], failing with [`RpcError::Decode`]
//! on malformed input).
//!
//! Raw impls cover integers, `String`, `Bytes`, `Vec<u8>`, `()` and small
//! tuples. Variable-length values carry a `BE u32` length prefix so they
//! compose inside tuples. Structured types go through [`Json`], or
//! [`MsgPack`] when the `binary` feature is enabled.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use agentwire_common::{RpcError, RpcResult};

/// A value that can be appended to an outgoing payload.
pub trait Encode {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()>;
}

/// A value that can be read from an incoming payload.
pub trait Decode: Sized {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self>;
}

/// Cursor over exactly one request or response payload.
#[derive(Debug, Clone)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, n: usize, what: &str) -> RpcResult<()> {
        if self.buf.remaining() < n {
            return Err(RpcError::Decode(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> RpcResult<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> RpcResult<u16> {
        self.ensure(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> RpcResult<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> RpcResult<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    /// Take the next `n` bytes without copying.
    pub fn take(&mut self, n: usize) -> RpcResult<Bytes> {
        self.ensure(n, "bytes")?;
        Ok(self.buf.split_to(n))
    }

    /// Take a `BE u32` length-prefixed byte string.
    pub fn take_prefixed(&mut self) -> RpcResult<Bytes> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Take everything left in the payload.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Decode a value from the current position.
    pub fn read<T: Decode>(&mut self) -> RpcResult<T> {
        T::decode(self)
    }
}

/// Encode a value into a fresh payload buffer.
pub fn encode_payload<T: Encode + ?Sized>(value: &T) -> RpcResult<Bytes> {
    let mut buf = BytesMut::new();
    value.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a whole payload, rejecting trailing garbage.
pub fn decode_payload<T: Decode>(payload: Bytes) -> RpcResult<T> {
    let mut reader = PayloadReader::new(payload);
    let value = T::decode(&mut reader)?;
    if !reader.is_empty() {
        return Err(RpcError::Decode(format!(
            "{} trailing bytes after payload",
            reader.remaining()
        )));
    }
    Ok(value)
}

fn put_prefixed(dst: &mut BytesMut, bytes: &[u8]) -> RpcResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        RpcError::Serialization(format!("field of {} bytes exceeds u32 length", bytes.len()))
    })?;
    dst.reserve(4 + bytes.len());
    dst.put_u32(len);
    dst.put_slice(bytes);
    Ok(())
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        (**self).encode(dst)
    }
}

impl Encode for () {
    fn encode(&self, _dst: &mut BytesMut) -> RpcResult<()> {
        Ok(())
    }
}

impl Decode for () {
    fn decode(_reader: &mut PayloadReader) -> RpcResult<Self> {
        Ok(())
    }
}

macro_rules! impl_int {
    ($($ty:ty => $put:ident, $get:ident);* $(;)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
                    dst.$put(*self);
                    Ok(())
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
                    reader.$get()
                }
            }
        )*
    };
}

impl_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}

impl Encode for bool {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        dst.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        match reader.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RpcError::Decode(format!("invalid bool byte {}", other))),
        }
    }
}

impl Encode for str {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        put_prefixed(dst, self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        self.as_str().encode(dst)
    }
}

impl Decode for String {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        let bytes = reader.take_prefixed()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

impl Encode for [u8] {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        put_prefixed(dst, self)
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        put_prefixed(dst, self)
    }
}

impl Decode for Vec<u8> {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        Ok(reader.take_prefixed()?.to_vec())
    }
}

impl Encode for Bytes {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        put_prefixed(dst, self)
    }
}

impl Decode for Bytes {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        reader.take_prefixed()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        match self {
            None => false.encode(dst),
            Some(value) => {
                true.encode(dst)?;
                value.encode(dst)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        if reader.read::<bool>()? {
            Ok(Some(reader.read()?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        self.0.encode(dst)?;
        self.1.encode(dst)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        Ok((reader.read()?, reader.read()?))
    }
}

impl<A: Encode, B: Encode, C: Encode> Encode for (A, B, C) {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        self.0.encode(dst)?;
        self.1.encode(dst)?;
        self.2.encode(dst)
    }
}

impl<A: Decode, B: Decode, C: Decode> Decode for (A, B, C) {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        Ok((reader.read()?, reader.read()?, reader.read()?))
    }
}

/// Carry any serde type as a length-prefixed JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> Encode for Json<T> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        let bytes =
            serde_json::to_vec(&self.0).map_err(|e| RpcError::Serialization(e.to_string()))?;
        put_prefixed(dst, &bytes)
    }
}

impl<T: DeserializeOwned> Decode for Json<T> {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        let bytes = reader.take_prefixed()?;
        serde_json::from_slice(&bytes)
            .map(Json)
            .map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Carry any serde type as a length-prefixed MessagePack document.
#[cfg(feature = "binary")]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgPack<T>(pub T);

#[cfg(feature = "binary")]
impl<T: Serialize> Encode for MsgPack<T> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        let bytes =
            rmp_serde::to_vec(&self.0).map_err(|e| RpcError::Serialization(e.to_string()))?;
        put_prefixed(dst, &bytes)
    }
}

#[cfg(feature = "binary")]
impl<T: DeserializeOwned> Decode for MsgPack<T> {
    fn decode(reader: &mut PayloadReader) -> RpcResult<Self> {
        let bytes = reader.take_prefixed()?;
        rmp_serde::from_slice(&bytes)
            .map(MsgPack)
            .map_err(|e| RpcError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_echo_tuple_layout() {
        let payload = encode_payload(&("HELLO!".to_string(), 73u32)).unwrap();
        assert_eq!(&payload[..4], &6u32.to_be_bytes());
        assert_eq!(&payload[4..10], b"HELLO!");
        assert_eq!(&payload[10..], &73u32.to_be_bytes());

        let (text, counter): (String, u32) = decode_payload(payload).unwrap();
        assert_eq!(text, "HELLO!");
        assert_eq!(counter, 73);
    }

    #[test]
    fn test_truncated_payload_is_decode_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");
        let err = decode_payload::<String>(buf.freeze()).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = encode_payload(&(1u32, 2u32)).unwrap();
        assert!(decode_payload::<u32>(payload).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let payload = encode_payload(&vec![0xFFu8, 0xFE]).unwrap();
        assert!(matches!(
            decode_payload::<String>(payload),
            Err(RpcError::Decode(_))
        ));
    }

    #[test]
    fn test_option_and_unit() {
        let payload = encode_payload(&(Some(5u64), None::<u8>)).unwrap();
        let decoded: (Option<u64>, Option<u8>) = decode_payload(payload).unwrap();
        assert_eq!(decoded, (Some(5), None));

        assert!(encode_payload(&()).unwrap().is_empty());
        decode_payload::<()>(Bytes::new()).unwrap();
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
        name: String,
    }

    #[test]
    fn test_json_adapter_composes() {
        let job = Job {
            id: 7,
            name: "compile".into(),
        };
        let payload = encode_payload(&(Json(&job), 3u8)).unwrap();
        let (Json(decoded), tail): (Json<Job>, u8) = decode_payload(payload).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(tail, 3);
    }

    #[test]
    fn test_json_garbage_is_decode_error() {
        let payload = encode_payload("not json").unwrap();
        assert!(matches!(
            decode_payload::<Json<Job>>(payload),
            Err(RpcError::Decode(_))
        ));
    }

    #[cfg(feature = "binary")]
    #[test]
    fn test_msgpack_adapter() {
        let job = Job {
            id: 9,
            name: "link".into(),
        };
        let payload = encode_payload(&MsgPack(&job)).unwrap();
        let MsgPack(decoded): MsgPack<Job> = decode_payload(payload).unwrap();
        assert_eq!(decoded, job);
    }
}
