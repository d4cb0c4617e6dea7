/// Minimal protobuf field codec for the messages the core handles itself
///
/// Only `RpbAuthReq` (sent during the handshake) and `RpbErrorResp` (the
/// generic error reply) are needed here; every other message body is opaque
/// to the core and produced/consumed by commands.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RiakError, RiakResult, ServerError};

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

fn put_varint(out: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn get_varint(buf: &mut Bytes) -> RiakResult<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(RiakError::decode("truncated varint"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RiakError::decode("varint overflow"))
}

fn put_bytes_field(out: &mut BytesMut, field: u64, data: &[u8]) {
    put_varint(out, (field << 3) | WIRE_LEN);
    put_varint(out, data.len() as u64);
    out.put_slice(data);
}

/// Encode `RpbAuthReq { user = 1, password = 2 }`
pub fn encode_auth_request(user: &str, password: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(user.len() + password.len() + 8);
    put_bytes_field(&mut out, 1, user.as_bytes());
    put_bytes_field(&mut out, 2, password.as_bytes());
    out.freeze()
}

/// Decode `RpbErrorResp { errmsg = 1, errcode = 2 }`
pub fn decode_error_response(body: Option<Bytes>) -> RiakResult<ServerError> {
    let mut message = String::new();
    let mut code = 0u32;
    let mut buf = body.unwrap_or_default();

    while buf.has_remaining() {
        let key = get_varint(&mut buf)?;
        let field = key >> 3;
        match (field, key & 0x7) {
            (1, WIRE_LEN) => {
                let data = take_len_delimited(&mut buf)?;
                message = String::from_utf8_lossy(&data).into_owned();
            }
            (2, WIRE_VARINT) => {
                code = get_varint(&mut buf)? as u32;
            }
            (_, wire) => skip_field(&mut buf, wire)?,
        }
    }

    Ok(ServerError { code, message })
}

/// Encode `RpbErrorResp`, as a server would send it
#[cfg(test)]
pub(crate) fn encode_error_response(error: &ServerError) -> Bytes {
    let mut out = BytesMut::new();
    put_bytes_field(&mut out, 1, error.message.as_bytes());
    put_varint(&mut out, (2 << 3) | WIRE_VARINT);
    put_varint(&mut out, u64::from(error.code));
    out.freeze()
}

fn take_len_delimited(buf: &mut Bytes) -> RiakResult<Bytes> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(RiakError::decode("truncated length-delimited field"));
    }
    Ok(buf.split_to(len))
}

fn skip_field(buf: &mut Bytes, wire: u64) -> RiakResult<()> {
    let skip = match wire {
        WIRE_VARINT => {
            get_varint(buf)?;
            0
        }
        WIRE_FIXED64 => 8,
        WIRE_LEN => {
            take_len_delimited(buf)?;
            0
        }
        WIRE_FIXED32 => 4,
        other => return Err(RiakError::decode(format!("unsupported wire type {}", other))),
    };
    if buf.remaining() < skip {
        return Err(RiakError::decode("truncated fixed-width field"));
    }
    buf.advance(skip);
    Ok(())
}
