// SPDX-License-Identifier: MIT OR Apache-2.0

//! Endpoint payload carried by `PunchInfo` messages
//!
//! Layout: [AddrLen+1: u16][Addr: UTF-8][Port: i32], little-endian. A length
//! prefix of 0 encodes a missing string and is rejected on decode.

use bytes::{Buf, BufMut};
use std::net::{IpAddr, SocketAddr};

use crate::CodecError;

/// Encode an external endpoint for a `PunchInfo` payload
pub fn encode_endpoint(endpoint: SocketAddr) -> Vec<u8> {
    let address = endpoint.ip().to_string();
    let mut buf = Vec::with_capacity(2 + address.len() + 4);
    buf.put_u16_le(address.len() as u16 + 1);
    buf.put_slice(address.as_bytes());
    buf.put_i32_le(i32::from(endpoint.port()));
    buf
}

/// Decode the endpoint written by [`encode_endpoint`]
pub fn decode_endpoint(mut payload: &[u8]) -> Result<SocketAddr, CodecError> {
    if payload.remaining() < 2 {
        return Err(CodecError::InvalidEndpoint("missing address length".into()));
    }

    let size = payload.get_u16_le() as usize;
    if size == 0 {
        return Err(CodecError::InvalidEndpoint("null address".into()));
    }

    let len = size - 1;
    if payload.remaining() < len + 4 {
        return Err(CodecError::InvalidEndpoint(format!(
            "{} bytes remaining, {} required",
            payload.remaining(),
            len + 4
        )));
    }

    let address = std::str::from_utf8(&payload[..len])
        .map_err(|e| CodecError::InvalidEndpoint(e.to_string()))?;
    let ip: IpAddr = address
        .parse()
        .map_err(|_| CodecError::InvalidEndpoint(format!("bad address {:?}", address)))?;
    payload.advance(len);

    let port = payload.get_i32_le();
    let port = u16::try_from(port)
        .map_err(|_| CodecError::InvalidEndpoint(format!("bad port {}", port)))?;

    Ok(SocketAddr::new(ip, port))
}
