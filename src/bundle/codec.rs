//! Primary-block parser/serializer (spec §4.4).
//!
//! Grounded on the teacher's `packet.rs` `Packet::{from_bytes, to_bytes}`
//! pair: one pass builds a body buffer first so its length is known before
//! the length-prefixed field that precedes it, the other walks an
//! `InputBuffer` cursor and bails out with a typed error at the first
//! malformed field.

use super::Bundle;
use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::FrameError;
use crate::sdnv;

const BUNDLE_VERSION: u8 = 0x06;
const PAYLOAD_BLOCK_TYPE: u8 = 0x01;
const PAYLOAD_BLOCK_FLAGS: u64 = 0x08;

/// Split `endpoint` into (scheme, scheme-specific part) at the first `:`,
/// e.g. `"dtn://[fd00:...]/echo"` -> `("dtn", "//[fd00:...]/echo")`.
fn split_endpoint(endpoint: &str) -> (&str, &str) {
    match endpoint.split_once(':') {
        Some((scheme, ssp)) => (scheme, ssp),
        None => ("", endpoint),
    }
}

/// Replace any byte outside the 7-bit ASCII range with `?` (spec §4.4:
/// "Characters with value > 127 are replaced by `?` on both encode and
/// decode").
fn sanitize_ascii(word: &str) -> Vec<u8> {
    word.chars().map(|c| if (c as u32) > 127 { b'?' } else { c as u8 }).collect()
}

fn push_nul_terminated(dict: &mut Vec<u8>, word: &str) -> u64 {
    let offset = dict.len() as u64;
    dict.extend(sanitize_ascii(word));
    dict.push(0);
    offset
}

fn read_nul_terminated(dict: &[u8], offset: usize) -> Result<String, FrameError> {
    let start = dict.get(offset..).ok_or(FrameError::Truncated)?;
    let end = start.iter().position(|&b| b == 0).ok_or(FrameError::Truncated)?;
    Ok(start[..end].iter().map(|&b| if b > 127 { '?' } else { b as char }).collect())
}

/// Serialize `bundle` into a primary block + payload block (spec §4.4).
pub fn serialize(bundle: &Bundle) -> Vec<u8> {
    let mut dict = Vec::new();
    let endpoints = [&bundle.source, &bundle.destination, &bundle.report_to, &bundle.custodian];
    let mut scheme_off = [0u64; 4];
    let mut ssp_off = [0u64; 4];
    for (i, endpoint) in endpoints.iter().enumerate() {
        let (scheme, ssp) = split_endpoint(endpoint);
        scheme_off[i] = push_nul_terminated(&mut dict, scheme);
        ssp_off[i] = push_nul_terminated(&mut dict, ssp);
    }

    let mut body = OutputBuffer::new();
    for off in scheme_off {
        sdnv::encode(off, &mut body);
    }
    for off in ssp_off {
        sdnv::encode(off, &mut body);
    }
    sdnv::encode(bundle.creation_timestamp, &mut body);
    sdnv::encode(bundle.sequence, &mut body);
    sdnv::encode(bundle.lifetime, &mut body);
    sdnv::encode(dict.len() as u64, &mut body);
    body.write(&dict);

    let mut out = OutputBuffer::with_capacity(body.len() + bundle.payload.len() + 16);
    out.write_byte(BUNDLE_VERSION);
    sdnv::encode(u64::from(bundle.flags), &mut out);
    sdnv::encode(body.len() as u64, &mut out);
    out.write(body.as_slice());
    out.write_byte(PAYLOAD_BLOCK_TYPE);
    sdnv::encode(PAYLOAD_BLOCK_FLAGS, &mut out);
    sdnv::encode(bundle.payload.len() as u64, &mut out);
    out.write(&bundle.payload);
    out.into_vec()
}

/// Parse a primary block + payload block (spec §4.4); see [`FrameError`] for
/// the failure modes.
pub fn deserialize(bytes: &[u8]) -> Result<Bundle, FrameError> {
    let mut input = InputBuffer::new(bytes);

    let version = input.read_byte()?;
    if version != BUNDLE_VERSION {
        return Err(FrameError::BadVersion);
    }

    let flags = sdnv::decode(&mut input)?;
    let primary_length = sdnv::decode(&mut input)? as usize;
    let body = input.read_slice(primary_length)?;
    let mut body = InputBuffer::new(body);

    let mut scheme_off = [0usize; 4];
    let mut ssp_off = [0usize; 4];
    for slot in scheme_off.iter_mut() {
        *slot = sdnv::decode(&mut body)? as usize;
    }
    for slot in ssp_off.iter_mut() {
        *slot = sdnv::decode(&mut body)? as usize;
    }
    let creation_timestamp = sdnv::decode(&mut body)?;
    let sequence = sdnv::decode(&mut body)?;
    let lifetime = sdnv::decode(&mut body)?;
    let dict_length = sdnv::decode(&mut body)? as usize;
    let dict = body.read_slice(dict_length)?;

    let mut endpoints = [String::new(), String::new(), String::new(), String::new()];
    for i in 0..4 {
        let scheme = read_nul_terminated(dict, scheme_off[i])?;
        let ssp = read_nul_terminated(dict, ssp_off[i])?;
        endpoints[i] = format!("{scheme}:{ssp}");
    }
    let [source, destination, report_to, custodian] = endpoints;

    let payload_type = input.read_byte()?;
    if payload_type != PAYLOAD_BLOCK_TYPE {
        return Err(FrameError::BadBlockType);
    }
    let payload_flags = sdnv::decode(&mut input)?;
    if payload_flags != PAYLOAD_BLOCK_FLAGS {
        return Err(FrameError::BadBlockFlags);
    }
    let payload_length = sdnv::decode(&mut input)? as usize;
    let payload = input.read_slice(payload_length)?.to_vec();

    Ok(Bundle {
        flags: flags as u32,
        creation_timestamp,
        sequence,
        lifetime,
        source,
        destination,
        report_to,
        custodian,
        payload,
    })
}
