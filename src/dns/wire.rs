//! Minimal DNS wire codec: A-record queries out, responses in.
//!
//! Responses come from the network and are untrusted; every offset is bounds
//! checked and compressed names are skipped without following pointers.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

const FLAG_RESPONSE: u16 = 1 << 15;
const FLAG_RECURSION_DESIRED: u16 = 1 << 8;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

const POINTER_MASK: u8 = 0b1100_0000;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid domain name")]
    InvalidName,

    #[error("truncated DNS message")]
    Truncated,

    #[error("malformed DNS message")]
    Malformed,
}

/// Builds a recursive A/IN query for `name` with the given transaction id.
pub fn build_query(id: u16, name: &str) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    encode_name(name, &mut out)?;
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(out)
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    // A single trailing dot marks an absolute name and is tolerated.
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(WireError::InvalidName);
    }
    for label in name.split('.') {
        let label = label.as_bytes();
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(WireError::InvalidName);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    Ok(())
}

#[derive(Debug)]
pub struct Response {
    pub id: u16,
    /// Addresses from A/IN answer records, in answer order.
    pub answers: Vec<Ipv4Addr>,
}

pub fn parse_response(buf: &[u8]) -> Result<Response, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & FLAG_RESPONSE == 0 {
        return Err(WireError::Malformed);
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(buf, offset)?;
        offset = checked_advance(buf, offset, 4)?; // QTYPE + QCLASS
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(buf, offset)?;
        if buf.len() < offset + 10 {
            return Err(WireError::Truncated);
        }
        let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let rclass = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
        let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
        offset = checked_advance(buf, offset + 10, rdlength)?;
        if rtype == TYPE_A && rclass == CLASS_IN && rdlength == 4 {
            let rdata = &buf[offset - 4..offset];
            answers.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
    }

    Ok(Response { id, answers })
}

fn checked_advance(buf: &[u8], offset: usize, by: usize) -> Result<usize, WireError> {
    let next = offset.checked_add(by).ok_or(WireError::Malformed)?;
    if next > buf.len() {
        return Err(WireError::Truncated);
    }
    Ok(next)
}

/// Advances past one encoded name. A compression pointer terminates the name
/// in place, so pointers are never followed and cannot loop.
fn skip_name(buf: &[u8], mut offset: usize) -> Result<usize, WireError> {
    loop {
        let len = *buf.get(offset).ok_or(WireError::Truncated)?;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & POINTER_MASK == POINTER_MASK {
            return checked_advance(buf, offset, 2);
        }
        if len & POINTER_MASK != 0 {
            return Err(WireError::Malformed);
        }
        offset = checked_advance(buf, offset + 1, len as usize)?;
    }
}
