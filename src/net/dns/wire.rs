//! RFC 1035 wire codec for the query subset this stack speaks:
//! A, AAAA and SRV questions and answers, with name-compression support on
//! decode. Encode never compresses; queries are tiny and replies are only
//! re-encoded by tests.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Dns;
use crate::{Error, Result};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_SRV: u16 = 33;
pub const CLASS_IN: u16 = 1;

pub const RCODE_OK: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;

/// Longest chain of compression pointers a decoder will follow.
const MAX_POINTER_JUMPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srv {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Srv(Srv),
    Raw(Vec<u8>),
}

/// One answer record. `rdata` is `None` only for synthesized negative-cache
/// entries, never on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub qtype: u16,
    pub ttl: u32,
    pub rdata: Option<Rdata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Reply {
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// Encode one standard recursive query.
pub fn encode_query(id: u16, question: &Question, buf: &mut Vec<u8>) {
    put_u16(buf, id);
    put_u16(buf, FLAG_RD);
    put_u16(buf, 1); // QDCOUNT
    put_u16(buf, 0);
    put_u16(buf, 0);
    put_u16(buf, 0);
    encode_name(&question.name, buf);
    put_u16(buf, question.qtype);
    put_u16(buf, CLASS_IN);
}

/// Encode a reply; the inverse of [`decode_reply`] for uncompressed input.
pub fn encode_reply(reply: &Reply, buf: &mut Vec<u8>) {
    put_u16(buf, reply.id);
    put_u16(buf, reply.flags);
    put_u16(buf, reply.questions.len() as u16);
    put_u16(buf, reply.answers.len() as u16);
    put_u16(buf, 0);
    put_u16(buf, 0);
    for question in &reply.questions {
        encode_name(&question.name, buf);
        put_u16(buf, question.qtype);
        put_u16(buf, CLASS_IN);
    }
    for answer in &reply.answers {
        encode_name(&answer.name, buf);
        put_u16(buf, answer.qtype);
        put_u16(buf, CLASS_IN);
        put_u32(buf, answer.ttl);
        let rdata_at = buf.len();
        put_u16(buf, 0);
        match answer.rdata.as_ref().expect("wire record without rdata") {
            Rdata::A(ip) => buf.extend_from_slice(&ip.octets()),
            Rdata::Aaaa(ip) => buf.extend_from_slice(&ip.octets()),
            Rdata::Srv(srv) => {
                put_u16(buf, srv.priority);
                put_u16(buf, srv.weight);
                put_u16(buf, srv.port);
                encode_name(&srv.target, buf);
            }
            Rdata::Raw(bytes) => buf.extend_from_slice(bytes),
        }
        let rdlen = (buf.len() - rdata_at - 2) as u16;
        buf[rdata_at..rdata_at + 2].copy_from_slice(&rdlen.to_be_bytes());
    }
}

/// Decode a query datagram (the reply decoder with the QR check flipped);
/// servers and tests use this side.
pub fn decode_query(data: &[u8]) -> Result<Reply> {
    let decoded = decode(data)?;
    if decoded.flags & FLAG_QR != 0 {
        return Err(malformed());
    }
    Ok(decoded)
}

/// Decode a reply datagram.
pub fn decode_reply(data: &[u8]) -> Result<Reply> {
    let decoded = decode(data)?;
    if decoded.flags & FLAG_QR == 0 {
        return Err(malformed());
    }
    Ok(decoded)
}

fn decode(data: &[u8]) -> Result<Reply> {
    let mut pos = 0usize;
    let id = get_u16(data, &mut pos)?;
    let flags = get_u16(data, &mut pos)?;
    let qdcount = get_u16(data, &mut pos)? as usize;
    let ancount = get_u16(data, &mut pos)? as usize;
    let _nscount = get_u16(data, &mut pos)?;
    let _arcount = get_u16(data, &mut pos)?;

    let mut questions = Vec::with_capacity(qdcount);
    for _ in 0..qdcount {
        let name = decode_name(data, &mut pos)?;
        let qtype = get_u16(data, &mut pos)?;
        let _class = get_u16(data, &mut pos)?;
        questions.push(Question { name, qtype });
    }

    let mut answers = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        let name = decode_name(data, &mut pos)?;
        let qtype = get_u16(data, &mut pos)?;
        let _class = get_u16(data, &mut pos)?;
        let ttl = get_u32(data, &mut pos)?;
        let rdlen = get_u16(data, &mut pos)? as usize;
        if data.len() < pos + rdlen {
            return Err(malformed());
        }
        let rdata_end = pos + rdlen;
        let rdata = match qtype {
            QTYPE_A => {
                if rdlen != 4 {
                    return Err(malformed());
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&data[pos..pos + 4]);
                pos += 4;
                Rdata::A(Ipv4Addr::from(octets))
            }
            QTYPE_AAAA => {
                if rdlen != 16 {
                    return Err(malformed());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[pos..pos + 16]);
                pos += 16;
                Rdata::Aaaa(Ipv6Addr::from(octets))
            }
            QTYPE_SRV => {
                let priority = get_u16(data, &mut pos)?;
                let weight = get_u16(data, &mut pos)?;
                let port = get_u16(data, &mut pos)?;
                let target = decode_name(data, &mut pos)?;
                Rdata::Srv(Srv {
                    priority,
                    weight,
                    port,
                    target,
                })
            }
            _ => {
                let raw = data[pos..rdata_end].to_vec();
                pos = rdata_end;
                Rdata::Raw(raw)
            }
        };
        if pos != rdata_end {
            return Err(malformed());
        }
        answers.push(Record {
            name,
            qtype,
            ttl,
            rdata: Some(rdata),
        });
    }

    Ok(Reply {
        id,
        flags,
        questions,
        answers,
    })
}

fn encode_name(name: &str, buf: &mut Vec<u8>) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        debug_assert!(label.len() < 64);
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

fn decode_name(data: &[u8], pos: &mut usize) -> Result<String> {
    let mut name = String::new();
    let mut cursor = *pos;
    let mut jumps = 0usize;
    let mut jumped = false;
    loop {
        let len = *data.get(cursor).ok_or_else(malformed)? as usize;
        if len == 0 {
            cursor += 1;
            if !jumped {
                *pos = cursor;
            }
            return Ok(name);
        }
        if len & 0xc0 == 0xc0 {
            // compression pointer
            let low = *data.get(cursor + 1).ok_or_else(malformed)? as usize;
            let target = ((len & 0x3f) << 8) | low;
            if !jumped {
                *pos = cursor + 2;
            }
            jumped = true;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS || target >= data.len() {
                return Err(malformed());
            }
            cursor = target;
            continue;
        }
        if len >= 64 {
            return Err(malformed());
        }
        let end = cursor + 1 + len;
        if end > data.len() {
            return Err(malformed());
        }
        if !name.is_empty() {
            name.push('.');
        }
        let label =
            std::str::from_utf8(&data[cursor + 1..end]).map_err(|_| malformed())?;
        name.push_str(label);
        cursor = end;
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn get_u16(data: &[u8], pos: &mut usize) -> Result<u16> {
    if data.len() < *pos + 2 {
        return Err(malformed());
    }
    let value = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    Ok(value)
}

fn get_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    if data.len() < *pos + 4 {
        return Err(malformed());
    }
    let value = u32::from_be_bytes([
        data[*pos],
        data[*pos + 1],
        data[*pos + 2],
        data[*pos + 3],
    ]);
    *pos += 4;
    Ok(value)
}

fn malformed() -> Error {
    Error::new_dns(Dns::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(name: &str, qtype: u16) -> Question {
        Question {
            name: name.into(),
            qtype,
        }
    }

    #[test]
    fn query_shape() {
        let mut buf = Vec::new();
        encode_query(0x1234, &question("example.org", QTYPE_A), &mut buf);
        assert_eq!(&buf[..2], &[0x12, 0x34]);
        // RD set, QR clear
        assert_eq!(&buf[2..4], &[0x01, 0x00]);
        // 7example3org0
        assert_eq!(
            &buf[12..25],
            &[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'o', b'r', b'g', 0]
        );
    }

    #[test]
    fn reply_round_trip_a() {
        let reply = Reply {
            id: 7,
            flags: FLAG_QR | FLAG_RD,
            questions: vec![question("example.org", QTYPE_A)],
            answers: vec![Record {
                name: "example.org".into(),
                qtype: QTYPE_A,
                ttl: 3600,
                rdata: Some(Rdata::A(Ipv4Addr::new(203, 0, 113, 7))),
            }],
        };
        let mut buf = Vec::new();
        encode_reply(&reply, &mut buf);
        let decoded = decode_reply(&buf).unwrap();
        assert_eq!(decoded, reply);

        // encode(decode(x)) == x for uncompressed wellformed replies
        let mut again = Vec::new();
        encode_reply(&decoded, &mut again);
        assert_eq!(again, buf);
    }

    #[test]
    fn reply_round_trip_srv_and_aaaa() {
        let reply = Reply {
            id: 99,
            flags: FLAG_QR,
            questions: vec![question("_matrix._tcp.example.org", QTYPE_SRV)],
            answers: vec![
                Record {
                    name: "_matrix._tcp.example.org".into(),
                    qtype: QTYPE_SRV,
                    ttl: 300,
                    rdata: Some(Rdata::Srv(Srv {
                        priority: 10,
                        weight: 5,
                        port: 8448,
                        target: "fed.example.org".into(),
                    })),
                },
                Record {
                    name: "fed.example.org".into(),
                    qtype: QTYPE_AAAA,
                    ttl: 300,
                    rdata: Some(Rdata::Aaaa("2001:db8::7".parse().unwrap())),
                },
            ],
        };
        let mut buf = Vec::new();
        encode_reply(&reply, &mut buf);
        assert_eq!(decode_reply(&buf).unwrap(), reply);
    }

    #[test]
    fn decodes_compressed_names() {
        // header + question "a.example.org" + answer whose name is a pointer
        // back to the question name
        let mut buf = Vec::new();
        put_u16(&mut buf, 1);
        put_u16(&mut buf, FLAG_QR);
        put_u16(&mut buf, 1);
        put_u16(&mut buf, 1);
        put_u16(&mut buf, 0);
        put_u16(&mut buf, 0);
        let name_at = buf.len() as u16;
        encode_name("a.example.org", &mut buf);
        put_u16(&mut buf, QTYPE_A);
        put_u16(&mut buf, CLASS_IN);
        buf.push(0xc0);
        buf.push(name_at as u8);
        put_u16(&mut buf, QTYPE_A);
        put_u16(&mut buf, CLASS_IN);
        put_u32(&mut buf, 60);
        put_u16(&mut buf, 4);
        buf.extend_from_slice(&[192, 0, 2, 1]);

        let reply = decode_reply(&buf).unwrap();
        assert_eq!(reply.answers[0].name, "a.example.org");
        assert_eq!(
            reply.answers[0].rdata,
            Some(Rdata::A(Ipv4Addr::new(192, 0, 2, 1)))
        );
    }

    #[test]
    fn rejects_pointer_loops() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 1);
        put_u16(&mut buf, FLAG_QR);
        put_u16(&mut buf, 1);
        put_u16(&mut buf, 0);
        put_u16(&mut buf, 0);
        put_u16(&mut buf, 0);
        let at = buf.len();
        buf.push(0xc0);
        buf.push(at as u8); // points at itself
        put_u16(&mut buf, QTYPE_A);
        put_u16(&mut buf, CLASS_IN);
        assert!(decode_reply(&buf).is_err());
    }

    #[test]
    fn rejects_truncated() {
        let mut buf = Vec::new();
        encode_query(3, &question("example.org", QTYPE_A), &mut buf);
        // queries lack QR; also truncation at every length must not panic
        assert!(decode_reply(&buf).is_err());
        let reply = Reply {
            id: 7,
            flags: FLAG_QR,
            questions: vec![question("example.org", QTYPE_A)],
            answers: vec![],
        };
        let mut full = Vec::new();
        encode_reply(&reply, &mut full);
        for cut in 0..full.len() {
            let _ = decode_reply(&full[..cut]);
        }
    }
}
