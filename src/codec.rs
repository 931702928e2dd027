//! Hand-rolled binary wire format for the SNI map and control protocol.
//!
//! This is deliberately not JSON/serde: the on-disk and on-wire shape must
//! stay byte-stable across restarts, and a small cursor-based TLV format
//! keeps that guarantee explicit rather than incidental to a derive.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::{Buf, BufMut};

use crate::error::{ProxyError, Result};

/// A single SNI-map entry: where to forward traffic for a given name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: IpAddr,
    pub port: u16,
}

/// The routing table: case-insensitive domain name (or `"default"`) to backend.
pub type SniMap = HashMap<String, Backend>;

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_string(cur: &mut impl Buf) -> Result<String> {
    if cur.remaining() < 2 {
        return Err(ProxyError::Decode("truncated string length".into()));
    }
    let len = cur.get_u16() as usize;
    if cur.remaining() < len {
        return Err(ProxyError::Decode("truncated string data".into()));
    }
    let mut bytes = vec![0u8; len];
    cur.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| ProxyError::Decode(format!("invalid utf-8: {e}")))
}

fn put_host(buf: &mut Vec<u8>, host: &IpAddr) {
    match host {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
}

fn get_host(cur: &mut impl Buf) -> Result<IpAddr> {
    if cur.remaining() < 1 {
        return Err(ProxyError::Decode("truncated host tag".into()));
    }
    match cur.get_u8() {
        4 => {
            if cur.remaining() < 4 {
                return Err(ProxyError::Decode("truncated ipv4 host".into()));
            }
            let mut octets = [0u8; 4];
            cur.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        }
        6 => {
            if cur.remaining() < 16 {
                return Err(ProxyError::Decode("truncated ipv6 host".into()));
            }
            let mut octets = [0u8; 16];
            cur.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        }
        tag => Err(ProxyError::Decode(format!("unknown host tag {tag}"))),
    }
}

/// Encodes the SNI map as `u32 count || (sni, host, port)*`.
pub fn encode_data(map: &SniMap) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32(map.len() as u32);
    for (sni, backend) in map {
        put_string(&mut buf, sni);
        put_host(&mut buf, &backend.host);
        buf.put_u16(backend.port);
    }
    buf
}

/// Decodes the SNI map. An empty byte sequence decodes to an empty map.
pub fn decode_data(bytes: &[u8]) -> Result<SniMap> {
    if bytes.is_empty() {
        return Ok(SniMap::new());
    }
    let mut cur = bytes;
    if cur.remaining() < 4 {
        return Err(ProxyError::Decode("truncated map count".into()));
    }
    let count = cur.get_u32();
    let mut map = SniMap::with_capacity(count as usize);
    for _ in 0..count {
        let sni = get_string(&mut cur)?;
        let host = get_host(&mut cur)?;
        if cur.remaining() < 2 {
            return Err(ProxyError::Decode("truncated port".into()));
        }
        let port = cur.get_u16();
        map.insert(sni, Backend { host, port });
    }
    Ok(map)
}

/// A control-protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add {
        sni: String,
        host: IpAddr,
        port: u16,
    },
    Remove {
        sni: String,
    },
    List,
}

/// A control-protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Result { code: u8, message: String },
    Snis(Vec<(String, IpAddr, u16)>),
}

const TAG_ADD: u8 = 1;
const TAG_REMOVE: u8 = 2;
const TAG_LIST: u8 = 3;

const TAG_RESULT: u8 = 1;
const TAG_SNIS: u8 = 2;

/// Encodes a control command.
pub fn cmd_to_bytes(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::new();
    match cmd {
        Command::Add { sni, host, port } => {
            buf.put_u8(TAG_ADD);
            put_string(&mut buf, sni);
            put_host(&mut buf, host);
            buf.put_u16(*port);
        }
        Command::Remove { sni } => {
            buf.put_u8(TAG_REMOVE);
            put_string(&mut buf, sni);
        }
        Command::List => {
            buf.put_u8(TAG_LIST);
        }
    }
    buf
}

/// Decodes a control command. Unknown tags produce a decode error.
pub fn cmd_of_bytes(bytes: &[u8]) -> Result<Command> {
    let mut cur = bytes;
    if cur.remaining() < 1 {
        return Err(ProxyError::Decode("empty command".into()));
    }
    match cur.get_u8() {
        TAG_ADD => {
            let sni = get_string(&mut cur)?;
            let host = get_host(&mut cur)?;
            if cur.remaining() < 2 {
                return Err(ProxyError::Decode("truncated add port".into()));
            }
            let port = cur.get_u16();
            Ok(Command::Add { sni, host, port })
        }
        TAG_REMOVE => {
            let sni = get_string(&mut cur)?;
            Ok(Command::Remove { sni })
        }
        TAG_LIST => Ok(Command::List),
        tag => Err(ProxyError::Decode(format!("unknown command tag {tag}"))),
    }
}

/// Encodes a control reply.
pub fn reply_to_bytes(reply: &Reply) -> Vec<u8> {
    let mut buf = Vec::new();
    match reply {
        Reply::Result { code, message } => {
            buf.put_u8(TAG_RESULT);
            buf.put_u8(*code);
            put_string(&mut buf, message);
        }
        Reply::Snis(entries) => {
            buf.put_u8(TAG_SNIS);
            buf.put_u32(entries.len() as u32);
            for (sni, host, port) in entries {
                put_string(&mut buf, sni);
                put_host(&mut buf, host);
                buf.put_u16(*port);
            }
        }
    }
    buf
}

/// Decodes a control reply. Unknown tags produce a decode error.
pub fn reply_of_bytes(bytes: &[u8]) -> Result<Reply> {
    let mut cur = bytes;
    if cur.remaining() < 1 {
        return Err(ProxyError::Decode("empty reply".into()));
    }
    match cur.get_u8() {
        TAG_RESULT => {
            if cur.remaining() < 1 {
                return Err(ProxyError::Decode("truncated result code".into()));
            }
            let code = cur.get_u8();
            let message = get_string(&mut cur)?;
            Ok(Reply::Result { code, message })
        }
        TAG_SNIS => {
            if cur.remaining() < 4 {
                return Err(ProxyError::Decode("truncated snis count".into()));
            }
            let count = cur.get_u32();
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let sni = get_string(&mut cur)?;
                let host = get_host(&mut cur)?;
                if cur.remaining() < 2 {
                    return Err(ProxyError::Decode("truncated snis port".into()));
                }
                let port = cur.get_u16();
                entries.push((sni, host, port));
            }
            Ok(Reply::Snis(entries))
        }
        tag => Err(ProxyError::Decode(format!("unknown reply tag {tag}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_round_trips() {
        let map = SniMap::new();
        assert_eq!(decode_data(&encode_data(&map)).unwrap(), map);
        assert!(decode_data(&[]).unwrap().is_empty());
    }

    #[test]
    fn populated_map_round_trips() {
        let mut map = SniMap::new();
        map.insert(
            "a.example".to_string(),
            Backend {
                host: "10.0.0.1".parse().unwrap(),
                port: 4443,
            },
        );
        map.insert(
            "default".to_string(),
            Backend {
                host: "::1".parse().unwrap(),
                port: 443,
            },
        );
        let encoded = encode_data(&map);
        assert_eq!(decode_data(&encoded).unwrap(), map);
    }

    #[test]
    fn commands_round_trip() {
        let cmds = [
            Command::Add {
                sni: "a.example".to_string(),
                host: "10.0.0.1".parse().unwrap(),
                port: 4443,
            },
            Command::Remove {
                sni: "a.example".to_string(),
            },
            Command::List,
        ];
        for cmd in cmds {
            assert_eq!(cmd_of_bytes(&cmd_to_bytes(&cmd)).unwrap(), cmd);
        }
    }

    #[test]
    fn replies_round_trip() {
        let replies = [
            Reply::Result {
                code: 0,
                message: "a.example was successfully added".to_string(),
            },
            Reply::Snis(vec![(
                "a.example".to_string(),
                "10.0.0.1".parse().unwrap(),
                4443,
            )]),
        ];
        for reply in replies {
            assert_eq!(reply_of_bytes(&reply_to_bytes(&reply)).unwrap(), reply);
        }
    }

    #[test]
    fn unknown_command_tag_is_decode_error() {
        assert!(cmd_of_bytes(&[0xff]).is_err());
    }

    #[test]
    fn truncated_map_is_decode_error() {
        assert!(decode_data(&[0, 0, 0, 1]).is_err());
    }
}
