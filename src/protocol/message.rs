//! Wire format of protocol messages.
//!
//! Every datagram starts with a fixed 12 byte header:
//!
//! | field      | type  |
//! |------------|-------|
//! | subport    | `u32` |
//! | seqno      | `u32` |
//! | command    | `u16` |
//! | fragment   | `u8`  |
//! | fragments  | `u8`  |
//!
//! `CONNECT` is followed by a NUL terminated service name. `QUERY`,
//! `RESPONSE` and `FRAGMENT` are followed by a data header (total length and
//! fragment length, both `u16`) and the fragment bytes. Every other command
//! is header only. All integers are big-endian (network order).
use std::{fmt, string::FromUtf8Error};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_into_std_write,
};
use thiserror::Error;

pub const HEADER_SIZE: usize = 12;
pub const DATA_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("illegal command received: {0}")]
    UnknownCommand(u16),

    #[error("truncated {command} message: expected {expected} data bytes, got {actual}")]
    Truncated {
        command: Command,
        expected: usize,
        actual: usize,
    },

    #[error("invalid service name: {0}")]
    ServiceName(#[from] FromUtf8Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Message types; each request has a matching acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Connect = 1,
    Cack = 2,
    Query = 3,
    Qack = 4,
    Response = 5,
    Rack = 6,
    Disconnect = 7,
    Dack = 8,
    Fragment = 9,
    Fack = 10,
    Ping = 11,
    Pack = 12,
    Seqno = 13,
    Sack = 14,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Cack => "CACK",
            Command::Query => "QUERY",
            Command::Qack => "QACK",
            Command::Response => "RESPONSE",
            Command::Rack => "RACK",
            Command::Disconnect => "DISCONNECT",
            Command::Dack => "DACK",
            Command::Fragment => "FRAGMENT",
            Command::Fack => "FACK",
            Command::Ping => "PING",
            Command::Pack => "PACK",
            Command::Seqno => "SEQNO",
            Command::Sack => "SACK",
        }
    }

    /// Commands whose body is a data header plus payload bytes.
    pub fn carries_data(&self) -> bool {
        matches!(self, Command::Query | Command::Response | Command::Fragment)
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let command = match value {
            1 => Command::Connect,
            2 => Command::Cack,
            3 => Command::Query,
            4 => Command::Qack,
            5 => Command::Response,
            6 => Command::Rack,
            7 => Command::Disconnect,
            8 => Command::Dack,
            9 => Command::Fragment,
            10 => Command::Fack,
            11 => Command::Ping,
            12 => Command::Pack,
            13 => Command::Seqno,
            14 => Command::Sack,
            code => return Err(ProtocolError::UnknownCommand(code)),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
struct PayloadHeader {
    subport: u32,
    seqno: u32,
    command: u16,
    fragment: u8,
    fragments: u8,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
struct DataHeader {
    total_len: u16,
    fragment_len: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    Service(String),
    Data { total_len: u16, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subport: u32,
    pub seqno: u32,
    pub command: Command,
    pub fragment: u8,
    pub fragments: u8,
    pub body: Body,
}

fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

impl Message {
    pub fn control(
        command: Command,
        subport: u32,
        seqno: u32,
        fragment: u8,
        fragments: u8,
    ) -> Self {
        Self {
            subport,
            seqno,
            command,
            fragment,
            fragments,
            body: Body::Empty,
        }
    }

    pub fn connect(subport: u32, seqno: u32, service: &str) -> Self {
        Self {
            body: Body::Service(service.to_string()),
            ..Self::control(Command::Connect, subport, seqno, 1, 1)
        }
    }

    pub fn data(
        command: Command,
        subport: u32,
        seqno: u32,
        fragment: u8,
        fragments: u8,
        total_len: u16,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            body: Body::Data { total_len, bytes },
            ..Self::control(command, subport, seqno, fragment, fragments)
        }
    }

    /// Payload bytes carried by this message; empty for non-data commands.
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            Body::Data { bytes, .. } => bytes,
            _ => &[],
        }
    }

    /// Declared length of the whole payload this message is part of.
    pub fn total_len(&self) -> usize {
        match &self.body {
            Body::Data { total_len, .. } => *total_len as usize,
            _ => 0,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match &self.body {
            Body::Service(name) => Some(name),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let config = wire_config();
        let mut out = Vec::with_capacity(HEADER_SIZE + DATA_HEADER_SIZE + self.bytes().len());
        let header = PayloadHeader {
            subport: self.subport,
            seqno: self.seqno,
            command: self.command as u16,
            fragment: self.fragment,
            fragments: self.fragments,
        };
        encode_into_std_write(header, &mut out, config)?;

        match &self.body {
            Body::Empty => {}
            Body::Service(name) => {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            Body::Data { total_len, bytes } => {
                let data = DataHeader {
                    total_len: *total_len,
                    fragment_len: bytes.len() as u16,
                };
                encode_into_std_write(data, &mut out, config)?;
                out.extend_from_slice(bytes);
            }
        }

        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let config = wire_config();
        let (header, read): (PayloadHeader, usize) = decode_from_slice(buf, config)?;
        let command = Command::try_from(header.command)?;
        let rest = &buf[read..];

        let body = match command {
            Command::Connect => {
                let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
                Body::Service(String::from_utf8(rest[..end].to_vec())?)
            }
            c if c.carries_data() => {
                let (data, read): (DataHeader, usize) = decode_from_slice(rest, config)?;
                let rest = &rest[read..];
                let expected = data.fragment_len as usize;
                if rest.len() < expected {
                    return Err(ProtocolError::Truncated {
                        command,
                        expected,
                        actual: rest.len(),
                    });
                }
                Body::Data {
                    total_len: data.total_len,
                    bytes: rest[..expected].to_vec(),
                }
            }
            _ => Body::Empty,
        };

        Ok(Self {
            subport: header.subport,
            seqno: header.seqno,
            command,
            fragment: header.fragment,
            fragments: header.fragments,
            body,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:08x}/{}/{}/{}",
            self.command, self.subport, self.seqno, self.fragment, self.fragments
        )?;
        match &self.body {
            Body::Empty => Ok(()),
            Body::Service(name) => write!(f, " {name}"),
            Body::Data { total_len, bytes } => {
                write!(f, " [{}/{} bytes]", bytes.len(), total_len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_network_order() {
        let msg = Message::control(Command::Qack, 0x0102_0304, 0x0a0b_0c0d, 2, 5);
        let bytes = msg.encode().unwrap();

        assert_eq!(
            bytes,
            vec![1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d, 0, 4, 2, 5]
        );
        assert_eq!(bytes.len(), HEADER_SIZE);
    }

    #[test]
    fn connect_carries_nul_terminated_name() {
        let bytes = Message::connect(7, 1, "HWDB").encode().unwrap();

        assert_eq!(&bytes[HEADER_SIZE..], b"HWDB\0");
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.command, Command::Connect);
        assert_eq!(decoded.service(), Some("HWDB"));
    }

    #[test]
    fn data_message_layout() {
        let msg = Message::data(Command::Fragment, 7, 3, 1, 2, 1500, vec![9; 1024]);
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE + DATA_HEADER_SIZE + 1024);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 4], &[0x05, 0xdc, 0x04, 0x00]);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.total_len(), 1500);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut bytes = Message::control(Command::Ping, 1, 1, 1, 1).encode().unwrap();
        bytes[9] = 99;

        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownCommand(99))
        ));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut bytes = Message::data(Command::Query, 1, 1, 1, 1, 50, vec![1; 50])
            .encode()
            .unwrap();
        bytes.truncate(bytes.len() - 10);

        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::Truncated {
                expected: 50,
                actual: 40,
                ..
            })
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            Message::decode(&[0, 0, 0, 1, 0]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn display_summarises_message() {
        let msg = Message::data(Command::Query, 0xff, 2, 1, 1, 3, b"abc".to_vec());
        assert_eq!(msg.to_string(), "QUERY/000000ff/2/1/1 [3/3 bytes]");
    }
}
