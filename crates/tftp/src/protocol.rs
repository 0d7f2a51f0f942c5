//! TFTP Protocol Implementation
//!
//! This module contains the wire-level pieces of TFTP: opcodes, error codes,
//! transfer modes, the request parser and a length-checked binary codec for
//! the packets a session exchanges with its peer.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350 with option
//! extensions in RFC 2347, 2348 and 2349. Every integer on the wire is a
//! big-endian 16-bit value and every string is NUL-terminated.
//!
//! ```text
//! RRQ/WRQ | 01/02 | filename | 0 | mode | 0 | [opt | 0 | value | 0]* |
//! DATA    | 03    | block#   | payload (<= negotiated block size)    |
//! ACK     | 04    | block#   |
//! ERROR   | 05    | code     | message | 0 |
//! OACK    | 06    | [opt | 0 | value | 0]* |
//! ```

use std::fmt;
use std::str::FromStr;

/// Smallest block size a client may negotiate (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size a client may negotiate (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Block size used when no `blksize` option is negotiated (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Highest block number a transfer may use.
///
/// Block ids never wrap, so a transfer is limited to this many blocks.
pub const MAX_BLOCK_ID: u16 = 65534;

/// Length of the opcode + block/code header shared by DATA, ACK and ERROR
pub const HEADER_LEN: usize = 4;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries one block of file content. A block shorter than the
    /// negotiated block size ends the transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges a data packet. ACK with block number 0 acknowledges a
    /// write request or an OACK.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Carries the options the server accepted (RFC 2347).
    ///
    /// Packet format: | Opcode | Opt1 | 0 | Value1 | 0 | ... |
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::OptionAck.name(), "OACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350, plus the option negotiation
/// code added by RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see the message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Also used for paths outside the working directory and for files too
    /// large to address with the negotiated block size.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,

    /// Error code 8: Option negotiation failed (RFC 2347)
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(6), Some(TftpErrorCode::FileAlreadyExists));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// `mail` mode from RFC 1350 is obsolete and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, bytes are transferred as-is
    ///
    /// Mode string: "octet"
    Octet,

    /// Text mode, line endings are translated to and from CR-LF
    ///
    /// Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string, case-insensitively
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!("octet".parse::<TransferMode>(), Ok(TransferMode::Octet));
    /// assert_eq!("NetASCII".parse::<TransferMode>(), Ok(TransferMode::NetAscii));
    /// assert!("mail".parse::<TransferMode>().is_err());
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// TFTP Error packet representation
///
/// Every protocol violation a session detects is expressed as one of these
/// and sent to the peer as a single ERROR datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    /// Error code
    pub code: TftpErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl TftpError {
    /// Create a new error with a custom message
    ///
    /// # Examples
    /// ```
    /// use tftp::{TftpError, TftpErrorCode};
    ///
    /// let error = TftpError::new(TftpErrorCode::FileNotFound, "boot.img not found");
    /// assert_eq!(error.code, TftpErrorCode::FileNotFound);
    /// assert_eq!(error.message, "boot.img not found");
    /// ```
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a new error with the default message for the error code
    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn not_defined(message: impl Into<String>) -> Self {
        Self::new(TftpErrorCode::NotDefined, message)
    }

    pub fn file_not_found() -> Self {
        Self::with_default_message(TftpErrorCode::FileNotFound)
    }

    pub fn access_violation(message: impl Into<String>) -> Self {
        Self::new(TftpErrorCode::AccessViolation, message)
    }

    pub fn disk_full() -> Self {
        Self::with_default_message(TftpErrorCode::DiskFull)
    }

    pub fn illegal(message: impl Into<String>) -> Self {
        Self::new(TftpErrorCode::IllegalOperation, message)
    }

    pub fn file_exists() -> Self {
        Self::with_default_message(TftpErrorCode::FileAlreadyExists)
    }

    pub fn option(message: impl Into<String>) -> Self {
        Self::new(TftpErrorCode::OptionNegotiationFailed, message)
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TftpError {}

/// Length-checked cursor over a received datagram
///
/// Every read either returns a field fully contained in the buffer or a
/// `TftpError`; nothing ever indexes past the end of the datagram.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read a big-endian 16-bit field
    pub fn read_u16(&mut self) -> Result<u16, TftpError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or_else(|| TftpError::illegal("Packet truncated"))?;
        self.pos += 2;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a NUL-terminated field, returning the bytes before the NUL
    ///
    /// Returns `None` if the remaining bytes contain no terminator.
    pub fn read_cstr(&mut self) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let end = find_zero(rest, 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Consume and return everything left in the datagram
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Builder for outgoing datagrams
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new(opcode: TftpOpcode) -> Self {
        Self::with_capacity(opcode, HEADER_LEN)
    }

    pub fn with_capacity(opcode: TftpOpcode, capacity: usize) -> Self {
        let mut writer = Self {
            buf: Vec::with_capacity(capacity.max(2)),
        };
        writer.put_u16(opcode.as_u16());
        writer
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a string followed by its NUL terminator
    pub fn put_cstr(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn put_slice(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Kind of an initial request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn opcode(self) -> TftpOpcode {
        match self {
            Self::Read => TftpOpcode::ReadRequest,
            Self::Write => TftpOpcode::WriteRequest,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode().name())
    }
}

/// One `name\0value\0` pair from a request, as sent by the client
///
/// The name is lowercased since option names are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub name: String,
    pub value: String,
}

/// TFTP Request (RRQ/WRQ) representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    pub kind: RequestKind,
    /// Requested filename, exactly as the client sent it
    pub filename: String,
    pub mode: TransferMode,
    /// Options in the order they appeared
    pub options: Vec<RawOption>,
}

impl TftpRequest {
    /// Parse an initial RRQ/WRQ datagram
    ///
    /// An unknown opcode, unterminated filename or mode, or an unsupported
    /// mode is an illegal operation. A truncated option list is an option
    /// error.
    ///
    /// # Examples
    /// ```
    /// use tftp::{RequestKind, TftpRequest, TransferMode};
    ///
    /// let request = TftpRequest::parse(b"\x00\x01boot.img\0OCTET\0blksize\01400\0").unwrap();
    /// assert_eq!(request.kind, RequestKind::Read);
    /// assert_eq!(request.filename, "boot.img");
    /// assert_eq!(request.mode, TransferMode::Octet);
    /// assert_eq!(request.options[0].name, "blksize");
    /// assert_eq!(request.options[0].value, "1400");
    /// ```
    pub fn parse(buf: &[u8]) -> Result<Self, TftpError> {
        let mut reader = PacketReader::new(buf);

        let kind = match TftpOpcode::from_u16(reader.read_u16()?) {
            Some(TftpOpcode::ReadRequest) => RequestKind::Read,
            Some(TftpOpcode::WriteRequest) => RequestKind::Write,
            _ => return Err(TftpError::illegal("Expected a read or write request")),
        };

        let filename = reader
            .read_cstr()
            .ok_or_else(|| TftpError::illegal("Filename not terminated"))?;
        let filename = std::str::from_utf8(filename)
            .map_err(|_| TftpError::illegal("Filename is not valid UTF-8"))?
            .to_string();

        let mode = reader
            .read_cstr()
            .ok_or_else(|| TftpError::illegal("Mode not terminated"))?;
        let mode = std::str::from_utf8(mode)
            .ok()
            .and_then(TransferMode::from_str_opt)
            .ok_or_else(|| {
                TftpError::illegal(format!("Unsupported transfer mode '{}'", String::from_utf8_lossy(mode)))
            })?;

        let options = parse_options(&mut reader)?;

        Ok(Self {
            kind,
            filename,
            mode,
            options,
        })
    }
}

/// Tokenize the option list following the mode field
fn parse_options(reader: &mut PacketReader<'_>) -> Result<Vec<RawOption>, TftpError> {
    let mut options = Vec::new();

    while !reader.is_empty() {
        let name = reader
            .read_cstr()
            .ok_or_else(|| TftpError::option("Option name not terminated"))?;
        let value = reader
            .read_cstr()
            .ok_or_else(|| TftpError::option("Option value missing"))?;

        options.push(RawOption {
            name: String::from_utf8_lossy(name).to_ascii_lowercase(),
            value: String::from_utf8_lossy(value).into_owned(),
        });
    }

    Ok(options)
}

/// A datagram received on a session socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(TftpRequest),
    Data { block: u16, data: Vec<u8> },
    Ack(u16),
    Error { code: u16, message: String },
    OptionAck(Vec<RawOption>),
}

impl Packet {
    /// Decode any TFTP datagram
    ///
    /// Datagrams shorter than a full header are rejected up front.
    pub fn parse(buf: &[u8]) -> Result<Self, TftpError> {
        let opcode = get_tftp_opcode(buf).ok_or_else(|| TftpError::illegal("Unknown or missing opcode"))?;

        match opcode {
            TftpOpcode::ReadRequest | TftpOpcode::WriteRequest => TftpRequest::parse(buf).map(Self::Request),
            TftpOpcode::OptionAck => {
                let mut reader = PacketReader::new(&buf[2..]);
                parse_options(&mut reader).map(Self::OptionAck)
            }
            TftpOpcode::Data | TftpOpcode::Acknowledgment | TftpOpcode::Error => {
                if buf.len() < HEADER_LEN {
                    return Err(TftpError::illegal(format!("{} packet too short", opcode)));
                }

                let mut reader = PacketReader::new(&buf[2..]);
                let field = reader.read_u16()?;

                Ok(match opcode {
                    TftpOpcode::Data => Self::Data {
                        block: field,
                        data: reader.rest().to_vec(),
                    },
                    TftpOpcode::Acknowledgment => Self::Ack(field),
                    _ => {
                        let message = match reader.read_cstr() {
                            Some(msg) => msg,
                            None => reader.rest(),
                        };
                        Self::Error {
                            code: field,
                            message: String::from_utf8_lossy(message).into_owned(),
                        }
                    }
                })
            }
        }
    }

    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Request(request) => request.kind.opcode(),
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
            Self::OptionAck(_) => TftpOpcode::OptionAck,
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Build a TFTP Data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(TftpOpcode::Data, HEADER_LEN + data.len());
    writer.put_u16(block).put_slice(data);
    writer.finish()
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut writer = PacketWriter::new(TftpOpcode::Acknowledgment);
    writer.put_u16(block);
    writer.finish()
}

/// Build a TFTP Error packet
pub fn build_error(error: &TftpError) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(TftpOpcode::Error, HEADER_LEN + error.message.len() + 1);
    writer.put_u16(error.code.as_u16()).put_cstr(&error.message);
    writer.finish()
}

/// Build a TFTP OACK (Option Acknowledgment) packet
///
/// Options are written in the order given.
pub fn build_oack<K: AsRef<str>, V: AsRef<str>>(opts: &[(K, V)]) -> Vec<u8> {
    let mut writer = PacketWriter::new(TftpOpcode::OptionAck);
    for (key, val) in opts {
        writer.put_cstr(key.as_ref()).put_cstr(val.as_ref());
    }
    writer.finish()
}

/// Get the opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    PacketReader::new(buf).read_u16().ok()
}

/// Get the TFTP opcode enum from a packet buffer
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}
