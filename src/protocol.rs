//! TFTP wire protocol: opcodes, error codes, transfer modes, and the packet
//! codec.
//!
//! Every TFTP datagram starts with a two-byte big-endian opcode. RRQ, WRQ,
//! OACK and ERROR carry NUL-terminated strings; DATA and ACK carry a block
//! number. Strings on the wire are byte sequences and are not required to be
//! valid UTF-8, so the decoded representation keeps them as `Vec<u8>` and only
//! converts lossily for display.

use std::borrow::Cow;
use std::fmt;

/// Block size used when no `blksize` option is negotiated (RFC 1350).
pub const DEF_BLKSIZE: usize = 512;

/// Smallest negotiable block size (RFC 2348).
pub const MIN_BLKSIZE: usize = 8;

/// Largest negotiable block size (RFC 2348).
pub const MAX_BLKSIZE: usize = 65464;

/// Largest datagram a conforming peer can send: a full-size DATA packet.
pub const MAX_DATAGRAM: usize = MAX_BLKSIZE + 4;

/// TFTP opcodes as defined in RFC 1350 and RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read request - opcode 1
    Rrq = 1,
    /// Write request - opcode 2
    Wrq = 2,
    /// File data block - opcode 3
    Data = 3,
    /// Acknowledgment - opcode 4
    Ack = 4,
    /// Error report - opcode 5
    Error = 5,
    /// Option acknowledgment (RFC 2347) - opcode 6
    Oack = 6,
}

impl Opcode {
    /// Convert a wire value to an opcode.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The conventional short name used in logs and RFC diagrams.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Oack => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes from RFC 1350, plus code 8 from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: generic error, see the message for details.
    NotDefined = 0,
    /// Error code 1: the requested file does not exist.
    FileNotFound = 1,
    /// Error code 2: the peer lacks permission for the file or operation,
    /// including attempts to escape the server root.
    AccessViolation = 2,
    /// Error code 3: no space left to complete a write.
    DiskFull = 3,
    /// Error code 4: malformed or unexpected packet.
    IllegalOperation = 4,
    /// Error code 5: packet received from an unknown transfer ID.
    UnknownTransferId = 5,
    /// Error code 6: refused to overwrite an existing file.
    FileAlreadyExists = 6,
    /// Error code 7: no such user.
    NoSuchUser = 7,
    /// Error code 8: option negotiation failed (RFC 2347).
    OptionNegotiation = 8,
}

impl ErrorCode {
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
            8 => Some(Self::OptionNegotiation),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The default human-readable message for this code.
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
            Self::OptionNegotiation => "Option negotiation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Transfer modes named by RFC 1350. Only octet transfers are supported;
/// netascii and mail requests are answered with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Octet,
    Netascii,
    Mail,
}

impl TransferMode {
    /// Parse a mode string from the wire. The comparison is case-insensitive.
    pub fn from_bytes(s: &[u8]) -> Option<Self> {
        if s.eq_ignore_ascii_case(b"octet") {
            Some(Self::Octet)
        } else if s.eq_ignore_ascii_case(b"netascii") {
            Some(Self::Netascii)
        } else if s.eq_ignore_ascii_case(b"mail") {
            Some(Self::Mail)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Netascii => "netascii",
            Self::Mail => "mail",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One `name`/`value` pair from an RRQ, WRQ or OACK option list.
///
/// Names are matched case-insensitively but the original spelling is kept, so
/// an OACK can echo exactly what the requester sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPair {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl OptionPair {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    /// The value as a decimal integer, if it parses as one.
    pub fn value_u64(&self) -> Option<u64> {
        std::str::from_utf8(&self.value).ok()?.parse().ok()
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn value_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Look up an option by name, case-insensitively. When a name appears more
/// than once the last occurrence wins.
pub fn find_option<'a>(options: &'a [OptionPair], name: &str) -> Option<&'a OptionPair> {
    options.iter().rev().find(|o| o.is_named(name))
}

/// The shared body of RRQ and WRQ packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: Vec<u8>,
    pub mode: Vec<u8>,
    pub options: Vec<OptionPair>,
}

impl Request {
    pub fn new(filename: impl Into<Vec<u8>>, options: Vec<OptionPair>) -> Self {
        Self {
            filename: filename.into(),
            mode: b"octet".to_vec(),
            options,
        }
    }

    pub fn mode(&self) -> Option<TransferMode> {
        TransferMode::from_bytes(&self.mode)
    }

    pub fn filename_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.filename)
    }
}

/// A decoded TFTP packet, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: Vec<u8> },
    Oack { options: Vec<OptionPair> },
}

/// Why a datagram failed to decode as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the fixed header of its packet type.
    Truncated,
    /// The first two bytes are not a known opcode.
    UnknownOpcode(u16),
    /// A string field is missing its NUL terminator.
    UnterminatedString,
    /// An option name or value between terminators is empty.
    EmptyOption,
    /// A DATA payload longer than the largest negotiable block size.
    OversizedPayload(usize),
    /// An ERROR code outside the defined table.
    ErrorCodeOutOfRange(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "packet too short"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::UnterminatedString => write!(f, "string field missing NUL terminator"),
            Self::EmptyOption => write!(f, "empty option name or value"),
            Self::OversizedPayload(n) => write!(f, "DATA payload of {n} bytes exceeds {MAX_BLKSIZE}"),
            Self::ErrorCodeOutOfRange(c) => write!(f, "error code {c} out of range"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<Vec<u8>>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// An ERROR packet carrying the code's default message.
    pub fn error_with_default(code: ErrorCode) -> Self {
        Self::error(code, code.default_message())
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Rrq(_) => Opcode::Rrq,
            Self::Wrq(_) => Opcode::Wrq,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::Oack,
        }
    }

    /// Encode the packet into a wire datagram. Total for well-formed packets.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::Rrq(req) | Self::Wrq(req) => {
                buf.extend_from_slice(&req.filename);
                buf.push(0);
                buf.extend_from_slice(&req.mode);
                buf.push(0);
                encode_options(&mut buf, &req.options);
            }
            Self::Data { block, payload } => {
                buf.reserve(2 + payload.len());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message);
                buf.push(0);
            }
            Self::Oack { options } => {
                encode_options(&mut buf, options);
            }
        }

        buf
    }

    /// Decode a wire datagram. Partial over bytes: anything that is not a
    /// well-formed packet yields a [`DecodeError`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated);
        }

        let op = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(op).ok_or(DecodeError::UnknownOpcode(op))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let mut at = 2;
                let filename = take_cstr(buf, &mut at)?.to_vec();
                let mode = take_cstr(buf, &mut at)?.to_vec();
                let options = decode_options(buf, at)?;
                let req = Request { filename, mode, options };

                Ok(match opcode {
                    Opcode::Rrq => Self::Rrq(req),
                    _ => Self::Wrq(req),
                })
            }
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                let payload = buf[4..].to_vec();
                if payload.len() > MAX_BLKSIZE {
                    return Err(DecodeError::OversizedPayload(payload.len()));
                }
                Ok(Self::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload,
                })
            }
            Opcode::Ack => {
                // Some peers pad ACKs; anything past the block number is ignored.
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                Ok(Self::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                let raw = u16::from_be_bytes([buf[2], buf[3]]);
                let code = ErrorCode::from_u16(raw).ok_or(DecodeError::ErrorCodeOutOfRange(raw))?;
                // Tolerate a missing trailing NUL, as tftpd implementations vary.
                let rest = &buf[4..];
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                Ok(Self::Error {
                    code,
                    message: rest[..end].to_vec(),
                })
            }
            Opcode::Oack => Ok(Self::Oack {
                options: decode_options(buf, 2)?,
            }),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rrq(req) => write!(f, "RRQ file={} mode={}", req.filename_lossy(), String::from_utf8_lossy(&req.mode)),
            Self::Wrq(req) => write!(f, "WRQ file={} mode={}", req.filename_lossy(), String::from_utf8_lossy(&req.mode)),
            Self::Data { block, payload } => write!(f, "DATA block={block} len={}", payload.len()),
            Self::Ack { block } => write!(f, "ACK block={block}"),
            Self::Error { code, message } => {
                write!(f, "ERROR code={} msg={}", code.as_u16(), String::from_utf8_lossy(message))
            }
            Self::Oack { options } => {
                write!(f, "OACK")?;
                for opt in options {
                    write!(f, " {}={}", opt.name_lossy(), opt.value_lossy())?;
                }
                Ok(())
            }
        }
    }
}

fn encode_options(buf: &mut Vec<u8>, options: &[OptionPair]) {
    for opt in options {
        buf.extend_from_slice(&opt.name);
        buf.push(0);
        buf.extend_from_slice(&opt.value);
        buf.push(0);
    }
}

/// Consume one NUL-terminated string starting at `*at`, advancing past the
/// terminator.
fn take_cstr<'a>(buf: &'a [u8], at: &mut usize) -> Result<&'a [u8], DecodeError> {
    let start = *at;
    let rel = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::UnterminatedString)?;
    *at = start + rel + 1;
    Ok(&buf[start..start + rel])
}

fn decode_options(buf: &[u8], mut at: usize) -> Result<Vec<OptionPair>, DecodeError> {
    let mut options = Vec::new();

    while at < buf.len() {
        let name = take_cstr(buf, &mut at)?;
        let value = take_cstr(buf, &mut at)?;
        if name.is_empty() || value.is_empty() {
            return Err(DecodeError::EmptyOption);
        }
        options.push(OptionPair::new(name, value));
    }

    Ok(options)
}
