//! Line protocol spoken between the Fanbridge client and its privileged broker
//!
//! Every request and reply is one ASCII line terminated by `\n`:
//!
//! ```text
//! WRITE <key> <hex> [<hex> ...]   ->  OK | ERR write_args | ERR write_failed
//! READ <key>                      ->  VAL <f64> | RAW <type> <hex ...> | ERR read_nil | ERR read_args
//! anything else                   ->  ERR unknown_cmd
//! ```
//!
//! Keys and type tags are fixed-width (4 bytes) and may contain spaces.

mod key;

pub use key::{SensorKey, TypeTag};

use std::fmt;

/// Maximum accepted request line, excluding the terminator
pub const MAX_LINE_SIZE: usize = 4096;

/// Largest value the controller transport can carry
pub const MAX_VALUE_BYTES: usize = 32;

// ============================================================================
// Error codes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// WRITE without a key or without 1..=32 valid hex bytes
    WriteArgs,
    /// The controller refused the write
    WriteFailed,
    /// The key could not be read at all
    ReadNil,
    /// READ without a well-formed key
    ReadArgs,
    UnknownCmd,
    LineTooLong,
    BadEncoding,
    /// Any code this version does not know
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::WriteArgs => "write_args",
            ErrorCode::WriteFailed => "write_failed",
            ErrorCode::ReadNil => "read_nil",
            ErrorCode::ReadArgs => "read_args",
            ErrorCode::UnknownCmd => "unknown_cmd",
            ErrorCode::LineTooLong => "line_too_long",
            ErrorCode::BadEncoding => "bad_encoding",
            ErrorCode::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "write_args" => ErrorCode::WriteArgs,
            "write_failed" => ErrorCode::WriteFailed,
            "read_nil" => ErrorCode::ReadNil,
            "read_args" => ErrorCode::ReadArgs,
            "unknown_cmd" => ErrorCode::UnknownCmd,
            "line_too_long" => ErrorCode::LineTooLong,
            "bad_encoding" => ErrorCode::BadEncoding,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Write { key: SensorKey, bytes: Vec<u8> },
    Read { key: SensorKey },
}

fn strip_terminator(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Split off the fixed-width key that follows a verb
fn split_key(rest: &str) -> Option<(SensorKey, &str)> {
    let key = rest.get(..4)?;
    let key = SensorKey::new(key).ok()?;
    Some((key, &rest[4..]))
}

impl Command {
    /// Parse one request line. The error is the code the broker should reply with.
    pub fn parse(line: &str) -> Result<Command, ErrorCode> {
        let line = strip_terminator(line);
        let (verb, rest) = match line.find(' ') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, ""),
        };

        match verb {
            "WRITE" => {
                let (key, tail) = split_key(rest).ok_or(ErrorCode::WriteArgs)?;
                if !tail.is_empty() && !tail.starts_with(' ') {
                    return Err(ErrorCode::WriteArgs);
                }
                let bytes = decode_hex(tail).map_err(|_| ErrorCode::WriteArgs)?;
                if bytes.is_empty() || bytes.len() > MAX_VALUE_BYTES {
                    return Err(ErrorCode::WriteArgs);
                }
                Ok(Command::Write { key, bytes })
            }
            "READ" => {
                let (key, tail) = split_key(rest).ok_or(ErrorCode::ReadArgs)?;
                if !tail.trim().is_empty() {
                    return Err(ErrorCode::ReadArgs);
                }
                Ok(Command::Read { key })
            }
            _ => Err(ErrorCode::UnknownCmd),
        }
    }

    /// Render the request without its terminating newline
    pub fn to_line(&self) -> String {
        match self {
            Command::Write { key, bytes } => format!("WRITE {} {}", key, encode_hex(bytes)),
            Command::Read { key } => format!("READ {}", key),
        }
    }

    pub fn key(&self) -> SensorKey {
        match self {
            Command::Write { key, .. } | Command::Read { key } => *key,
        }
    }
}

// ============================================================================
// Replies
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Val(f64),
    Raw { type_tag: TypeTag, bytes: Vec<u8> },
    Err(ErrorCode),
}

impl Reply {
    pub fn to_line(&self) -> String {
        match self {
            Reply::Ok => "OK".to_string(),
            Reply::Val(v) => format!("VAL {}", v),
            Reply::Raw { type_tag, bytes } => format!("RAW {} {}", type_tag, encode_hex(bytes)),
            Reply::Err(code) => format!("ERR {}", code),
        }
    }

    pub fn parse(line: &str) -> Result<Reply, String> {
        let line = strip_terminator(line);
        if line == "OK" {
            return Ok(Reply::Ok);
        }
        if let Some(rest) = line.strip_prefix("VAL ") {
            return rest
                .trim()
                .parse::<f64>()
                .map(Reply::Val)
                .map_err(|e| format!("bad VAL payload {:?}: {}", rest, e));
        }
        if let Some(rest) = line.strip_prefix("RAW ") {
            let tag = rest
                .get(..4)
                .ok_or_else(|| format!("RAW reply without type tag: {:?}", line))?;
            let type_tag = TypeTag::new(tag)?;
            let bytes = decode_hex(&rest[4..])?;
            return Ok(Reply::Raw { type_tag, bytes });
        }
        if let Some(rest) = line.strip_prefix("ERR ") {
            return Ok(Reply::Err(ErrorCode::from_wire(rest.trim())));
        }
        Err(format!("unrecognised reply: {:?}", line))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok)
    }
}

// ============================================================================
// Hex helpers
// ============================================================================

/// Lowercase, space separated: `[0x00, 0x64]` becomes `"00 64"`
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse whitespace separated hex bytes. Each token is one or two hex digits.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    s.split_whitespace()
        .map(|tok| {
            if tok.len() > 2 || !tok.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!("invalid hex byte: {:?}", tok));
            }
            u8::from_str_radix(tok, 16).map_err(|_| format!("invalid hex byte: {:?}", tok))
        })
        .collect()
}
