//! Broker session loop
//!
//! Reads request bytes into a growable buffer, answers every complete line
//! with exactly one reply line, and keeps the session alive across bad
//! input. Dispatch is a plain function over `SmcAccess`, so the whole loop
//! runs against an in-memory controller in tests.

use std::io::{ErrorKind, Read, Write};

use fb_core::smc::{fans, SmcAccess};
use fb_error::{FanbridgeError, Result};
use fb_protocol::{Command, ErrorCode, Reply, MAX_LINE_SIZE, MAX_VALUE_BYTES};
use tracing::{debug, info, trace, warn};

/// Read chunk size
const READ_CHUNK: usize = 512;

/// Counters for one client session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub writes: u64,
    pub errors: u64,
}

/// Answer one request line. Blank lines get no reply.
pub fn dispatch(line: &[u8], smc: &mut dyn SmcAccess) -> Option<Reply> {
    let Ok(text) = std::str::from_utf8(line) else {
        return Some(Reply::Err(ErrorCode::BadEncoding));
    };
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        return None;
    }

    let command = match Command::parse(text) {
        Ok(command) => command,
        Err(code) => return Some(Reply::Err(code)),
    };

    let reply = match command {
        Command::Write { key, mut bytes } => {
            bytes.truncate(MAX_VALUE_BYTES);
            if smc.write(key, &bytes) {
                Reply::Ok
            } else {
                Reply::Err(ErrorCode::WriteFailed)
            }
        }
        Command::Read { key } => match smc.read_raw(key) {
            Some(raw) => match raw.decode() {
                Some(value) => Reply::Val(value),
                None => Reply::Raw {
                    type_tag: raw.type_tag,
                    bytes: raw.bytes,
                },
            },
            None => Reply::Err(ErrorCode::ReadNil),
        },
    };
    Some(reply)
}

fn send_reply<W: Write>(writer: &mut W, reply: &Reply) -> Result<()> {
    let mut line = reply.to_line();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| FanbridgeError::channel_dead(format!("reply write failed: {}", e)))
}

/// Serve one client until it closes the request channel
pub fn serve_session<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    smc: &mut dyn SmcAccess,
) -> Result<SessionStats> {
    let mut stats = SessionStats::default();
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    // dropping the rest of an oversized line
    let mut discarding = false;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FanbridgeError::channel_dead(format!("request read failed: {}", e))),
        };
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if discarding {
                discarding = false;
                continue;
            }
            let line = &line[..pos];
            if line.len() > MAX_LINE_SIZE {
                stats.errors += 1;
                send_reply(writer, &Reply::Err(ErrorCode::LineTooLong))?;
                continue;
            }

            let Some(reply) = dispatch(line, smc) else {
                continue;
            };
            stats.requests += 1;
            match &reply {
                Reply::Err(code) => {
                    stats.errors += 1;
                    debug!(error = %code, "request rejected");
                }
                Reply::Ok => stats.writes += 1,
                _ => {}
            }
            trace!(request = %String::from_utf8_lossy(line), reply = %reply.to_line(), "handled");
            send_reply(writer, &reply)?;
        }

        if !discarding && buffer.len() > MAX_LINE_SIZE {
            warn!(size = buffer.len(), max = MAX_LINE_SIZE, "request line too long, discarding");
            stats.errors += 1;
            send_reply(writer, &Reply::Err(ErrorCode::LineTooLong))?;
            buffer.clear();
            discarding = true;
        } else if discarding {
            buffer.clear();
        }
    }

    info!(
        requests = stats.requests,
        writes = stats.writes,
        errors = stats.errors,
        "client session ended"
    );
    Ok(stats)
}

/// Hand the fans back after a session that wrote anything; the client may
/// have gone away with fans still forced.
pub fn release_fans(smc: &mut dyn SmcAccess) -> bool {
    let found = fans::discover_fans(smc);
    fans::reset_all_to_automatic(smc, &found)
}
