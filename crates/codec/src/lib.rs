//! ## HousePortal wire grammar
//!
//! Every registration message is one ASCII line carried in one UDP datagram,
//! space-separated tokens, at most [`MAX_DATAGRAM`] bytes. The same grammar,
//! minus the timestamp, is used for the static configuration file.
//!
//! - `REDIRECT <timestamp> [<host>:]<port> [HIDE] [PID:<n>] <serviceref> ...`
//! - `PEER <timestamp> <endpoint>[=<expiration>] ...`
//! - `LOCAL` and `SIGN SHA-256 <hexkey>` (configuration file only)
//!
//! A datagram may end with a signature suffix: a space, the method literal
//! `SHA-256`, a space, and 8 lowercase hex digits. The tag is the truncated
//! HMAC of the payload with a trailing NUL appended.
//!
//! This crate is pure: it parses lines into typed [`message::Payload`]
//! variants, formats them back, and computes signature tags. It never touches
//! a socket and never mutates its input.

pub mod crypto;
pub mod message;

use std::{num::ParseIntError, str::Utf8Error};

/// One message per datagram; nothing larger is ever sent or accepted.
pub const MAX_DATAGRAM: usize = 1400;

/// The only signature method defined on the wire.
pub const SIGNATURE_METHOD: &str = "SHA-256";

/// The wire tag keeps only this many bytes of the HMAC output to save
/// datagram space. This is a spoofing deterrent on a home LAN, not a strong
/// authentication primitive.
pub const SIGNATURE_TAG_BYTES: usize = 4;

/// Bytes a signature suffix adds to a payload: space, method, space, hex tag.
pub const SIGNATURE_SUFFIX: usize = SIGNATURE_METHOD.len() + SIGNATURE_TAG_BYTES * 2 + 2;

#[derive(Debug)]
pub enum Error {
    EmptyMessage,
    UnknownKeyword(String),
    MissingTimestamp,
    MissingTarget,
    BadTarget(String),
    BadPath(String),
    BadPid(String),
    BadEndpoint(String),
    BadExpiration(String),
    BadHexKey(String),
    UnknownSignatureMethod(String),
    MissingSignature,
    SignatureMismatch,
    Oversize(usize),
    Utf8Error(Utf8Error),
    ParseIntError(ParseIntError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<ParseIntError> for Error {
    fn from(value: ParseIntError) -> Self {
        Self::ParseIntError(value)
    }
}

/// Wall clock as unix epoch seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Parse the static configuration text into its directives.
///
/// `#` introduces a comment and blank lines are skipped. Any invalid line is
/// fatal: the caller keeps its previous configuration (or refuses to start).
///
/// # Example
///
/// ```
/// use house_portal_codec::{message::Payload, parse_config};
///
/// let directives = parse_config(
///     "# front door rules\n\
///      REDIRECT 127.0.0.1:8080 HIDE /app\n\
///      \n\
///      PEER attic\n",
/// )
/// .unwrap();
///
/// assert_eq!(directives.len(), 2);
/// assert!(matches!(directives[0], Payload::Redirect(_)));
/// assert!(matches!(directives[1], Payload::Peers(_)));
/// ```
pub fn parse_config(text: &str) -> Result<Vec<message::Payload>, Error> {
    let mut directives = Vec::new();

    for line in text.lines() {
        let line = match line.find('#') {
            Some(comment) => &line[..comment],
            None => line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        directives.push(message::Payload::parse(line, false)?);
    }

    Ok(directives)
}
