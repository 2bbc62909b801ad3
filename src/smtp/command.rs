//! The SMTP command grammar. One CRLF-terminated line comes in, a typed
//! [`Command`] comes out. The parser only checks shape - whether an address
//! or size hint makes any semantic sense is the session's business.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::fmt;

// Patterns operate on raw bytes ((?-u)); address payloads need not be UTF-8.
static COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i-u)^([A-Z]+)(\r\n$| +\r\n$| +(.*) *\r\n$)").expect("command pattern"));
static HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?-u)([^ ]+)").expect("host pattern"));
static FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i-u)FROM:<([^>]+)>").expect("from pattern"));
static TO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i-u)TO:<([^>]+)>").expect("to pattern"));
static SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i-u)SIZE=([1-9][0-9]*|0)").expect("size pattern"));

/// One parsed client command. Verbs are matched case-insensitively;
/// extracted addresses are owned copies so they outlive the read buffer
/// they were sliced from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(Option<Vec<u8>>),
    Ehlo(Option<Vec<u8>>),
    /// Reverse-path and advertised message size; a hint of 0 means none
    /// was advertised.
    Mail { addr: Option<Vec<u8>>, size_hint: u64 },
    Rcpt(Option<Vec<u8>>),
    Data,
    Rset,
    Quit,
    Noop,
    Help,
    Expn,
    Vrfy,
    StartTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The line does not have the shape of an SMTP command.
    BadFormat,
    /// The verb is not one we know.
    Unrecognized,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadFormat => write!(f, "line is not a well formed command"),
            ParseError::Unrecognized => write!(f, "command verb is not recognized"),
        }
    }
}

impl std::error::Error for ParseError {}

pub fn parse_command(line: &[u8]) -> Result<Command, ParseError> {
    let parts = COMMAND.captures(line).ok_or(ParseError::BadFormat)?;

    let verb = parts
        .get(1)
        .map(|m| m.as_bytes().to_ascii_uppercase())
        .unwrap_or_default();
    let args = parts.get(3).map(|m| m.as_bytes()).unwrap_or(b"");
    let args = args.trim_ascii();

    match verb.as_slice() {
        b"HELO" => Ok(Command::Helo(host(args))),
        b"EHLO" => Ok(Command::Ehlo(host(args))),
        b"MAIL" => Ok(Command::Mail {
            addr: angle_addr(&FROM, args),
            size_hint: size_hint(args),
        }),
        b"RCPT" => Ok(Command::Rcpt(angle_addr(&TO, args))),
        b"DATA" => Ok(Command::Data),
        b"RSET" => Ok(Command::Rset),
        b"QUIT" => Ok(Command::Quit),
        b"NOOP" => Ok(Command::Noop),
        b"HELP" => Ok(Command::Help),
        b"EXPN" => Ok(Command::Expn),
        b"VRFY" => Ok(Command::Vrfy),
        b"STARTTLS" => Ok(Command::StartTls),
        _ => Err(ParseError::Unrecognized),
    }
}

/// First whitespace-free token, as HELO/EHLO report their identity.
fn host(args: &[u8]) -> Option<Vec<u8>> {
    HOST.captures(args)
        .and_then(|m| m.get(1))
        .map(|m| m.as_bytes().to_vec())
}

/// Angle-enclosed path payload, `FROM:<...>` or `TO:<...>`.
fn angle_addr(pattern: &Regex, args: &[u8]) -> Option<Vec<u8>> {
    pattern
        .captures(args)
        .and_then(|m| m.get(1))
        .map(|m| m.as_bytes().to_vec())
}

/// Decimal `SIZE=` parameter. Anything that does not parse as a u64 - no
/// parameter at all, or a value past the integer range - counts as not
/// advertised.
fn size_hint(args: &[u8]) -> u64 {
    SIZE.captures(args)
        .and_then(|m| m.get(1))
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}
