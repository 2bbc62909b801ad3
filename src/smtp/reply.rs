//! Canonical wire bytes for every reply the session can send. The catalog
//! is fixed; only the four service replies and the EHLO greeting carry the
//! configured domain.

use std::borrow::Cow;

/// One complete reply, CRLF terminated. Fixed replies borrow from the
/// catalog, domain-bearing replies are built on demand.
pub type Reply = Cow<'static, [u8]>;

pub const OK: &[u8] = b"250 Requested mail action okay, completed\r\n";
pub const BAD_COMMAND: &[u8] = b"500 Syntax error, command unrecognized\r\n";
pub const BAD_SEQUENCE: &[u8] = b"503 Bad sequence of commands\r\n";
pub const NOT_IMPLEMENTED: &[u8] = b"502 Command not implemented\r\n";
pub const TEMPORARY_FAILURE: &[u8] = b"421 Temporary failure\r\n";

pub const MAIL_FROM_REJECTED_PERMANENT: &[u8] =
    b"550 Requested action not taken: sender is blocked\r\n";
pub const MAIL_FROM_REJECTED_TEMPORARY: &[u8] =
    b"450 Requested mail action not taken: temporarily blocked\r\n";
pub const MAIL_SIZE_REJECTED_PERMANENT: &[u8] =
    b"552 message size exceeds fixed maximium message size\r\n";
pub const MAIL_SIZE_REJECTED_TEMPORARY: &[u8] = b"452 insufficient system storage\r\n";

pub const RCPT_REJECTED_PERMANENT: &[u8] =
    b"550 Requested action not taken: mailbox unavailable\r\n";
pub const RCPT_REJECTED_TEMPORARY: &[u8] =
    b"450 Requested mail action not taken: mailbox unavailable\r\n";

pub const DATA_CONTINUE: &[u8] = b"354 Start mail input; end with <CRLF>.<CRLF>\r\n";
pub const DATA_TRANSACTION_FAILED: &[u8] = b"554 Transaction failed\r\n";
pub const COMMIT_REJECTED_RECIPIENTS: &[u8] =
    b"452 Requested action not taken: too many recipients\r\n";
pub const COMMIT_REJECTED_PERMANENT: &[u8] =
    b"550 Requested action not taken: mailbox unavailable\r\n";
pub const COMMIT_REJECTED_TEMPORARY: &[u8] =
    b"450 Requested mail action not taken: mailbox unavailable\r\n";
pub const COMMIT_REJECTED_SIZE_PERMANENT: &[u8] =
    b"552 Requested mail action aborted: exceeded storage allocation\r\n";
pub const COMMIT_REJECTED_SIZE_TEMPORARY: &[u8] =
    b"452 Requested action not taken: insufficient system storage\r\n";

pub const STARTTLS_READY: &[u8] = b"220 Ready to start TLS\r\n";
pub const STARTTLS_UNAVAILABLE: &[u8] = b"454 TLS not available due to temporary reason\r\n";
pub const STARTTLS_REQUIRED: &[u8] = b"530 Must issue a STARTTLS command first\r\n";

pub fn service_ready(domain: &str) -> Reply {
    format!("220 {} Service ready\r\n", domain).into_bytes().into()
}

pub fn service_closing(domain: &str) -> Reply {
    format!("221 {} Service closing transmission channel\r\n", domain)
        .into_bytes()
        .into()
}

pub fn service_not_available(domain: &str) -> Reply {
    format!(
        "421 {} Service not available, closing transmission channel\r\n",
        domain
    )
    .into_bytes()
    .into()
}

/// Greets the client after EHLO. The extensions block must come
/// pre-formatted with its `250-`/`250 ` continuation markers and is
/// appended verbatim; an empty block collapses the greeting to a single
/// `250` line.
pub fn ehlo_ok(domain: &str, extensions: &[u8]) -> Reply {
    if extensions.is_empty() {
        return format!("250 {} greetings\r\n", domain).into_bytes().into();
    }

    let mut reply = format!("250-{} greetings\r\n", domain).into_bytes();
    reply.extend_from_slice(extensions);
    reply.into()
}
