//! The envelope is where mail policy lives. The session drives the SMTP
//! dialog and asks the envelope what to make of each step; the embedder
//! implements the envelope and decides.

use crate::common::*;
use crate::smtp::Session;

/// Verdict on the reverse-path given in MAIL FROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromAction {
    Accept,
    RejectTemporarily,
    RejectPermanently,
}

/// Verdict on the advertised message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeAction {
    Accept,
    RejectTemporarily,
    RejectPermanently,
}

/// Verdict on a forward-path given in RCPT TO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToAction {
    Accept,
    RejectTemporarily,
    RejectPermanently,
}

/// Verdict on opening the envelope for message data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAction {
    Accept,
    Reject,
}

/// Verdict on the final commit, after the client terminated the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Accept,
    RejectTemporarily,
    RejectPermanently,
    RejectTooManyRecipients,
    RejectSizeExceededTemporarily,
    RejectSizeExceededPermanently,
}

/// One SMTP mail envelope: the reverse-path, forward-paths and size hint
/// of a single transaction, plus its message data.
///
/// The session owns at most one envelope at a time and calls it in
/// dialog order: `from`, `size`, zero or more `to`, `open`, zero or more
/// `write`, then either `commit` or `discard`. A non-`Accept` action is a
/// protocol-level reject and keeps the connection alive; returning an
/// error from any operation is fatal and terminates the connection after
/// a best-effort discard.
pub trait Envelope: Send + Sync {
    /// Add the reverse path to the envelope.
    fn from<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<FromAction>>
    where
        'a: 'f,
        's: 'f;

    /// Add a size hint to the envelope. A hint of 0 may mean an advertised
    /// data length of 0 or none advertised.
    fn size(&mut self, hint: u64) -> S1Fut<'_, Result<SizeAction>>;

    /// Add a recipient to the envelope.
    fn to<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<ToAction>>
    where
        'a: 'f,
        's: 'f;

    /// Open the envelope for writing data. Ideally report any trouble
    /// accumulated from `from`, `size` or `to` in this step - a reject
    /// here fails the transaction without dropping the connection.
    fn open(&mut self) -> S1Fut<'_, Result<DataAction>>;

    /// Append one line of message data, trailing CRLF included and
    /// dot-unescaped. The slice borrows the read buffer; consume it or
    /// copy it before returning.
    fn write<'a, 's, 'f>(&'s mut self, line: &'a [u8]) -> S1Fut<'f, Result<()>>
    where
        'a: 'f,
        's: 'f;

    /// Commit the data. Accepting the commit tells the SMTP client the
    /// mail will be delivered.
    fn commit(&mut self) -> S1Fut<'_, Result<CommitAction>>;

    /// Release all transaction state. Errors are logged, not acted on.
    fn discard(&mut self) -> S1Fut<'_, Result<()>>;
}

/// Creates one envelope per MAIL transaction. Sessions run concurrently,
/// so the factory is shared and must tolerate concurrent calls. The
/// session handle exposes who the envelope is for: the session ID, the
/// client address, the declared HELO/EHLO identity and the TLS posture.
pub trait NewEnvelope: Send + Sync {
    fn new_envelope<'a, 's, 'f>(&'s self, session: &'a Session) -> S1Fut<'f, Result<Box<dyn Envelope>>>
    where
        'a: 'f,
        's: 'f;
}
