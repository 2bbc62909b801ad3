//! CRLF framing over the filled prefix of the session buffer. Line slices
//! alias the input; nothing is copied until a command parser asks for an
//! owned address.

use memchr::memmem;

const CRLF: &[u8] = b"\r\n";

/// Splits a byte buffer into complete CRLF-terminated lines, terminators
/// included. Iteration can be cut short with [`stop`](Lines::stop) - the
/// rest of the buffer is then treated as consumed, which is how pipelined
/// plaintext gets dropped after STARTTLS. Otherwise [`remainder`]
/// (Lines::remainder) hands back the incomplete tail so the caller can
/// slide it to the front of the buffer and keep reading.
pub(crate) struct Lines<'a> {
    rest: &'a [u8],
    stopped: bool,
}

impl<'a> Lines<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Lines {
            rest: buffer,
            stopped: false,
        }
    }

    /// Discards all remaining buffered input.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// The incomplete tail after the last complete line, or `None` once
    /// stopped.
    pub fn remainder(&self) -> Option<&'a [u8]> {
        if self.stopped {
            None
        } else {
            Some(self.rest)
        }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.stopped {
            return None;
        }

        match memmem::find(self.rest, CRLF) {
            None => None,
            Some(at) => {
                let (line, rest) = self.rest.split_at(at + CRLF.len());
                self.rest = rest;
                Some(line)
            }
        }
    }
}
