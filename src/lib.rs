//! An embeddable SMTP server core.
//!
//! Mailslot speaks SMTP on a single already-accepted connection and drives
//! the client through the RFC 5321 mail-submission dialog. It is a library,
//! not a mail server: it does not listen on sockets, store mail, route it,
//! or authenticate anyone. Every policy decision - accept or reject a
//! sender, a recipient, a size hint, the message body, the final commit -
//! is delegated to an [`Envelope`](mail::Envelope) the embedder supplies
//! through a [`NewEnvelope`](mail::NewEnvelope) factory.
//!
//! The pieces, bottom up:
//! * the command parser in [`smtp`] turns one CRLF line into a typed
//!   [`Command`](smtp::Command),
//! * the per-connection [`Session`](smtp::Session) state machine validates
//!   command sequencing and maps envelope verdicts to the wire replies in
//!   [`smtp::reply`],
//! * the dialog driver behind [`Server`](server::Server) frames lines out
//!   of a pooled byte buffer, pumps them through the session and handles
//!   the STARTTLS upgrade through the [`TlsUpgrade`](io::tls::TlsUpgrade)
//!   seam.
//!
//! ```no_run
//! use async_std::net::TcpListener;
//! use async_std::prelude::*;
//! use mailslot::common::*;
//! use mailslot::mail::{Envelope, NewEnvelope};
//! use mailslot::server::{Config, Server};
//! use mailslot::smtp::Session;
//!
//! # struct SinkMail;
//! # impl NewEnvelope for SinkMail {
//! #     fn new_envelope<'a, 's, 'f>(
//! #         &'s self,
//! #         _session: &'a Session,
//! #     ) -> S1Fut<'f, Result<Box<dyn Envelope>>>
//! #     where
//! #         'a: 'f,
//! #         's: 'f,
//! #     {
//! #         unimplemented!()
//! #     }
//! # }
//! async fn serve() -> Result<()> {
//!     let server = Server::new(Config::new(Arc::new(SinkMail)).with_domain("example.com"));
//!     let listener = TcpListener::bind("localhost:2525").await?;
//!     let mut incoming = listener.incoming();
//!     while let Some(stream) = incoming.next().await {
//!         let stream = stream?;
//!         let addr = stream.peer_addr()?.to_string();
//!         server.accept(stream, addr, None);
//!     }
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod io;
pub mod mail;
pub mod server;
pub mod smtp;

pub mod common {
    pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
    pub type Result<T> = std::result::Result<T, Error>;
    pub use async_std::io::{Read, Write};
    pub use std::fmt;
    pub use std::future::Future;
    pub use std::pin::Pin;
    pub use std::sync::Arc;
    pub use std::task::{Context, Poll};
    pub type S3Fut<T> = Pin<Box<dyn Future<Output = T> + Sync + Send + 'static>>;
    pub type S1Fut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use rand::RngCore;

    /// Produces a unique session identifier: 18 random bytes in unpadded
    /// base64url.
    pub fn session_id() -> String {
        let mut bytes = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

}
