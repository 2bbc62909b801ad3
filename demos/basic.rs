//! An example server that accepts mail and logs it. Talk to it with
//! Netcat:
//!
//! ```text
//! > nc -C localhost 2525
//! 220 example.com Service ready
//! HELO domain.com
//! 250 example.com greetings
//! MAIL FROM:<hello@domain.com>
//! 250 Requested mail action okay, completed
//! RCPT TO:<hello@example.com>
//! 250 Requested mail action okay, completed
//! DATA
//! 354 Start mail input; end with <CRLF>.<CRLF>
//! Greetings!
//! .
//! 250 Requested mail action okay, completed
//! QUIT
//! 221 example.com Service closing transmission channel
//! ```

use async_std::net::TcpListener;
use async_std::prelude::*;
use log::info;
use mailslot::common::*;
use mailslot::mail::{
    CommitAction, DataAction, Envelope, FromAction, NewEnvelope, SizeAction, ToAction,
};
use mailslot::server::{Config, Server};
use mailslot::smtp::Session;

#[derive(Default)]
struct LogEnvelope {
    from: Vec<u8>,
    recipients: Vec<Vec<u8>>,
    data: Vec<u8>,
}

impl Envelope for LogEnvelope {
    fn from<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<FromAction>>
    where
        'a: 'f,
        's: 'f,
    {
        self.from = addr.to_vec();
        Box::pin(async move { Ok(FromAction::Accept) })
    }

    fn size(&mut self, _hint: u64) -> S1Fut<'_, Result<SizeAction>> {
        Box::pin(async move { Ok(SizeAction::Accept) })
    }

    fn to<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<ToAction>>
    where
        'a: 'f,
        's: 'f,
    {
        self.recipients.push(addr.to_vec());
        Box::pin(async move { Ok(ToAction::Accept) })
    }

    fn open(&mut self) -> S1Fut<'_, Result<DataAction>> {
        Box::pin(async move { Ok(DataAction::Accept) })
    }

    fn write<'a, 's, 'f>(&'s mut self, line: &'a [u8]) -> S1Fut<'f, Result<()>>
    where
        'a: 'f,
        's: 'f,
    {
        self.data.extend_from_slice(line);
        Box::pin(async move { Ok(()) })
    }

    fn commit(&mut self) -> S1Fut<'_, Result<CommitAction>> {
        info!(
            "received mail from {} to {} with {} bytes of data",
            String::from_utf8_lossy(&self.from),
            self.recipients
                .iter()
                .map(|r| String::from_utf8_lossy(r).into_owned())
                .collect::<Vec<_>>()
                .join(", "),
            self.data.len()
        );
        Box::pin(async move { Ok(CommitAction::Accept) })
    }

    fn discard(&mut self) -> S1Fut<'_, Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

struct LogMail;

impl NewEnvelope for LogMail {
    fn new_envelope<'a, 's, 'f>(
        &'s self,
        session: &'a Session,
    ) -> S1Fut<'f, Result<Box<dyn Envelope>>>
    where
        'a: 'f,
        's: 'f,
    {
        info!(
            "new envelope for session {} from {}",
            session.id(),
            session.peer_addr()
        );
        Box::pin(async move { Ok(Box::<LogEnvelope>::default() as Box<dyn Envelope>) })
    }
}

#[async_std::main]
async fn main() -> Result<()> {
    env_logger::init();

    let server = Server::new(Config::new(Arc::new(LogMail)).with_domain("example.com"));

    let listener = TcpListener::bind("localhost:2525").await?;
    info!("listening on {}", listener.local_addr()?);

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = stream?;
        let addr = stream.peer_addr()?.to_string();
        server.accept(stream, addr, None);
    }

    Ok(())
}
