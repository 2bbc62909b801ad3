//! The dialog driver: owns the transport and one pooled buffer, frames
//! client lines, pumps them through the session and writes the replies
//! back. All the protocol thinking happens in the session; this loop only
//! moves bytes and obeys the returned action.

use crate::common::*;
use crate::io::lines::Lines;
use crate::io::pool::BufferPool;
use crate::io::tls::{FallBack, TlsUpgrade};
use crate::io::Io;
use crate::server::Cancellation;
use crate::smtp::{Session, SessionAction};
use futures_util::io::{AsyncReadExt, AsyncWriteExt};
use std::mem;

pub(crate) struct SmtpDriver {
    io: Box<dyn Io>,
    session: Session,
    tls: Option<(Arc<dyn TlsUpgrade>, String)>,
    cancellation: Option<Cancellation>,
}

impl SmtpDriver {
    pub fn new(
        io: Box<dyn Io>,
        session: Session,
        tls: Option<(Arc<dyn TlsUpgrade>, String)>,
        cancellation: Option<Cancellation>,
    ) -> Self {
        SmtpDriver {
            io,
            session,
            tls,
            cancellation,
        }
    }

    pub async fn run(self, pool: &BufferPool) {
        let SmtpDriver {
            mut io,
            mut session,
            tls,
            cancellation,
        } = self;

        let mut buffer = pool.take();
        let mut filled = 0;

        debug!("greeting");
        match io.write_all(&session.greet()).await {
            Err(e) => warn!("greeting failed: {}", e),
            Ok(()) => loop {
                if cancellation.as_ref().map_or(false, Cancellation::is_cancelled) {
                    debug!("cancelled");
                    kill(&mut io, &mut session).await;
                    break;
                }

                let read = match io.read(&mut buffer[filled..]).await {
                    Ok(0) => {
                        debug!("end of stream");
                        break;
                    }
                    Ok(read) => read,
                    Err(e) => {
                        debug!("end of stream: {}", e);
                        break;
                    }
                };
                filled += read;

                let mut lines = Lines::new(&buffer[..filled]);
                let mut action = SessionAction::Keep;
                let mut write_failed = false;
                while let Some(line) = lines.next() {
                    let (reply, next) = session.advance(line).await;
                    action = next;

                    if let Some(reply) = reply {
                        if let Err(e) = io.write_all(&reply).await {
                            warn!("writing reply failed: {}", e);
                            write_failed = true;
                            lines.stop();
                            break;
                        }
                    }

                    if action != SessionAction::Keep {
                        // anything still buffered after STARTTLS is
                        // pipelined plaintext and must not be processed
                        lines.stop();
                        break;
                    }
                }

                match lines.remainder().map(<[u8]>::len) {
                    Some(tail) if tail == buffer.len() => {
                        // a full buffer without a single CRLF
                        warn!(
                            "buffer of {} bytes does not contain a line, check the buffer size configuration",
                            buffer.len()
                        );
                        kill(&mut io, &mut session).await;
                        break;
                    }
                    Some(tail) => {
                        buffer.copy_within(filled - tail..filled, 0);
                        filled = tail;
                    }
                    None => {
                        filled = 0;

                        if write_failed {
                            kill(&mut io, &mut session).await;
                            break;
                        }

                        match action {
                            SessionAction::Keep => {}
                            SessionAction::Close => {
                                debug!("close action");
                                break;
                            }
                            SessionAction::Upgrade => {
                                debug!("upgrade action");
                                let Some((upgrade, name)) = tls.as_ref() else {
                                    warn!("upgrade action without a tls upgrade configured");
                                    break;
                                };

                                let plain = mem::replace(&mut io, Box::new(FallBack));
                                match upgrade.upgrade_to_tls(plain, name.clone()).await {
                                    Ok(secured) => io = secured,
                                    Err(e) => {
                                        warn!("tls handshake failed: {}", e);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            },
        }

        pool.put(buffer);

        debug!("closing");
        if let Err(e) = io.close().await {
            debug!("closing the transport failed: {}", e);
        }
    }
}

async fn kill(io: &mut Box<dyn Io>, session: &mut Session) {
    debug!("killing");

    let reply = session.kill().await;
    if let Err(e) = io.write_all(&reply).await {
        debug!("writing the kill reply failed: {}", e);
    }
}
