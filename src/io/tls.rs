//! The seam between the SMTP dialog and whatever does the actual
//! encryption. The core never touches TLS itself; after replying to
//! STARTTLS it hands the transport to the embedder's upgrade and carries
//! on over whatever comes back.

use crate::common::*;
use crate::io::Io;

/// Upgrades a plaintext transport to TLS. Implement this over your TLS
/// stack of choice (an async-tls/rustls acceptor fits directly) and hand
/// it to the server through [`TlsConfig`](crate::server::TlsConfig). The
/// returned future resolves once the server-side handshake is done.
pub trait TlsUpgrade: Send + Sync {
    fn upgrade_to_tls(&self, stream: Box<dyn Io>, name: String) -> S3Fut<std::io::Result<Box<dyn Io>>>;
}

/// Placeholder transport held while the real one is being upgraded. All
/// operations fail as not connected.
pub(crate) struct FallBack;

impl Read for FallBack {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
    }
}

impl Write for FallBack {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
