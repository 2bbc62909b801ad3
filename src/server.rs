//! The embedder-facing surface: configuration, and driving accepted
//! connections. Accepting sockets is the embedder's business - hand each
//! accepted stream to [`Server::handle`] or [`Server::accept`] and the
//! dialog runs from greeting to close.

use crate::common::*;
use crate::io::tls::TlsUpgrade;
use crate::io::{BufferPool, Io, SmtpDriver};
use crate::mail::NewEnvelope;
use crate::smtp::{Session, SessionSetup};
use async_std::task;
use std::sync::atomic::{AtomicBool, Ordering};

/// Four pages worth of dialog per connection unless configured otherwise.
const DEFAULT_BUFFER_SIZE: usize = 4 * 4096;

/// The standard SMTP line length: 512 octets plus 26 for the SIZE
/// extension.
const RECOMMENDED_MIN_BUFFER_SIZE: usize = 538;

/// TLS posture of the server. The upgrade does the handshake; the server
/// name doubles as the default advertised domain.
pub struct TlsConfig {
    pub upgrade: Arc<dyn TlsUpgrade>,
    pub server_name: String,
}

/// SMTP server configuration. The envelope factory is the one thing a
/// server cannot run without, so construction starts there; everything
/// else has a workable default.
pub struct Config {
    domain: String,
    buffer_size: usize,
    tls: Option<TlsConfig>,
    tls_required: bool,
    new_envelope: Arc<dyn NewEnvelope>,
}

impl Config {
    pub fn new(new_envelope: Arc<dyn NewEnvelope>) -> Self {
        Config {
            domain: String::new(),
            buffer_size: 0,
            tls: None,
            tls_required: false,
            new_envelope,
        }
    }

    /// Domain this service advertises in its replies. This should be the
    /// domain of the recipients' MX records, and the CN of the TLS
    /// certificate. Without it the TLS server name is used, and failing
    /// that, `example.com`.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Size of the per-connection buffer. Avoid values below 538 bytes,
    /// the standard SMTP line length. 0 means the default of four pages.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Refuse to do business before STARTTLS. Only meaningful together
    /// with [`with_tls`](Config::with_tls).
    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }
}

/// Cooperative shutdown signal for a running dialog. Clone it, hand one
/// end to [`Server::handle`] and flip it to make the dialog say goodbye
/// with a 421 and hang up. The flag is checked between reads - to unblock
/// a read in progress, close the transport from the outside as well.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An SMTP server; use [`Server::new`] to create one. Cloning is cheap
/// and clones share the buffer pool.
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    pool: Arc<BufferPool>,
}

impl Server {
    pub fn new(mut config: Config) -> Self {
        if config.domain.is_empty() {
            if let Some(tls) = &config.tls {
                config.domain = tls.server_name.clone();
            }
        }
        if config.domain.is_empty() {
            warn!("server configured without a domain or tls server name, using example.com");
            config.domain = "example.com".to_owned();
        }

        if config.buffer_size == 0 {
            config.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if config.buffer_size < RECOMMENDED_MIN_BUFFER_SIZE {
            warn!(
                "server configured with a buffer size of {}, below the standard line length of {}",
                config.buffer_size, RECOMMENDED_MIN_BUFFER_SIZE
            );
        }

        let pool = Arc::new(BufferPool::new(config.buffer_size));

        Server {
            config: Arc::new(config),
            pool,
        }
    }

    /// Serves SMTP on one already-accepted connection, from greeting to
    /// close. Resolves once the dialog is over and the transport has been
    /// shut down. Cancelling through the optional [`Cancellation`] ends
    /// the dialog in an orderly fashion.
    pub async fn handle<IO>(&self, io: IO, peer_addr: String, cancellation: Option<Cancellation>)
    where
        IO: Io + 'static,
    {
        let id = session_id();
        info!("session {} for peer {}", id, peer_addr);

        let session = Session::new(
            id,
            peer_addr,
            SessionSetup {
                domain: self.config.domain.clone(),
                tls: self.config.tls.is_some(),
                tls_required: self.config.tls_required,
                new_envelope: self.config.new_envelope.clone(),
            },
        );

        let tls = self
            .config
            .tls
            .as_ref()
            .map(|tls| (tls.upgrade.clone(), tls.server_name.clone()));

        SmtpDriver::new(Box::new(io), session, tls, cancellation)
            .run(&self.pool)
            .await;
    }

    /// Like [`handle`](Server::handle), but spawned into a task of its
    /// own. Await the returned handle to know the dialog is done.
    pub fn accept<IO>(
        &self,
        io: IO,
        peer_addr: String,
        cancellation: Option<Cancellation>,
    ) -> task::JoinHandle<()>
    where
        IO: Io + 'static,
    {
        let server = self.clone();
        task::spawn(async move { server.handle(io, peer_addr, cancellation).await })
    }
}
