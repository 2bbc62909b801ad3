//! The per-connection protocol state machine. It consumes one framed line
//! at a time, keeps the command sequencing honest, delegates every policy
//! question to the envelope and produces at most one reply plus an
//! instruction for the dialog driver.

use crate::common::*;
use crate::mail::{CommitAction, DataAction, Envelope, FromAction, NewEnvelope, SizeAction, ToAction};
use crate::smtp::command::{parse_command, Command};
use crate::smtp::reply::{self, Reply};
use std::mem;

const EXTENSIONS_TLS: &[u8] = b"250-8BITMIME\r\n250-SIZE\r\n250 STARTTLS\r\n";
const EXTENSIONS_NO_TLS: &[u8] = b"250-8BITMIME\r\n250 SIZE\r\n";

const END_OF_DATA: &[u8] = b".\r\n";
const ESCAPE_DOT: &[u8] = b"..";

/// What the dialog driver should do with the connection once the reply is
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionAction {
    /// Carry on reading lines.
    Keep,
    /// Shut the connection down.
    Close,
    /// Run the TLS handshake, then carry on over the secured transport.
    Upgrade,
}

/// One mail transaction. The envelope travels with the state, so an open
/// transaction always has one and a blank never does.
enum Transaction {
    Blank,
    /// MAIL FROM accepted, no recipient yet.
    Created(Box<dyn Envelope>),
    /// At least one recipient accepted.
    Recipients(Box<dyn Envelope>),
    /// Message data is streaming.
    Data(Box<dyn Envelope>),
}

impl Transaction {
    fn accepts_rcpt(&self) -> bool {
        matches!(self, Transaction::Created(_) | Transaction::Recipients(_))
    }

    fn accepts_data(&self) -> bool {
        matches!(self, Transaction::Recipients(_))
    }

    fn in_data(&self) -> bool {
        matches!(self, Transaction::Data(_))
    }
}

/// The server-side facts a session is created with.
pub(crate) struct SessionSetup {
    /// Domain the server advertises in its replies.
    pub domain: String,
    /// Whether a TLS upgrade is available at all.
    pub tls: bool,
    /// Whether commands other than HELO/EHLO/STARTTLS are refused until
    /// the session is encrypted.
    pub tls_required: bool,
    pub new_envelope: Arc<dyn NewEnvelope>,
}

/// An SMTP session with one client, from greeting to close.
pub struct Session {
    id: String,
    peer_addr: String,
    setup: SessionSetup,
    domain: Option<Vec<u8>>,
    tls: bool,
    transaction: Transaction,
}

impl Session {
    pub(crate) fn new(id: String, peer_addr: String, setup: SessionSetup) -> Self {
        Session {
            id,
            peer_addr,
            setup,
            domain: None,
            tls: false,
            transaction: Transaction::Blank,
        }
    }

    /// Unique ID of this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the SMTP client.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Domain reported by the SMTP client in the EHLO/HELO command. `None`
    /// if no such command has been received, or since a TLS upgrade wiped
    /// the plaintext identity.
    pub fn domain(&self) -> Option<&[u8]> {
        self.domain.as_deref()
    }

    /// Whether the session is over a TLS connection.
    pub fn via_tls(&self) -> bool {
        self.tls
    }

    pub(crate) fn greet(&self) -> Reply {
        reply::service_ready(&self.setup.domain)
    }

    /// Terminal goodbye for abnormal endings: drops any open transaction
    /// and names the server one last time.
    pub(crate) async fn kill(&mut self) -> Reply {
        self.discard().await;
        reply::service_not_available(&self.setup.domain)
    }

    pub(crate) async fn advance(&mut self, line: &[u8]) -> (Option<Reply>, SessionAction) {
        if self.transaction.in_data() {
            self.process_content(line).await
        } else {
            self.process_command(line).await
        }
    }

    async fn discard(&mut self) {
        match mem::replace(&mut self.transaction, Transaction::Blank) {
            Transaction::Blank => {}
            Transaction::Created(env) | Transaction::Recipients(env) | Transaction::Data(env) => {
                discard_envelope(env).await
            }
        }
    }

    async fn process_content(&mut self, line: &[u8]) -> (Option<Reply>, SessionAction) {
        if line != END_OF_DATA {
            let write = if line.starts_with(ESCAPE_DOT) {
                &line[1..]
            } else {
                line
            };

            let Transaction::Data(env) = &mut self.transaction else {
                return (None, SessionAction::Keep);
            };

            if let Err(e) = env.write(write).await {
                warn!("adding new line to envelope failed: {}", e);
                self.discard().await;
                return (
                    Some(reply::service_not_available(&self.setup.domain)),
                    SessionAction::Close,
                );
            }

            return (None, SessionAction::Keep);
        }

        // end of data: the transaction ends here whatever the commit says
        let Transaction::Data(mut env) = mem::replace(&mut self.transaction, Transaction::Blank)
        else {
            return (Some(reply::BAD_SEQUENCE.into()), SessionAction::Keep);
        };

        match env.commit().await {
            Err(e) => {
                warn!("commit failed: {}", e);
                (Some(reply::DATA_TRANSACTION_FAILED.into()), SessionAction::Keep)
            }
            Ok(CommitAction::Accept) => (Some(reply::OK.into()), SessionAction::Keep),
            Ok(CommitAction::RejectPermanently) => (
                Some(reply::COMMIT_REJECTED_PERMANENT.into()),
                SessionAction::Keep,
            ),
            Ok(CommitAction::RejectTooManyRecipients) => (
                Some(reply::COMMIT_REJECTED_RECIPIENTS.into()),
                SessionAction::Keep,
            ),
            Ok(CommitAction::RejectSizeExceededTemporarily) => (
                Some(reply::COMMIT_REJECTED_SIZE_TEMPORARY.into()),
                SessionAction::Keep,
            ),
            Ok(CommitAction::RejectSizeExceededPermanently) => (
                Some(reply::COMMIT_REJECTED_SIZE_PERMANENT.into()),
                SessionAction::Keep,
            ),
            Ok(CommitAction::RejectTemporarily) => (
                Some(reply::COMMIT_REJECTED_TEMPORARY.into()),
                SessionAction::Keep,
            ),
        }
    }

    async fn process_command(&mut self, line: &[u8]) -> (Option<Reply>, SessionAction) {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(_) => return (Some(reply::BAD_COMMAND.into()), SessionAction::Keep),
        };

        if self.setup.tls_required && self.setup.tls && !self.tls {
            return match command {
                Command::Helo(addr) => self.process_ehlo(addr, false).await,
                Command::Ehlo(addr) => self.process_ehlo(addr, true).await,
                Command::StartTls => self.process_starttls().await,
                _ => (Some(reply::STARTTLS_REQUIRED.into()), SessionAction::Keep),
            };
        }

        match command {
            Command::Helo(addr) => self.process_ehlo(addr, false).await,
            Command::Ehlo(addr) => self.process_ehlo(addr, true).await,
            Command::Mail { addr, size_hint } => self.process_mail(addr, size_hint).await,
            Command::Rset => self.process_rset().await,
            Command::Quit => self.process_quit().await,
            Command::Noop => (Some(reply::OK.into()), SessionAction::Keep),
            Command::StartTls => self.process_starttls().await,
            Command::Help | Command::Expn | Command::Vrfy => {
                (Some(reply::NOT_IMPLEMENTED.into()), SessionAction::Keep)
            }
            Command::Rcpt(addr) if self.transaction.accepts_rcpt() => self.process_rcpt(addr).await,
            Command::Data if self.transaction.accepts_data() => self.process_data().await,
            Command::Rcpt(_) | Command::Data => {
                (Some(reply::BAD_SEQUENCE.into()), SessionAction::Keep)
            }
        }
    }

    async fn process_ehlo(
        &mut self,
        addr: Option<Vec<u8>>,
        extended: bool,
    ) -> (Option<Reply>, SessionAction) {
        let Some(addr) = addr else {
            return (Some(reply::BAD_COMMAND.into()), SessionAction::Keep);
        };

        self.discard().await;
        self.domain = Some(addr);

        if !extended {
            return (
                Some(reply::ehlo_ok(&self.setup.domain, b"")),
                SessionAction::Keep,
            );
        }

        let extensions = if self.tls || !self.setup.tls {
            EXTENSIONS_NO_TLS
        } else {
            EXTENSIONS_TLS
        };

        (
            Some(reply::ehlo_ok(&self.setup.domain, extensions)),
            SessionAction::Keep,
        )
    }

    async fn process_mail(
        &mut self,
        addr: Option<Vec<u8>>,
        size_hint: u64,
    ) -> (Option<Reply>, SessionAction) {
        let Some(addr) = addr else {
            return (Some(reply::BAD_COMMAND.into()), SessionAction::Keep);
        };

        self.discard().await;

        let new_envelope = self.setup.new_envelope.clone();
        let mut env = match new_envelope.new_envelope(self).await {
            Ok(env) => env,
            Err(e) => {
                warn!("creating envelope failed: {}", e);
                return (
                    Some(reply::service_not_available(&self.setup.domain)),
                    SessionAction::Close,
                );
            }
        };

        match env.from(&addr).await {
            Err(e) => {
                warn!("adding reverse-path failed: {}", e);
                discard_envelope(env).await;
                return (
                    Some(reply::service_not_available(&self.setup.domain)),
                    SessionAction::Close,
                );
            }
            Ok(FromAction::Accept) => {}
            Ok(FromAction::RejectPermanently) => {
                discard_envelope(env).await;
                return (
                    Some(reply::MAIL_FROM_REJECTED_PERMANENT.into()),
                    SessionAction::Keep,
                );
            }
            Ok(FromAction::RejectTemporarily) => {
                discard_envelope(env).await;
                return (
                    Some(reply::MAIL_FROM_REJECTED_TEMPORARY.into()),
                    SessionAction::Keep,
                );
            }
        }

        match env.size(size_hint).await {
            Err(e) => {
                warn!("adding size hint failed: {}", e);
                discard_envelope(env).await;
                return (
                    Some(reply::service_not_available(&self.setup.domain)),
                    SessionAction::Close,
                );
            }
            Ok(SizeAction::Accept) => {}
            Ok(SizeAction::RejectPermanently) => {
                discard_envelope(env).await;
                return (
                    Some(reply::MAIL_SIZE_REJECTED_PERMANENT.into()),
                    SessionAction::Keep,
                );
            }
            Ok(SizeAction::RejectTemporarily) => {
                discard_envelope(env).await;
                return (
                    Some(reply::MAIL_SIZE_REJECTED_TEMPORARY.into()),
                    SessionAction::Keep,
                );
            }
        }

        self.transaction = Transaction::Created(env);

        (Some(reply::OK.into()), SessionAction::Keep)
    }

    async fn process_rcpt(&mut self, addr: Option<Vec<u8>>) -> (Option<Reply>, SessionAction) {
        let Some(addr) = addr else {
            return (Some(reply::BAD_COMMAND.into()), SessionAction::Keep);
        };

        let (mut env, had_recipients) =
            match mem::replace(&mut self.transaction, Transaction::Blank) {
                Transaction::Created(env) => (env, false),
                Transaction::Recipients(env) => (env, true),
                other => {
                    self.transaction = other;
                    return (Some(reply::BAD_SEQUENCE.into()), SessionAction::Keep);
                }
            };

        // a reject leaves the transaction exactly where it was
        let put_back: fn(Box<dyn Envelope>) -> Transaction = if had_recipients {
            Transaction::Recipients
        } else {
            Transaction::Created
        };

        match env.to(&addr).await {
            Err(e) => {
                warn!("adding recipient failed: {}", e);
                discard_envelope(env).await;
                (
                    Some(reply::service_not_available(&self.setup.domain)),
                    SessionAction::Close,
                )
            }
            Ok(ToAction::Accept) => {
                self.transaction = Transaction::Recipients(env);
                (Some(reply::OK.into()), SessionAction::Keep)
            }
            Ok(ToAction::RejectPermanently) => {
                self.transaction = put_back(env);
                (Some(reply::RCPT_REJECTED_PERMANENT.into()), SessionAction::Keep)
            }
            Ok(ToAction::RejectTemporarily) => {
                self.transaction = put_back(env);
                (Some(reply::RCPT_REJECTED_TEMPORARY.into()), SessionAction::Keep)
            }
        }
    }

    async fn process_data(&mut self) -> (Option<Reply>, SessionAction) {
        let mut env = match mem::replace(&mut self.transaction, Transaction::Blank) {
            Transaction::Recipients(env) => env,
            other => {
                self.transaction = other;
                return (Some(reply::BAD_SEQUENCE.into()), SessionAction::Keep);
            }
        };

        match env.open().await {
            Err(e) => {
                warn!("opening envelope for data failed: {}", e);
                discard_envelope(env).await;
                (Some(reply::DATA_TRANSACTION_FAILED.into()), SessionAction::Keep)
            }
            Ok(DataAction::Accept) => {
                self.transaction = Transaction::Data(env);
                (Some(reply::DATA_CONTINUE.into()), SessionAction::Keep)
            }
            Ok(DataAction::Reject) => {
                discard_envelope(env).await;
                (Some(reply::DATA_TRANSACTION_FAILED.into()), SessionAction::Keep)
            }
        }
    }

    async fn process_rset(&mut self) -> (Option<Reply>, SessionAction) {
        self.discard().await;
        (Some(reply::OK.into()), SessionAction::Keep)
    }

    async fn process_quit(&mut self) -> (Option<Reply>, SessionAction) {
        self.discard().await;
        (
            Some(reply::service_closing(&self.setup.domain)),
            SessionAction::Close,
        )
    }

    async fn process_starttls(&mut self) -> (Option<Reply>, SessionAction) {
        if self.tls || !self.setup.tls {
            return (Some(reply::NOT_IMPLEMENTED.into()), SessionAction::Keep);
        }

        // the plaintext identity does not survive the upgrade
        self.domain = None;
        self.tls = true;
        self.discard().await;

        (Some(reply::STARTTLS_READY.into()), SessionAction::Upgrade)
    }
}

async fn discard_envelope(mut env: Box<dyn Envelope>) {
    if let Err(e) = env.discard().await {
        warn!("discarding envelope failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task::block_on;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Record {
        from: Vec<Vec<u8>>,
        sizes: Vec<u64>,
        rcpts: Vec<Vec<u8>>,
        opens: usize,
        data: Vec<u8>,
        commits: usize,
        discards: usize,
        factory_domains: Vec<Option<Vec<u8>>>,
    }

    #[derive(Clone, Default)]
    struct TestEnvelope {
        record: Arc<Mutex<Record>>,
        on_from: Option<FromAction>,
        on_size: Option<SizeAction>,
        on_to: Option<ToAction>,
        on_open: Option<DataAction>,
        on_commit: Option<CommitAction>,
        fail_from: bool,
        fail_to: bool,
        fail_write: bool,
        fail_commit: bool,
    }

    impl Envelope for TestEnvelope {
        fn from<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<FromAction>>
        where
            'a: 'f,
            's: 'f,
        {
            self.record.lock().unwrap().from.push(addr.to_vec());
            let result = if self.fail_from {
                Err("reverse-path lookup down".into())
            } else {
                Ok(self.on_from.unwrap_or(FromAction::Accept))
            };
            Box::pin(async move { result })
        }

        fn size(&mut self, hint: u64) -> S1Fut<'_, Result<SizeAction>> {
            self.record.lock().unwrap().sizes.push(hint);
            let result = Ok(self.on_size.unwrap_or(SizeAction::Accept));
            Box::pin(async move { result })
        }

        fn to<'a, 's, 'f>(&'s mut self, addr: &'a [u8]) -> S1Fut<'f, Result<ToAction>>
        where
            'a: 'f,
            's: 'f,
        {
            self.record.lock().unwrap().rcpts.push(addr.to_vec());
            let result = if self.fail_to {
                Err("recipient lookup down".into())
            } else {
                Ok(self.on_to.unwrap_or(ToAction::Accept))
            };
            Box::pin(async move { result })
        }

        fn open(&mut self) -> S1Fut<'_, Result<DataAction>> {
            self.record.lock().unwrap().opens += 1;
            let result = Ok(self.on_open.unwrap_or(DataAction::Accept));
            Box::pin(async move { result })
        }

        fn write<'a, 's, 'f>(&'s mut self, line: &'a [u8]) -> S1Fut<'f, Result<()>>
        where
            'a: 'f,
            's: 'f,
        {
            let result = if self.fail_write {
                Err("storage down".into())
            } else {
                self.record.lock().unwrap().data.extend_from_slice(line);
                Ok(())
            };
            Box::pin(async move { result })
        }

        fn commit(&mut self) -> S1Fut<'_, Result<CommitAction>> {
            self.record.lock().unwrap().commits += 1;
            let result = if self.fail_commit {
                Err("delivery down".into())
            } else {
                Ok(self.on_commit.unwrap_or(CommitAction::Accept))
            };
            Box::pin(async move { result })
        }

        fn discard(&mut self) -> S1Fut<'_, Result<()>> {
            self.record.lock().unwrap().discards += 1;
            Box::pin(async move { Ok(()) })
        }
    }

    #[derive(Clone, Default)]
    struct TestMail {
        env: TestEnvelope,
        fail: bool,
    }

    impl NewEnvelope for TestMail {
        fn new_envelope<'a, 's, 'f>(
            &'s self,
            session: &'a Session,
        ) -> S1Fut<'f, Result<Box<dyn Envelope>>>
        where
            'a: 'f,
            's: 'f,
        {
            self.env
                .record
                .lock()
                .unwrap()
                .factory_domains
                .push(session.domain().map(|d| d.to_vec()));
            let result: Result<Box<dyn Envelope>> = if self.fail {
                Err("factory down".into())
            } else {
                Ok(Box::new(self.env.clone()))
            };
            Box::pin(async move { result })
        }
    }

    fn session_with(mail: &TestMail, tls: bool, tls_required: bool) -> Session {
        Session::new(
            "AAAAAAAAAAAAAAAAAAAAAAAA".to_owned(),
            "127.0.0.2:2938".to_owned(),
            SessionSetup {
                domain: "example.com".to_owned(),
                tls,
                tls_required,
                new_envelope: Arc::new(mail.clone()),
            },
        )
    }

    fn session(mail: &TestMail) -> Session {
        session_with(mail, false, false)
    }

    async fn advance(sut: &mut Session, line: &str) -> (String, SessionAction) {
        let (reply, action) = sut.advance(line.as_bytes()).await;
        let reply = reply
            .map(|r| String::from_utf8_lossy(&r).into_owned())
            .unwrap_or_default();
        (reply, action)
    }

    async fn open_transaction(sut: &mut Session) {
        assert_eq!(
            advance(sut, "EHLO domain.com\r\n").await.0,
            "250-example.com greetings\r\n250-8BITMIME\r\n250 SIZE\r\n"
        );
        assert!(advance(sut, "MAIL FROM:<a@domain.com>\r\n").await.0.starts_with("250 "));
        assert!(advance(sut, "RCPT TO:<b@example.com>\r\n").await.0.starts_with("250 "));
    }

    #[test]
    pub fn greets_with_the_configured_domain() {
        let sut = session(&TestMail::default());
        assert_eq!(sut.greet().as_ref(), b"220 example.com Service ready\r\n".as_slice());
    }

    #[test]
    pub fn helo_sets_the_client_domain() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, action) = advance(&mut sut, "HELO domain.com\r\n").await;
            assert_eq!(reply, "250 example.com greetings\r\n");
            assert_eq!(action, SessionAction::Keep);
            assert_eq!(sut.domain(), Some(b"domain.com".as_slice()));
        })
    }

    #[test]
    pub fn ehlo_without_identity_is_an_error() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, _) = advance(&mut sut, "EHLO\r\n").await;
            assert_eq!(reply, "500 Syntax error, command unrecognized\r\n");
            assert_eq!(sut.domain(), None);
        })
    }

    #[test]
    pub fn ehlo_advertises_starttls_only_while_available() {
        block_on(async move {
            let mail = TestMail::default();

            let mut sut = session(&mail);
            let (reply, _) = advance(&mut sut, "EHLO domain.com\r\n").await;
            assert_eq!(
                reply,
                "250-example.com greetings\r\n250-8BITMIME\r\n250 SIZE\r\n"
            );

            let mut sut = session_with(&mail, true, false);
            let (reply, _) = advance(&mut sut, "EHLO domain.com\r\n").await;
            assert_eq!(
                reply,
                "250-example.com greetings\r\n250-8BITMIME\r\n250-SIZE\r\n250 STARTTLS\r\n"
            );

            // once encrypted there is nothing left to advertise
            advance(&mut sut, "STARTTLS\r\n").await;
            let (reply, _) = advance(&mut sut, "EHLO domain.com\r\n").await;
            assert_eq!(
                reply,
                "250-example.com greetings\r\n250-8BITMIME\r\n250 SIZE\r\n"
            );
        })
    }

    #[test]
    pub fn mail_does_not_need_a_prior_helo() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
            assert_eq!(
                mail.env.record.lock().unwrap().factory_domains,
                vec![None]
            );
        })
    }

    #[test]
    pub fn mail_without_reverse_path_is_an_error() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, _) = advance(&mut sut, "MAIL\r\n").await;
            assert_eq!(reply, "500 Syntax error, command unrecognized\r\n");
            assert!(mail.env.record.lock().unwrap().factory_domains.is_empty());
        })
    }

    #[test]
    pub fn mail_passes_path_and_size_to_the_envelope() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            advance(&mut sut, "MAIL FROM:<a@domain.com> SIZE=512\r\n").await;

            let record = mail.env.record.lock().unwrap();
            assert_eq!(record.from, vec![b"a@domain.com".to_vec()]);
            assert_eq!(record.sizes, vec![512]);
        })
    }

    #[test]
    pub fn mail_from_rejects_map_to_their_replies() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.on_from = Some(FromAction::RejectPermanently);
            let mut sut = session(&mail);

            let (reply, action) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(reply, "550 Requested action not taken: sender is blocked\r\n");
            assert_eq!(action, SessionAction::Keep);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);

            // the transaction never opened
            let (reply, _) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(reply, "503 Bad sequence of commands\r\n");

            mail.env.on_from = Some(FromAction::RejectTemporarily);
            let mut sut = session(&mail);
            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(
                reply,
                "450 Requested mail action not taken: temporarily blocked\r\n"
            );
        })
    }

    #[test]
    pub fn mail_size_rejects_map_to_their_replies() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.on_size = Some(SizeAction::RejectPermanently);
            let mut sut = session(&mail);

            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com> SIZE=9000\r\n").await;
            assert_eq!(reply, "552 message size exceeds fixed maximium message size\r\n");
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);

            mail.env.on_size = Some(SizeAction::RejectTemporarily);
            let mut sut = session(&mail);
            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com> SIZE=9000\r\n").await;
            assert_eq!(reply, "452 insufficient system storage\r\n");
        })
    }

    #[test]
    pub fn envelope_fatal_on_mail_closes_the_session() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.fail_from = true;
            let mut sut = session(&mail);

            let (reply, action) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(
                reply,
                "421 example.com Service not available, closing transmission channel\r\n"
            );
            assert_eq!(action, SessionAction::Close);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }

    #[test]
    pub fn factory_fatal_closes_the_session() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.fail = true;
            let mut sut = session(&mail);

            let (reply, action) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(
                reply,
                "421 example.com Service not available, closing transmission channel\r\n"
            );
            assert_eq!(action, SessionAction::Close);
        })
    }

    #[test]
    pub fn rcpt_and_data_are_state_gated() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, _) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(reply, "503 Bad sequence of commands\r\n");

            let (reply, _) = advance(&mut sut, "DATA\r\n").await;
            assert_eq!(reply, "503 Bad sequence of commands\r\n");

            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;

            // no recipient accepted yet
            let (reply, _) = advance(&mut sut, "DATA\r\n").await;
            assert_eq!(reply, "503 Bad sequence of commands\r\n");

            // the 503 left the transaction open
            let (reply, _) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
            let (reply, _) = advance(&mut sut, "RSET\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }

    #[test]
    pub fn rejected_rcpt_does_not_unlock_data() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.on_to = Some(ToAction::RejectTemporarily);
            let mut sut = session(&mail);

            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            let (reply, _) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(
                reply,
                "450 Requested mail action not taken: mailbox unavailable\r\n"
            );

            let (reply, _) = advance(&mut sut, "DATA\r\n").await;
            assert_eq!(reply, "503 Bad sequence of commands\r\n");
        })
    }

    #[test]
    pub fn rcpt_rejects_map_to_their_replies() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.on_to = Some(ToAction::RejectPermanently);
            let mut sut = session(&mail);

            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            let (reply, _) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(reply, "550 Requested action not taken: mailbox unavailable\r\n");

            // the envelope stays around for another attempt
            assert_eq!(mail.env.record.lock().unwrap().discards, 0);
        })
    }

    #[test]
    pub fn envelope_fatal_on_rcpt_closes_the_session() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.fail_to = true;
            let mut sut = session(&mail);

            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            let (reply, action) = advance(&mut sut, "RCPT TO:<b@example.com>\r\n").await;
            assert_eq!(
                reply,
                "421 example.com Service not available, closing transmission channel\r\n"
            );
            assert_eq!(action, SessionAction::Close);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }

    #[test]
    pub fn data_streams_lines_until_the_terminator() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);
            open_transaction(&mut sut).await;

            let (reply, _) = advance(&mut sut, "DATA\r\n").await;
            assert_eq!(reply, "354 Start mail input; end with <CRLF>.<CRLF>\r\n");

            // body lines produce no reply at all
            let (reply, action) = advance(&mut sut, "hello\r\n").await;
            assert_eq!(reply, "");
            assert_eq!(action, SessionAction::Keep);
            let (reply, _) = advance(&mut sut, "..\r\n").await;
            assert_eq!(reply, "");
            let (reply, _) = advance(&mut sut, "..stuffed\r\n").await;
            assert_eq!(reply, "");

            let (reply, _) = advance(&mut sut, ".\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");

            let record = mail.env.record.lock().unwrap();
            assert_eq!(record.data, b"hello\r\n.\r\n.stuffed\r\n".to_vec());
            assert_eq!(record.opens, 1);
            assert_eq!(record.commits, 1);
            assert_eq!(record.discards, 0);
        })
    }

    #[test]
    pub fn commit_rejects_map_to_their_replies() {
        let cases = vec![
            (
                CommitAction::RejectTemporarily,
                "450 Requested mail action not taken: mailbox unavailable\r\n",
            ),
            (
                CommitAction::RejectPermanently,
                "550 Requested action not taken: mailbox unavailable\r\n",
            ),
            (
                CommitAction::RejectTooManyRecipients,
                "452 Requested action not taken: too many recipients\r\n",
            ),
            (
                CommitAction::RejectSizeExceededTemporarily,
                "452 Requested action not taken: insufficient system storage\r\n",
            ),
            (
                CommitAction::RejectSizeExceededPermanently,
                "552 Requested mail action aborted: exceeded storage allocation\r\n",
            ),
        ];

        for (action, expected) in cases {
            block_on(async move {
                let mut mail = TestMail::default();
                mail.env.on_commit = Some(action);
                let mut sut = session(&mail);
                open_transaction(&mut sut).await;
                advance(&mut sut, "DATA\r\n").await;

                let (reply, _) = advance(&mut sut, ".\r\n").await;
                assert_eq!(reply, expected, "for commit action {:?}", action);

                // whatever the verdict, the transaction is over
                let (reply, _) = advance(&mut sut, "DATA\r\n").await;
                assert_eq!(reply, "503 Bad sequence of commands\r\n");
            })
        }
    }

    #[test]
    pub fn commit_fatal_fails_the_transaction_but_not_the_session() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.fail_commit = true;
            let mut sut = session(&mail);
            open_transaction(&mut sut).await;
            advance(&mut sut, "DATA\r\n").await;

            let (reply, action) = advance(&mut sut, ".\r\n").await;
            assert_eq!(reply, "554 Transaction failed\r\n");
            assert_eq!(action, SessionAction::Keep);

            // the envelope is gone, a new transaction can start
            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
        })
    }

    #[test]
    pub fn write_fatal_closes_the_session() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.fail_write = true;
            let mut sut = session(&mail);
            open_transaction(&mut sut).await;
            advance(&mut sut, "DATA\r\n").await;

            let (reply, action) = advance(&mut sut, "hello\r\n").await;
            assert_eq!(
                reply,
                "421 example.com Service not available, closing transmission channel\r\n"
            );
            assert_eq!(action, SessionAction::Close);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }

    #[test]
    pub fn open_reject_fails_the_transaction() {
        block_on(async move {
            let mut mail = TestMail::default();
            mail.env.on_open = Some(DataAction::Reject);
            let mut sut = session(&mail);
            open_transaction(&mut sut).await;

            let (reply, action) = advance(&mut sut, "DATA\r\n").await;
            assert_eq!(reply, "554 Transaction failed\r\n");
            assert_eq!(action, SessionAction::Keep);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);

            // a fresh transaction is welcome
            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
        })
    }

    #[test]
    pub fn quit_discards_and_closes() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);
            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;

            let (reply, action) = advance(&mut sut, "QUIT\r\n").await;
            assert_eq!(
                reply,
                "221 example.com Service closing transmission channel\r\n"
            );
            assert_eq!(action, SessionAction::Close);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }

    #[test]
    pub fn unimplemented_verbs() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            for line in ["HELP\r\n", "EXPN\r\n", "VRFY\r\n"] {
                let (reply, _) = advance(&mut sut, line).await;
                assert_eq!(reply, "502 Command not implemented\r\n", "for {:?}", line);
            }

            let (reply, _) = advance(&mut sut, "NOOP\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
        })
    }

    #[test]
    pub fn starttls_needs_a_configured_upgrade() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            let (reply, action) = advance(&mut sut, "STARTTLS\r\n").await;
            assert_eq!(reply, "502 Command not implemented\r\n");
            assert_eq!(action, SessionAction::Keep);
        })
    }

    #[test]
    pub fn starttls_upgrades_once() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session_with(&mail, true, false);
            advance(&mut sut, "EHLO domain.com\r\n").await;
            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;

            let (reply, action) = advance(&mut sut, "STARTTLS\r\n").await;
            assert_eq!(reply, "220 Ready to start TLS\r\n");
            assert_eq!(action, SessionAction::Upgrade);
            assert!(sut.via_tls());
            assert_eq!(sut.domain(), None);
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);

            // already encrypted, a second upgrade makes no sense
            let (reply, action) = advance(&mut sut, "STARTTLS\r\n").await;
            assert_eq!(reply, "502 Command not implemented\r\n");
            assert_eq!(action, SessionAction::Keep);

            // the flag survives a new greeting
            advance(&mut sut, "HELO domain.com\r\n").await;
            assert!(sut.via_tls());
        })
    }

    #[test]
    pub fn tls_required_gates_everything_but_the_handshake() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session_with(&mail, true, true);

            let (reply, _) = advance(&mut sut, "EHLO domain.com\r\n").await;
            assert_eq!(
                reply,
                "250-example.com greetings\r\n250-8BITMIME\r\n250-SIZE\r\n250 STARTTLS\r\n"
            );

            for line in ["MAIL FROM:<a@domain.com>\r\n", "NOOP\r\n", "RSET\r\n"] {
                let (reply, _) = advance(&mut sut, line).await;
                assert_eq!(
                    reply,
                    "530 Must issue a STARTTLS command first\r\n",
                    "for {:?}",
                    line
                );
            }

            let (reply, action) = advance(&mut sut, "STARTTLS\r\n").await;
            assert_eq!(reply, "220 Ready to start TLS\r\n");
            assert_eq!(action, SessionAction::Upgrade);

            // the gate lifts with the upgrade, no fresh EHLO needed
            let (reply, _) = advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;
            assert_eq!(reply, "250 Requested mail action okay, completed\r\n");
        })
    }

    #[test]
    pub fn parse_failures_keep_the_session() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);

            for line in ["1234\r\n", "UNKNOWN\r\n", "EHLO\r\n", "HELO\r\n"] {
                let (reply, action) = advance(&mut sut, line).await;
                assert_eq!(reply, "500 Syntax error, command unrecognized\r\n");
                assert_eq!(action, SessionAction::Keep);
            }
        })
    }

    #[test]
    pub fn kill_discards_the_open_transaction() {
        block_on(async move {
            let mail = TestMail::default();
            let mut sut = session(&mail);
            advance(&mut sut, "MAIL FROM:<a@domain.com>\r\n").await;

            let reply = sut.kill().await;
            assert_eq!(
                reply.as_ref(),
                b"421 example.com Service not available, closing transmission channel\r\n"
                    .as_slice()
            );
            assert_eq!(mail.env.record.lock().unwrap().discards, 1);
        })
    }
}
