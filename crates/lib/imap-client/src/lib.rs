//! Thin client over a live IMAP session.
//!
//! One [`ImapClient`] wraps exactly one authenticated session. It is owned by
//! a single task; reconnection is the owner's concern.

mod types;

pub use types::{MailboxStatus, Message, SeqSet, StoreOp, Update};

use std::time::Duration;

use futures::{TryStreamExt as _, pin_mut};
use tokio::sync::mpsc;

/// The effective data stream type we use.
pub type Stream = imap_tls::MaybeTlsStream;

/// The effective session type we use.
type Session = async_imap::Session<Stream>;

/// The FETCH data items the pump operates on.
const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE RFC822)";

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hostname or IP address of the IMAP server.
    pub host: String,

    /// IMAP port.
    pub port: u16,

    /// Authentication settings.
    pub auth: imap_auth::Auth,

    /// Mailbox to operate on; empty when the connection has no fixed mailbox.
    pub mailbox: String,

    /// Use implicit TLS.
    pub tls: bool,

    /// Skip TLS peer verification. Debug only.
    pub tls_skip_verify: bool,

    /// Log protocol-level detail for this connection.
    pub debug: bool,
}

impl ConnectionConfig {
    /// The `imap://` / `imaps://` form of this endpoint, for logging.
    pub fn log_url(&self) -> String {
        let scheme = if self.tls { "imaps" } else { "imap" };
        if self.mailbox.is_empty() {
            format!("{scheme}://{}:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}/{}", self.host, self.port, self.mailbox)
        }
    }
}

/// Options for a single IDLE invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleOptions {
    /// Upper bound on a single IDLE command; servers drop sessions held
    /// longer.
    pub logout_timeout: Duration,

    /// Poll ceiling, also used as the NOOP interval for servers without the
    /// IDLE capability.
    pub poll_interval: Duration,
}

/// Errors returned by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IMAP connection error.
    #[error("connect: {0}")]
    Connect(#[from] imap_tls::ConnectError),

    /// IMAP auth error.
    #[error("auth: {0}")]
    Auth(#[from] imap_auth::Error),

    /// IMAP protocol error.
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),
}

impl Error {
    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Auth(_) => true,
            Self::Imap(err) => matches!(
                err,
                async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
            ),
        }
    }
}

/// A live IMAP session with a cached mailbox status.
pub struct ImapClient {
    session: Option<Session>,
    mailbox: Option<MailboxStatus>,
    has_idle: bool,
    debug: bool,
    pending_updates: Vec<Update>,
}

impl ImapClient {
    /// Dial, wrap TLS when requested, and authenticate.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, Error> {
        let tls_mode = if config.tls {
            imap_tls::TlsMode::Implicit
        } else {
            imap_tls::TlsMode::Plaintext
        };

        let client = imap_tls::connect(imap_tls::Params {
            host: &config.host,
            port: config.port,
            tls_mode,
            tls_skip_verify: config.tls_skip_verify,
        })
        .await?;

        let mut session = imap_auth::authenticate(client, &config.auth).await?;

        let capabilities = session.capabilities().await?;
        let has_idle = capabilities.has_str("IDLE");

        Ok(Self {
            session: Some(session),
            mailbox: None,
            has_idle,
            debug: config.debug,
            pending_updates: Vec::new(),
        })
    }

    /// Whether the underlying session is still usable.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Last known status of the selected mailbox.
    pub fn mailbox(&self) -> Option<&MailboxStatus> {
        self.mailbox.as_ref()
    }

    /// Server-pushed updates observed since the last call.
    pub fn take_updates(&mut self) -> Vec<Update> {
        std::mem::take(&mut self.pending_updates)
    }

    /// Switch the current mailbox; EXAMINE when `read_only`.
    pub async fn select(&mut self, name: &str, read_only: bool) -> Result<MailboxStatus, Error> {
        if self.debug {
            tracing::trace!(mailbox = %name, read_only, "imap select");
        }
        let session = self.session_mut()?;
        let mailbox = if read_only {
            session.examine(name).await?
        } else {
            session.select(name).await?
        };
        let status = MailboxStatus {
            name: name.to_string(),
            exists: mailbox.exists,
            recent: mailbox.recent,
            unseen: mailbox.unseen,
        };
        self.mailbox = Some(status.clone());
        self.drain_updates();
        Ok(status)
    }

    /// Fetch the messages in `set` (by sequence number) into `out`.
    ///
    /// `out` closes when the command finishes.
    pub async fn fetch(&mut self, set: &SeqSet, out: mpsc::Sender<Message>) -> Result<(), Error> {
        if self.debug {
            tracing::trace!(set = %set, "imap fetch");
        }
        let session = self.session_mut()?;
        {
            let mut stream = session.fetch(set.to_string(), FETCH_ITEMS).await?;
            while let Some(fetch) = stream.try_next().await? {
                if let Some(message) = convert_fetch(&fetch)
                    && out.send(message).await.is_err()
                {
                    break;
                }
            }
        }
        self.drain_updates();
        Ok(())
    }

    /// Mutate flags on the messages in `set` (by UID), streaming the
    /// resulting message states into `out`.
    pub async fn uid_store(
        &mut self,
        set: &SeqSet,
        op: StoreOp,
        flags: &[String],
        out: mpsc::Sender<Message>,
    ) -> Result<(), Error> {
        if self.debug {
            tracing::trace!(set = %set, op = ?op, flags = ?flags, "imap uid store");
        }
        let query = format!("{} ({})", op.item(), flags.join(" "));
        let session = self.session_mut()?;
        {
            let mut stream = session.uid_store(set.to_string(), query).await?;
            while let Some(fetch) = stream.try_next().await? {
                if let Some(message) = convert_fetch(&fetch)
                    && out.send(message).await.is_err()
                {
                    break;
                }
            }
        }
        self.drain_updates();
        Ok(())
    }

    /// Permanently remove messages flagged `\Deleted`, streaming expunged
    /// sequence numbers into `out` when given.
    pub async fn expunge(&mut self, out: Option<mpsc::Sender<u32>>) -> Result<(), Error> {
        if self.debug {
            tracing::trace!("imap expunge");
        }
        let session = self.session_mut()?;
        {
            let stream = session.expunge().await?;
            pin_mut!(stream);
            while let Some(seq) = stream.try_next().await? {
                if let Some(out) = &out {
                    let _ = out.send(seq).await;
                }
            }
        }
        self.drain_updates();
        Ok(())
    }

    /// Append a message literal to `mailbox`.
    pub async fn append(&mut self, mailbox: &str, body: &[u8]) -> Result<(), Error> {
        if self.debug {
            tracing::trace!(mailbox = %mailbox, size = body.len(), "imap append");
        }
        let session = self.session_mut()?;
        session.append(mailbox, None, None, body).await?;
        self.drain_updates();
        Ok(())
    }

    /// Wait for mailbox activity.
    ///
    /// Returns when `stop` fires, the server reports new data, or the wait
    /// ceiling elapses. Servers without the IDLE capability are polled with
    /// NOOP instead.
    pub async fn idle(
        &mut self,
        stop: Option<flag_counter::Gate>,
        opts: IdleOptions,
    ) -> Result<(), Error> {
        let wait = opts.logout_timeout.min(opts.poll_interval);
        if self.debug {
            tracing::trace!(wait = ?wait, real_idle = self.has_idle, "imap idle");
        }

        if !self.has_idle {
            tokio::select! {
                _ = flag_counter::wait_opt(stop) => {}
                _ = tokio::time::sleep(wait) => {}
            }
            let session = self.session_mut()?;
            session.noop().await?;
            self.drain_updates();
            return Ok(());
        }

        let Some(session) = self.session.take() else {
            return Err(Error::Imap(async_imap::error::Error::ConnectionLost));
        };
        let mut handle = session.idle();
        handle.init().await?;

        let response = {
            let (idle_wait, interrupt) = handle.wait_with_timeout(wait);
            tokio::pin!(idle_wait);
            tokio::select! {
                res = &mut idle_wait => res,
                _ = flag_counter::wait_opt(stop) => {
                    drop(interrupt);
                    (&mut idle_wait).await
                }
            }
        };

        let session = handle.done().await?;
        self.session = Some(session);

        match response? {
            async_imap::extensions::idle::IdleResponse::NewData(data) => {
                if let Some(update) = self.note_idle_response(data.parsed()) {
                    self.pending_updates.push(update);
                }
            }
            async_imap::extensions::idle::IdleResponse::Timeout
            | async_imap::extensions::idle::IdleResponse::ManualInterrupt => {}
        }

        self.drain_updates();
        Ok(())
    }

    /// Terminate the session.
    pub async fn logout(mut self) -> Result<(), Error> {
        if let Some(mut session) = self.session.take() {
            session.logout().await?;
        }
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session, Error> {
        self.session
            .as_mut()
            .ok_or(Error::Imap(async_imap::error::Error::ConnectionLost))
    }

    /// Record a response delivered through an IDLE wake-up.
    fn note_idle_response(
        &mut self,
        response: &async_imap::imap_proto::Response<'_>,
    ) -> Option<Update> {
        use async_imap::imap_proto::{MailboxDatum, Response, Status};

        match response {
            Response::MailboxData(MailboxDatum::Exists(n)) => {
                if let Some(mailbox) = self.mailbox.as_mut() {
                    mailbox.exists = *n;
                }
                Some(Update::MailboxSize(*n))
            }
            Response::MailboxData(MailboxDatum::Recent(n)) => {
                if let Some(mailbox) = self.mailbox.as_mut() {
                    mailbox.recent = *n;
                }
                Some(Update::Recent(*n))
            }
            Response::Expunge(n) => {
                if let Some(mailbox) = self.mailbox.as_mut() {
                    mailbox.exists = mailbox.exists.saturating_sub(1);
                }
                Some(Update::Expunge(*n))
            }
            Response::Data {
                status: Status::Bye,
                information,
                ..
            } => {
                tracing::warn!(information = ?information, "server closed the session");
                self.session = None;
                Some(Update::Status {
                    information: information.as_ref().map(|s| s.to_string()),
                })
            }
            Response::Data { information, .. } => Some(Update::Status {
                information: information.as_ref().map(|s| s.to_string()),
            }),
            _ => None,
        }
    }

    /// Move pending unsolicited responses into the update buffer.
    fn drain_updates(&mut self) {
        use async_imap::types::UnsolicitedResponse;

        let mut responses = Vec::new();
        if let Some(session) = self.session.as_ref() {
            while let Ok(response) = session.unsolicited_responses.try_recv() {
                responses.push(response);
            }
        }

        for response in responses {
            let update = match response {
                UnsolicitedResponse::Exists(n) => {
                    if let Some(mailbox) = self.mailbox.as_mut() {
                        mailbox.exists = n;
                    }
                    Some(Update::MailboxSize(n))
                }
                UnsolicitedResponse::Recent(n) => {
                    if let Some(mailbox) = self.mailbox.as_mut() {
                        mailbox.recent = n;
                    }
                    Some(Update::Recent(n))
                }
                UnsolicitedResponse::Expunge(seq) => {
                    if let Some(mailbox) = self.mailbox.as_mut() {
                        mailbox.exists = mailbox.exists.saturating_sub(1);
                    }
                    Some(Update::Expunge(seq))
                }
                UnsolicitedResponse::Other(data) => {
                    use async_imap::imap_proto::{Response, Status};

                    match data.parsed() {
                        Response::Data {
                            status: Status::Bye,
                            information,
                            ..
                        } => {
                            tracing::warn!(information = ?information, "server closed the session");
                            self.session = None;
                            Some(Update::Status {
                                information: information.as_ref().map(|s| s.to_string()),
                            })
                        }
                        Response::Data { information, .. } => Some(Update::Status {
                            information: information.as_ref().map(|s| s.to_string()),
                        }),
                        _ => None,
                    }
                }
                _ => None,
            };
            if let Some(update) = update {
                self.pending_updates.push(update);
            }
        }
    }
}

/// Convert an IMAP flag into its wire representation.
fn flag_to_string(flag: async_imap::types::Flag<'_>) -> String {
    use async_imap::types::Flag;

    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.into_owned(),
    }
}

/// Convert a FETCH response into a [`Message`], skipping UID-less responses.
fn convert_fetch(fetch: &async_imap::types::Fetch) -> Option<Message> {
    let uid = fetch.uid?;
    Some(Message {
        uid,
        seq: fetch.message,
        flags: fetch.flags().map(flag_to_string).collect(),
        internal_date: fetch.internal_date(),
        body: fetch.body().map(|body| body.to_vec()).unwrap_or_default(),
    })
}
