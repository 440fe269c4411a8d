//! A reconnecting IMAP client with a stable command interface.
//!
//! The handle is cheap to clone; all commands are serialised through one
//! background task that owns the live session and transparently redials,
//! re-authenticates, and re-selects the configured mailbox. Commands issued
//! while disconnected wait in the queue and replay against the new session;
//! commands issued after [`PersistentClient::logout`] fail fast.

mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use imap_client::{ConnectionConfig, IdleOptions, MailboxStatus, Message, SeqSet, StoreOp, Update};

/// Default reconnect delay ceiling.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(64);

/// Persistent client settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection settings for each (re)connect attempt.
    pub connection: ConnectionConfig,

    /// Reconnect delay ceiling; clamped to at least one second.
    pub max_delay: Option<Duration>,

    /// Where server-pushed updates are delivered.
    pub updates: Option<mpsc::Sender<Update>>,
}

/// Errors returned by the persistent client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client has been shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// IMAP client error.
    #[error(transparent)]
    Client(#[from] imap_client::Error),
}

pub(crate) enum Request {
    Select {
        name: String,
        read_only: bool,
        reply: oneshot::Sender<Result<MailboxStatus, Error>>,
    },
    Fetch {
        set: SeqSet,
        out: mpsc::Sender<Message>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    UidStore {
        set: SeqSet,
        op: StoreOp,
        flags: Vec<String>,
        out: mpsc::Sender<Message>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Expunge {
        out: Option<mpsc::Sender<u32>>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Append {
        mailbox: String,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Mailbox {
        reply: oneshot::Sender<Option<MailboxStatus>>,
    },
}

pub(crate) struct IdleRequest {
    pub(crate) stop: Option<flag_counter::Gate>,
    pub(crate) opts: IdleOptions,
    pub(crate) reply: oneshot::Sender<Result<(), Error>>,
}

pub(crate) struct LogoutRequest {
    pub(crate) reply: oneshot::Sender<()>,
}

/// Handle to a reconnecting IMAP client.
#[derive(Clone)]
pub struct PersistentClient {
    cmd_tx: mpsc::Sender<Request>,
    idle_tx: mpsc::Sender<IdleRequest>,
    logout_tx: mpsc::Sender<LogoutRequest>,
    shutdown: Arc<AtomicBool>,
    logged_out_rx: watch::Receiver<bool>,
    mailbox: String,
    log_url: String,
}

impl PersistentClient {
    /// Create the client and start its background task.
    ///
    /// The first connection attempt happens immediately; failures are retried
    /// with exponential backoff and never surface here.
    pub fn new(config: Config) -> Self {
        let Config {
            connection,
            max_delay,
            updates,
        } = config;

        let max_delay = max_delay
            .unwrap_or(DEFAULT_MAX_DELAY)
            .max(Duration::from_secs(1));

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (idle_tx, idle_rx) = mpsc::channel(1);
        let (logout_tx, logout_rx) = mpsc::channel(1);
        let (logged_out_tx, logged_out_rx) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mailbox = connection.mailbox.clone();
        let log_url = connection.log_url();

        tokio::spawn(task::run(task::Task {
            connection,
            max_delay,
            updates_tx: updates,
            cmd_rx,
            idle_rx,
            logout_rx,
            shutdown: Arc::clone(&shutdown),
            logged_out_tx,
            log_url: log_url.clone(),
        }));

        Self {
            cmd_tx,
            idle_tx,
            logout_tx,
            shutdown,
            logged_out_rx,
            mailbox,
            log_url,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait for mailbox activity.
    ///
    /// While disconnected the request is parked and resolves successfully as
    /// soon as `stop` fires; on reconnect it upgrades to a real server IDLE.
    pub async fn idle(
        &self,
        stop: Option<flag_counter::Gate>,
        opts: IdleOptions,
    ) -> Result<(), Error> {
        tracing::trace!(url = %self.log_url, "pimap idle invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .idle_tx
            .send(IdleRequest { stop, opts, reply })
            .await
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Switch the current mailbox.
    pub async fn select(&self, name: &str, read_only: bool) -> Result<MailboxStatus, Error> {
        tracing::trace!(url = %self.log_url, mailbox = %name, "pimap select invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = Request::Select {
            name: name.to_string(),
            read_only,
            reply,
        };
        if self.cmd_tx.send(request).await.is_err() {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Fetch the messages in `set` (by sequence number) into `out`.
    pub async fn fetch(&self, set: SeqSet, out: mpsc::Sender<Message>) -> Result<(), Error> {
        tracing::trace!(url = %self.log_url, set = %set, "pimap fetch invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Request::Fetch { set, out, reply })
            .await
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Mutate flags on the messages in `set` (by UID), streaming the
    /// resulting message states into `out`.
    pub async fn uid_store(
        &self,
        set: SeqSet,
        op: StoreOp,
        flags: Vec<String>,
        out: mpsc::Sender<Message>,
    ) -> Result<(), Error> {
        tracing::trace!(url = %self.log_url, set = %set, "pimap uid store invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = Request::UidStore {
            set,
            op,
            flags,
            out,
            reply,
        };
        if self.cmd_tx.send(request).await.is_err() {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Permanently remove messages flagged `\Deleted`.
    pub async fn expunge(&self, out: Option<mpsc::Sender<u32>>) -> Result<(), Error> {
        tracing::trace!(url = %self.log_url, "pimap expunge invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Request::Expunge { out, reply })
            .await
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Append a message literal to `mailbox`.
    pub async fn append(&self, mailbox: &str, body: Vec<u8>) -> Result<(), Error> {
        tracing::trace!(url = %self.log_url, mailbox = %mailbox, "pimap append invoked");
        if self.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = Request::Append {
            mailbox: mailbox.to_string(),
            body,
            reply,
        };
        if self.cmd_tx.send(request).await.is_err() {
            return Err(Error::ConnectionClosed);
        }
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Last known status of the selected mailbox.
    ///
    /// After shutdown this answers with a name-only placeholder; treat it as
    /// "status unknown" rather than "empty".
    pub async fn mailbox(&self) -> Option<MailboxStatus> {
        tracing::trace!(url = %self.log_url, "pimap mailbox invoked");
        if self.is_shutdown() {
            return Some(MailboxStatus::placeholder(&self.mailbox));
        }

        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Request::Mailbox { reply }).await.is_err() {
            return Some(MailboxStatus::placeholder(&self.mailbox));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Some(MailboxStatus::placeholder(&self.mailbox)))
    }

    /// Shut the client down and wait for the background task to wind up.
    ///
    /// Redundant calls return success immediately.
    pub async fn logout(&self) -> Result<(), Error> {
        let already = self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err();
        tracing::trace!(url = %self.log_url, already, "pimap logout invoked");
        if already {
            return Ok(());
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .logout_tx
            .send(LogoutRequest { reply })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }

    /// Non-blocking hint that a shutdown is desired.
    pub fn flag_quit(&self) {
        if self.is_shutdown() {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            let _ = client.logout().await;
        });
    }

    /// Wait until the background task has exited.
    pub async fn logged_out(&self) {
        let mut rx = self.logged_out_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
