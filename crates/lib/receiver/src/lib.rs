//! Per-source receiver state machine.
//!
//! A receiver watches one mailbox through a persistent client, emits every
//! message it finds exactly once on its outbound channel, and deletes a
//! message from the source only after the caller acknowledges it.

mod imap;
mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use imap_client::{ConnectionConfig, Message};
use persistent_client::PersistentClient;

/// Default deletion batch size.
pub const DEFAULT_BATCH_SIZE: usize = 15;

/// Default IDLE poll ceiling.
pub const DEFAULT_IDLE_FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-batch FETCH width.
pub const DEFAULT_FETCH_BUFFER_SIZE: usize = 20;

/// Default ceiling on the time between fetches.
pub const DEFAULT_FETCH_MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Receiver settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source connection settings.
    pub connection: ConnectionConfig,

    /// Reconnect delay ceiling for the underlying client.
    pub max_delay: Option<Duration>,

    /// Where fetched messages are emitted.
    pub channel: mpsc::Sender<Message>,

    /// Poll ceiling for a single IDLE.
    pub idle_fallback_interval: Option<Duration>,

    /// Deletion batch size.
    pub batch_size: Option<usize>,

    /// Per-batch FETCH width.
    pub fetch_buffer_size: Option<usize>,

    /// Ceiling on the time between fetches; can abort IDLE.
    pub fetch_max_interval: Option<Duration>,

    /// Never delete from the source. For debugging only.
    pub disable_deletions: bool,
}

/// An error handed back through [`Receiver::ack`].
pub type AckError = Arc<dyn std::error::Error + Send + Sync>;

pub(crate) struct AckRequest {
    pub(crate) uid: u32,
    pub(crate) error: Option<AckError>,
}

/// Handle to a running receiver.
#[derive(Clone)]
pub struct Receiver {
    ack_tx: mpsc::Sender<AckRequest>,
    quit_tx: mpsc::Sender<()>,
    has_quit_rx: watch::Receiver<bool>,
    client: PersistentClient,
}

impl Receiver {
    /// Start a receiver and its background task.
    pub fn new(config: Config) -> Self {
        let Config {
            connection,
            max_delay,
            channel,
            idle_fallback_interval,
            batch_size,
            fetch_buffer_size,
            fetch_max_interval,
            disable_deletions,
        } = config;

        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let idle_fallback_interval =
            idle_fallback_interval.unwrap_or(DEFAULT_IDLE_FALLBACK_INTERVAL);
        let fetch_buffer_size = fetch_buffer_size.unwrap_or(DEFAULT_FETCH_BUFFER_SIZE);
        let fetch_max_interval = fetch_max_interval.unwrap_or(DEFAULT_FETCH_MAX_INTERVAL);

        let (updates_tx, updates_rx) = mpsc::channel(10);
        let client = PersistentClient::new(persistent_client::Config {
            connection,
            max_delay,
            updates: Some(updates_tx),
        });

        let (ack_tx, ack_rx) = mpsc::channel(fetch_buffer_size.max(1));
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let (worker_tx, worker_rx) = mpsc::channel(1);
        let (op_tx, op_rx) = mpsc::channel(1);
        let (has_quit_tx, has_quit_rx) = watch::channel(false);

        tokio::spawn(task::run(task::Task {
            client: client.clone(),
            updates_rx,
            worker_rx,
            worker_tx,
            ack_rx,
            op_rx,
            op_tx,
            out_tx: channel,
            quit_rx,
            has_quit_tx,
            batch_size,
            idle_fallback_interval,
            fetch_buffer_size,
            fetch_max_interval,
            disable_deletions,
        }));

        Self {
            ack_tx,
            quit_tx,
            has_quit_rx,
            client,
        }
    }

    /// Report the outcome of handling a message.
    ///
    /// UID zero is ignored. An error keeps the message unacknowledged; it is
    /// fetched again while the server still shows it.
    pub async fn ack(&self, uid: u32, error: Option<AckError>) {
        match &error {
            Some(err) => tracing::trace!(uid, error = %err, "receiver ack called"),
            None => tracing::trace!(uid, "receiver ack called"),
        }

        if uid == 0 {
            return;
        }

        let _ = self.ack_tx.send(AckRequest { uid, error }).await;
    }

    /// Stop the receiver and wait for its task to exit.
    pub async fn close(&self) {
        tracing::trace!("receiver close invoked");
        let _ = self.quit_tx.send(()).await;

        let mut rx = self.has_quit_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        let _ = self.client.logout().await;
        tracing::trace!("receiver close done");
    }
}
