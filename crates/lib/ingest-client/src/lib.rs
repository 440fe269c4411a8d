//! Destination-side ingest actor.
//!
//! A single long-lived session to the destination server; append requests
//! are strictly serialised, and each one is answered on its own reply
//! channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use imap_client::{ConnectionConfig, Message};
use persistent_client::PersistentClient;

/// Ingest client settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Destination connection settings.
    pub connection: ConnectionConfig,

    /// Reconnect delay ceiling for the underlying client.
    pub max_delay: Option<Duration>,
}

/// Errors returned by the ingest client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The message carries no usable UID.
    #[error("invalid uid")]
    InvalidUid,

    /// The client has been shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// Appending to the destination failed.
    #[error(transparent)]
    Append(#[from] persistent_client::Error),
}

/// Reply to a single ingest request.
#[derive(Debug, Clone)]
pub struct Response {
    /// UID of the ingested message on the source.
    pub uid: u32,

    /// The append failure, if any.
    pub error: Option<Arc<Error>>,
}

struct IngestRequest {
    mailbox: String,
    uid: u32,
    message: Message,
    reply: mpsc::Sender<Response>,
}

/// Handle to a running ingest client.
#[derive(Clone)]
pub struct IngestClient {
    incoming_tx: mpsc::Sender<IngestRequest>,
    quit_tx: mpsc::Sender<()>,
    has_quit_rx: watch::Receiver<bool>,
    shutdown: Arc<AtomicBool>,
}

impl IngestClient {
    /// Start an ingest client and its background task.
    pub fn new(config: Config) -> Self {
        let client = PersistentClient::new(persistent_client::Config {
            connection: config.connection,
            max_delay: config.max_delay,
            updates: None,
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let (has_quit_tx, has_quit_rx) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));

        tokio::spawn(run(
            client,
            incoming_rx,
            quit_rx,
            has_quit_tx,
            Arc::clone(&shutdown),
        ));

        Self {
            incoming_tx,
            quit_tx,
            has_quit_rx,
            shutdown,
        }
    }

    /// Queue a message for appending to `mailbox` on the destination.
    ///
    /// The outcome arrives on `reply`; the call itself only fails when the
    /// request is invalid or the client is shutting down.
    pub async fn ingest_message(
        &self,
        mailbox: &str,
        message: Message,
        reply: mpsc::Sender<Response>,
    ) -> Result<(), Error> {
        tracing::trace!(mailbox = %mailbox, uid = message.uid, seq = message.seq, "ingest message");

        if message.uid == 0 {
            return Err(Error::InvalidUid);
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let request = IngestRequest {
            mailbox: mailbox.to_string(),
            uid: message.uid,
            message,
            reply,
        };
        self.incoming_tx
            .send(request)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Ingest one message and wait for its outcome inline.
    pub async fn ingest_message_sync(
        &self,
        mailbox: &str,
        message: Message,
    ) -> Result<(), Arc<Error>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.ingest_message(mailbox, message, reply_tx)
            .await
            .map_err(Arc::new)?;

        match reply_rx.recv().await {
            Some(Response {
                error: Some(err), ..
            }) => Err(err),
            Some(Response { error: None, .. }) => Ok(()),
            None => Err(Arc::new(Error::ConnectionClosed)),
        }
    }

    /// Stop the ingest client and wait for its task to exit.
    pub async fn close(&self) {
        let _ = self.quit_tx.send(()).await;
        let mut rx = self.has_quit_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn run(
    client: PersistentClient,
    mut incoming_rx: mpsc::Receiver<IngestRequest>,
    mut quit_rx: mpsc::Receiver<()>,
    has_quit_tx: watch::Sender<bool>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            Some(()) = quit_rx.recv() => break,
            Some(request) = incoming_rx.recv() => {
                tracing::trace!(uid = request.uid, seq = request.message.seq, "ingest start");

                let res = client.append(&request.mailbox, request.message.body).await;
                match &res {
                    Err(err) => tracing::error!(
                        uid = request.uid,
                        error = %err,
                        "ingest failed"
                    ),
                    Ok(()) => tracing::info!(uid = request.uid, "ingest success"),
                }

                let response = Response {
                    uid: request.uid,
                    error: res.err().map(|err| Arc::new(Error::Append(err))),
                };
                let _ = request.reply.send(response).await;
            }
            else => break,
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    drain(&mut incoming_rx).await;
    if let Err(err) = client.logout().await {
        tracing::error!(error = %err, "ingest client close failed");
    }
    let _ = has_quit_tx.send(true);
}

/// Answer every queued request after shutdown.
async fn drain(incoming_rx: &mut mpsc::Receiver<IngestRequest>) {
    let mut count = 0u32;
    while let Ok(request) = incoming_rx.try_recv() {
        count += 1;
        let response = Response {
            uid: request.uid,
            error: Some(Arc::new(Error::ConnectionClosed)),
        };
        let _ = request.reply.send(response).await;
    }
    tracing::trace!(count, "ingest drained requests");
}
