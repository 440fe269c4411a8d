//! One source, one destination.
//!
//! The pump wires a receiver's outbound channel into the ingest client and
//! routes append outcomes back as acks, so the receiver deletes the source
//! copy only once the destination has accepted the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use imap_client::{ConnectionConfig, Message};
use ingest_client::IngestClient;
use receiver::Receiver;

/// Pump settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source connection settings.
    pub source: ConnectionConfig,

    /// Destination connection settings; its mailbox is the append target.
    pub dest: ConnectionConfig,

    /// Poll ceiling for a single IDLE on the source.
    pub idle_fallback_interval: Option<Duration>,

    /// Deletion batch size on the source.
    pub batch_size: Option<usize>,

    /// Per-batch FETCH width on the source.
    pub fetch_buffer_size: Option<usize>,

    /// Ceiling on the time between fetches on the source.
    pub fetch_max_interval: Option<Duration>,

    /// Never delete from the source. For debugging only.
    pub disable_deletions: bool,

    /// Fires when the pump should stop.
    pub stop: flag_counter::Gate,

    /// Signalled once the pump loop has terminated.
    pub done: mpsc::Sender<()>,
}

/// A running source-to-destination pump.
pub struct MailPump {
    receiver: Receiver,
    ingest: IngestClient,
}

impl MailPump {
    /// Start the pump and its forwarding task.
    pub fn new(config: Config) -> Self {
        let Config {
            source,
            dest,
            idle_fallback_interval,
            batch_size,
            fetch_buffer_size,
            fetch_max_interval,
            disable_deletions,
            stop,
            done,
        } = config;

        let dest_mailbox = dest.mailbox.clone();

        let (out_tx, out_rx) = mpsc::channel(20);
        let receiver = Receiver::new(receiver::Config {
            connection: source,
            max_delay: None,
            channel: out_tx,
            idle_fallback_interval,
            batch_size,
            fetch_buffer_size,
            fetch_max_interval,
            disable_deletions,
        });

        let ingest = IngestClient::new(ingest_client::Config {
            connection: dest,
            max_delay: None,
        });

        let (ingest_reply_tx, ingest_reply_rx) = mpsc::channel(10);

        tokio::spawn({
            let receiver = receiver.clone();
            let ingest = ingest.clone();
            async move {
                tick(
                    receiver,
                    ingest,
                    dest_mailbox,
                    out_rx,
                    ingest_reply_tx,
                    ingest_reply_rx,
                    stop,
                )
                .await;
                let _ = done.send(()).await;
            }
        });

        Self { receiver, ingest }
    }

    /// Stop both halves and wait for them.
    pub async fn close(&self) {
        tokio::join!(self.receiver.close(), self.ingest.close());
    }
}

async fn tick(
    receiver: Receiver,
    ingest: IngestClient,
    dest_mailbox: String,
    mut out_rx: mpsc::Receiver<Message>,
    ingest_reply_tx: mpsc::Sender<ingest_client::Response>,
    mut ingest_reply_rx: mpsc::Receiver<ingest_client::Response>,
    stop: flag_counter::Gate,
) {
    loop {
        tokio::select! {
            Some(message) = out_rx.recv() => {
                tracing::trace!(uid = message.uid, seq = message.seq, "pump handle incoming");
                let uid = message.uid;
                if let Err(err) = ingest
                    .ingest_message(&dest_mailbox, message, ingest_reply_tx.clone())
                    .await
                {
                    receiver.ack(uid, Some(Arc::new(err))).await;
                }
            }
            Some(response) = ingest_reply_rx.recv() => {
                let error = response.error.map(|err| err as receiver::AckError);
                receiver.ack(response.uid, error).await;
            }
            _ = stop.clone().fired() => {
                tracing::trace!("pump exit requested");
                break;
            }
        }
    }
}
