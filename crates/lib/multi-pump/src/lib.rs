//! N sources, one destination.
//!
//! Each receiver's traffic is bridged by a small dispatcher task that tags
//! messages and append outcomes with the receiver's index, so the main loop
//! is a fixed three-way select and replies route back to the originating
//! receiver in O(1).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use imap_client::{ConnectionConfig, Message};
use ingest_client::IngestClient;
use receiver::Receiver;

/// Per-source settings.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Source connection settings.
    pub connection: ConnectionConfig,

    /// Poll ceiling for a single IDLE.
    pub idle_fallback_interval: Option<Duration>,

    /// Deletion batch size.
    pub batch_size: Option<usize>,

    /// Per-batch FETCH width.
    pub fetch_buffer_size: Option<usize>,

    /// Ceiling on the time between fetches.
    pub fetch_max_interval: Option<Duration>,

    /// Never delete from this source. For debugging only.
    pub disable_deletions: bool,
}

/// Multi-pump settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Destination connection settings.
    pub destination: ConnectionConfig,

    /// Source settings, one per receiver.
    pub sources: Vec<SourceConfig>,

    /// Destination mailbox per source, index-aligned with `sources`.
    pub target_mailboxes: Vec<String>,

    /// Fires when the pump should stop.
    pub stop: flag_counter::Gate,

    /// Signalled once the pump loop has terminated.
    pub done: mpsc::Sender<()>,
}

/// Errors returned by the multi-pump constructor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No sources were configured.
    #[error("no sources configured")]
    NoSources,

    /// Sources and target mailboxes are not index-aligned.
    #[error("mismatching source configuration/mailbox pairs")]
    SourceMailboxMismatch,
}

/// A running many-to-one pump.
pub struct MultiPump {
    receivers: Vec<Receiver>,
    ingest: IngestClient,
}

impl MultiPump {
    /// Validate the configuration, start all receivers, the ingest client,
    /// and the dispatch loop.
    pub fn new(config: Config) -> Result<Self, Error> {
        let Config {
            destination,
            sources,
            target_mailboxes,
            stop,
            done,
        } = config;

        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        if sources.len() != target_mailboxes.len() {
            return Err(Error::SourceMailboxMismatch);
        }

        let ingest = IngestClient::new(ingest_client::Config {
            connection: destination,
            max_delay: None,
        });

        // One shared channel per direction; dispatcher tasks tag traffic
        // with the originating receiver's index.
        let (incoming_tx, incoming_rx) = mpsc::channel::<(usize, Message)>(1);
        let (replies_tx, replies_rx) = mpsc::channel::<(usize, ingest_client::Response)>(1);

        let mut receivers = Vec::with_capacity(sources.len());
        let mut reply_txs = Vec::with_capacity(sources.len());

        for (index, source) in sources.into_iter().enumerate() {
            let (out_tx, mut out_rx) = mpsc::channel(20);
            receivers.push(Receiver::new(receiver::Config {
                connection: source.connection,
                max_delay: None,
                channel: out_tx,
                idle_fallback_interval: source.idle_fallback_interval,
                batch_size: source.batch_size,
                fetch_buffer_size: source.fetch_buffer_size,
                fetch_max_interval: source.fetch_max_interval,
                disable_deletions: source.disable_deletions,
            }));

            let incoming_tx = incoming_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = out_rx.recv().await {
                    if incoming_tx.send((index, message)).await.is_err() {
                        break;
                    }
                }
            });

            let (reply_tx, mut reply_rx) = mpsc::channel::<ingest_client::Response>(10);
            reply_txs.push(reply_tx);

            let replies_tx = replies_tx.clone();
            tokio::spawn(async move {
                while let Some(response) = reply_rx.recv().await {
                    if replies_tx.send((index, response)).await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn({
            let receivers = receivers.clone();
            let ingest = ingest.clone();
            async move {
                tick(
                    receivers,
                    ingest,
                    target_mailboxes,
                    reply_txs,
                    incoming_rx,
                    replies_rx,
                    stop,
                )
                .await;
                let _ = done.send(()).await;
            }
        });

        Ok(Self { receivers, ingest })
    }

    /// Stop all receivers and the ingest client, waiting for each.
    pub async fn close(&self) {
        futures::future::join_all(self.receivers.iter().map(|receiver| receiver.close())).await;
        self.ingest.close().await;
    }
}

async fn tick(
    receivers: Vec<Receiver>,
    ingest: IngestClient,
    target_mailboxes: Vec<String>,
    reply_txs: Vec<mpsc::Sender<ingest_client::Response>>,
    mut incoming_rx: mpsc::Receiver<(usize, Message)>,
    mut replies_rx: mpsc::Receiver<(usize, ingest_client::Response)>,
    stop: flag_counter::Gate,
) {
    loop {
        tokio::select! {
            Some((index, message)) = incoming_rx.recv() => {
                tracing::trace!(
                    receiver = index,
                    uid = message.uid,
                    seq = message.seq,
                    "pump handle incoming"
                );
                let uid = message.uid;
                if let Err(err) = ingest
                    .ingest_message(&target_mailboxes[index], message, reply_txs[index].clone())
                    .await
                {
                    receivers[index].ack(uid, Some(Arc::new(err))).await;
                }
            }
            Some((index, response)) = replies_rx.recv() => {
                let error = response.error.map(|err| err as receiver::AckError);
                receivers[index].ack(response.uid, error).await;
            }
            _ = stop.clone().fired() => {
                tracing::trace!("pump exit requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            host: "0.0.0.0".to_string(),
            port: 993,
            auth: imap_auth::Auth::Login {
                username: "username".to_string(),
                password: "password".to_string(),
            },
            mailbox: "INBOX".to_string(),
            tls: false,
            tls_skip_verify: false,
            debug: false,
        }
    }

    fn source() -> SourceConfig {
        SourceConfig {
            connection: connection(),
            idle_fallback_interval: None,
            batch_size: None,
            fetch_buffer_size: None,
            fetch_max_interval: None,
            disable_deletions: false,
        }
    }

    #[tokio::test]
    async fn rejects_zero_sources() {
        let mut stop = flag_counter::FlagCounter::new();
        let (done_tx, _done_rx) = mpsc::channel(1);

        let err = MultiPump::new(Config {
            destination: connection(),
            sources: Vec::new(),
            target_mailboxes: Vec::new(),
            stop: stop.gate(),
            done: done_tx,
        })
        .err()
        .expect("constructor must fail");
        assert!(matches!(err, Error::NoSources));
        stop.flag();
    }

    #[tokio::test]
    async fn rejects_mismatched_target_mailboxes() {
        let mut stop = flag_counter::FlagCounter::new();
        let (done_tx, _done_rx) = mpsc::channel(1);

        let err = MultiPump::new(Config {
            destination: connection(),
            sources: vec![source(), source()],
            target_mailboxes: vec!["INBOX".to_string()],
            stop: stop.gate(),
            done: done_tx,
        })
        .err()
        .expect("constructor must fail");
        assert!(matches!(err, Error::SourceMailboxMismatch));
        stop.flag();
    }
}
