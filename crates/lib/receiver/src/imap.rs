//! Fetch and delete worker passes.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use imap_client::{MailboxStatus, Message, SeqSet, StoreOp};
use persistent_client::PersistentClient;

use crate::task::{DeleteResult, FetchResult, MessageState, Tracked, WorkerEvent};

const DELETED_FLAG: &str = "\\Deleted";

/// Build the sequence numbers to fetch next: counting up from one, skipping
/// those already tracked, capped at `max_size` entries or the mailbox total.
pub(crate) fn build_seq_set(
    existing: &SeqSet,
    status: &MailboxStatus,
    max_size: usize,
) -> SeqSet {
    let mut seq = SeqSet::new();

    let mut queued = 0;
    let mut next = 1u32;
    while queued < max_size && next <= status.exists {
        if !existing.contains(next) {
            seq.add_num(next);
            queued += 1;
        }
        next += 1;
    }

    seq
}

/// One fetch pass: read the mailbox status, fetch the next window, and hand
/// the collected messages back to the receiver loop.
pub(crate) async fn do_fetch(
    client: PersistentClient,
    existing: SeqSet,
    max_size: usize,
    results: mpsc::Sender<WorkerEvent>,
) {
    tracing::trace!("receiver fetching messages");

    let Some(status) = client.mailbox().await else {
        tracing::warn!("receiver has no mailbox");
        return;
    };

    tracing::trace!(
        name = %status.name,
        num_messages = status.exists,
        recent = status.recent,
        unseen = ?status.unseen,
        "receiver mailbox status"
    );

    if status.exists == 0 {
        return;
    }

    let set = build_seq_set(&existing, &status, max_size);
    tracing::trace!(set = %set, "receiver fetch set");
    if set.is_empty() {
        return;
    }

    let (tx, rx) = mpsc::channel(1);
    let (res, collected) = tokio::join!(client.fetch(set, tx), read_messages(rx));

    match res {
        Err(err) => tracing::warn!(error = %err, "receiver fetch failed"),
        Ok(()) => {
            let uids: Vec<u32> = collected.keys().copied().collect();
            tracing::trace!(uids = ?uids, "receiver fetch succeeded");
            let result = FetchResult {
                uids,
                messages: collected,
            };
            let _ = results.send(WorkerEvent::Fetch(result)).await;
        }
    }
}

/// Collect fetched messages, deduplicating by UID.
async fn read_messages(mut rx: mpsc::Receiver<Message>) -> BTreeMap<u32, Message> {
    // Some servers repeat messages within one response.
    let mut unique = BTreeMap::new();
    while let Some(message) = rx.recv().await {
        unique.insert(message.uid, message);
    }
    unique
}

/// One delete pass: flag acked messages `\Deleted`, report each outcome, and
/// expunge.
pub(crate) async fn do_delete(
    client: PersistentClient,
    results: mpsc::Sender<WorkerEvent>,
    to_process: HashMap<u32, Tracked>,
) {
    let mut delete_set = SeqSet::new();

    for msg in to_process.values() {
        match msg.state {
            MessageState::Acked => {
                delete_set.add_num(msg.uid);
            }
            MessageState::Deleted => {
                // Already deleted; hand it back so it gets dropped.
                tracing::warn!(uid = msg.uid, "receiver message already deleted");
                let result = DeleteResult {
                    uid: msg.uid,
                    state: MessageState::Deleted,
                };
                let _ = results.send(WorkerEvent::Delete(result)).await;
            }
            MessageState::Unacked => {}
        }
    }

    if !delete_set.is_empty() {
        let (tx, rx) = mpsc::channel(1);
        let store = client.uid_store(
            delete_set,
            StoreOp::Add,
            vec![DELETED_FLAG.to_string()],
            tx,
        );
        let forward = forward_store_results(rx, &results);

        let (store_res, ()) = tokio::join!(store, forward);
        if let Err(err) = store_res {
            tracing::warn!(error = %err, "receiver delete failed");
        }
    }

    // The returned sequence numbers are inconsistent across servers, skip
    // them. If the server refuses to expunge a message there is nothing to be
    // done anyway.
    if let Err(err) = client.expunge(None).await {
        tracing::warn!(error = %err, "receiver expunge failed");
    }
}

/// Map streamed store responses onto delete outcomes.
async fn forward_store_results(
    mut rx: mpsc::Receiver<Message>,
    results: &mpsc::Sender<WorkerEvent>,
) {
    while let Some(message) = rx.recv().await {
        let state = if message.flags.iter().any(|flag| flag == DELETED_FLAG) {
            MessageState::Deleted
        } else {
            tracing::warn!(uid = message.uid, "receiver message not deleted, rescheduling");
            MessageState::Acked
        };
        let result = DeleteResult {
            uid: message.uid,
            state,
        };
        let _ = results.send(WorkerEvent::Delete(result)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_generation_skips_tracked_messages() {
        let status = MailboxStatus {
            name: "INBOX".to_string(),
            exists: 53,
            ..MailboxStatus::default()
        };

        let mut tracked: HashMap<u32, Tracked> = HashMap::new();
        for seq in [1, 2, 10] {
            tracked.insert(
                seq,
                Tracked {
                    uid: seq,
                    seq,
                    state: MessageState::Unacked,
                },
            );
        }

        let existing: SeqSet = tracked.values().map(|m| m.seq).collect();
        let to_fetch = build_seq_set(&existing, &status, 20);

        let mut expected = SeqSet::new();
        expected.add_range(3, 9);
        expected.add_range(11, 23);
        assert_eq!(to_fetch, expected);

        for seq in (3..=9).chain(11..=23) {
            tracked.insert(
                seq,
                Tracked {
                    uid: seq,
                    seq,
                    state: MessageState::Unacked,
                },
            );
        }

        let existing: SeqSet = tracked.values().map(|m| m.seq).collect();
        let to_fetch = build_seq_set(&existing, &status, 20);

        let mut expected = SeqSet::new();
        expected.add_range(24, 43);
        assert_eq!(to_fetch, expected);
    }

    #[test]
    fn sequence_generation_stops_at_mailbox_total() {
        let status = MailboxStatus {
            name: "INBOX".to_string(),
            exists: 5,
            ..MailboxStatus::default()
        };

        let to_fetch = build_seq_set(&SeqSet::new(), &status, 20);

        let mut expected = SeqSet::new();
        expected.add_range(1, 5);
        assert_eq!(to_fetch, expected);
    }

    #[test]
    fn sequence_generation_of_empty_mailbox_is_empty() {
        let status = MailboxStatus {
            name: "INBOX".to_string(),
            ..MailboxStatus::default()
        };

        assert!(build_seq_set(&SeqSet::new(), &status, 20).is_empty());
    }
}
