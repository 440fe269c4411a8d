//! The receiver's state machine loop.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use flag_counter::FlagCounter;
use imap_client::{IdleOptions, Message, SeqSet, Update};
use persistent_client::PersistentClient;

use crate::AckRequest;
use crate::imap::{do_delete, do_fetch};

/// Ceiling on one IDLE command; some providers cut sessions held longer than
/// five minutes.
const IDLE_LOGOUT_TIMEOUT: Duration = Duration::from_secs(250);

/// Lifecycle of a tracked message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MessageState {
    Unacked,
    Acked,
    Deleted,
}

/// Per-UID lifecycle record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tracked {
    pub(crate) uid: u32,
    pub(crate) seq: u32,
    pub(crate) state: MessageState,
}

pub(crate) struct FetchResult {
    pub(crate) uids: Vec<u32>,
    pub(crate) messages: BTreeMap<u32, Message>,
}

pub(crate) struct DeleteResult {
    pub(crate) uid: u32,
    pub(crate) state: MessageState,
}

pub(crate) enum WorkerEvent {
    Fetch(FetchResult),
    Delete(DeleteResult),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Operation {
    None,
    Timeout,
    FetchFinish,
    DeleteFinish,
    IdleFinish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    None,
    InIdle,
    InFetch,
    InDelete,
}

pub(crate) struct Task {
    pub(crate) client: PersistentClient,
    pub(crate) updates_rx: mpsc::Receiver<Update>,
    pub(crate) worker_rx: mpsc::Receiver<WorkerEvent>,
    pub(crate) worker_tx: mpsc::Sender<WorkerEvent>,
    pub(crate) ack_rx: mpsc::Receiver<AckRequest>,
    pub(crate) op_rx: mpsc::Receiver<Operation>,
    pub(crate) op_tx: mpsc::Sender<Operation>,
    pub(crate) out_tx: mpsc::Sender<Message>,
    pub(crate) quit_rx: mpsc::Receiver<()>,
    pub(crate) has_quit_tx: watch::Sender<bool>,
    pub(crate) batch_size: usize,
    pub(crate) idle_fallback_interval: Duration,
    pub(crate) fetch_buffer_size: usize,
    pub(crate) fetch_max_interval: Duration,
    pub(crate) disable_deletions: bool,
}

pub(crate) async fn run(mut task: Task) {
    let mut state = State::None;
    let mut messages: HashMap<u32, Tracked> = HashMap::new();
    let mut next_to_process: HashMap<u32, Tracked> = HashMap::new();

    let mut want_quit = FlagCounter::new();
    let mut want_stop_idle = FlagCounter::new();
    let mut want_fetch = FlagCounter::new();
    let mut want_delete = FlagCounter::new();

    'main: loop {
        tracing::trace!(
            state = ?state,
            want_quit = want_quit.is_flagged(),
            want_fetch = want_fetch.is_flagged(),
            want_delete = want_delete.is_flagged(),
            want_stop_idle = want_stop_idle.is_flagged(),
            "receiver loop start"
        );

        let mut op = Operation::None;

        tokio::select! {
            Some(()) = task.quit_rx.recv() => {
                want_quit.flag();
                task.client.flag_quit();
            }
            Some(update) = task.updates_rx.recv() => {
                if handle_update(&update) {
                    want_fetch.flag();
                }
            }
            Some(event) = task.worker_rx.recv() => match event {
                WorkerEvent::Fetch(result) => {
                    if state != State::InFetch {
                        tracing::error!(state = ?state, "receiver fetch result outside fetch");
                    } else if want_quit.is_flagged() {
                        // Quitting, discard all new fetches.
                        tracing::trace!(uids = ?result.uids, "receiver ignoring fetch while quitting");
                    } else {
                        handle_fetch(&task.out_tx, &mut messages, result).await;
                    }
                }
                WorkerEvent::Delete(result) => {
                    if state != State::InDelete {
                        tracing::error!(state = ?state, "receiver delete result outside delete");
                    } else if let Some(msg) = handle_delete(&mut messages, &result) {
                        // Flag again if the delete failed.
                        next_to_process.insert(msg.uid, msg);
                        want_delete.flag_if(!task.disable_deletions);
                    }
                }
            },
            Some(ack) = task.ack_rx.recv() => {
                // ACKs are handled in any state.
                if let Some(msg) = handle_ack(&mut messages, &ack) {
                    next_to_process.insert(msg.uid, msg);
                    want_delete.flag_if(!task.disable_deletions);
                }
            }
            _ = tokio::time::sleep(task.fetch_max_interval) => {
                op = Operation::Timeout;
            }
            Some(received) = task.op_rx.recv() => {
                op = received;
            }
            else => {
                want_quit.flag();
                task.client.flag_quit();
            }
        }

        tracing::trace!(state = ?state, operation = ?op, "receiver tick");

        match state {
            State::None => {
                match op {
                    Operation::None => {}
                    Operation::Timeout => {
                        want_fetch.flag();
                        want_delete.flag_if(!task.disable_deletions);
                    }
                    other => {
                        tracing::error!(
                            state = ?state,
                            operation = ?other,
                            "receiver invalid operation for state"
                        );
                    }
                }

                tracing::trace!(
                    state = ?state,
                    operation = ?op,
                    want_quit = want_quit.is_flagged(),
                    fetch_flag = want_fetch.is_flagged(),
                    delete_flag = want_delete.is_flagged(),
                    to_process_count = next_to_process.len(),
                    "receiver processing state none"
                );

                if want_quit.is_flagged() {
                    want_fetch.reset();
                }

                if next_to_process.len() >= task.batch_size {
                    want_delete.flag_if(!task.disable_deletions);
                }

                if want_delete.is_flagged() {
                    want_delete.reset();

                    if !next_to_process.is_empty() {
                        tracing::trace!("receiver delete start");
                        state = State::InDelete;
                        let to_process = std::mem::take(&mut next_to_process);
                        let client = task.client.clone();
                        let results = task.worker_tx.clone();
                        let op_tx = task.op_tx.clone();
                        tokio::spawn(async move {
                            do_delete(client, results, to_process).await;
                            let _ = op_tx.send(Operation::DeleteFinish).await;
                        });
                        continue 'main;
                    }
                }

                if want_fetch.is_flagged() {
                    tracing::trace!("receiver fetch start");
                    want_fetch.reset();
                    state = State::InFetch;

                    let existing: SeqSet = messages.values().map(|m| m.seq).collect();
                    let client = task.client.clone();
                    let results = task.worker_tx.clone();
                    let op_tx = task.op_tx.clone();
                    let buffer = task.fetch_buffer_size;
                    tokio::spawn(async move {
                        do_fetch(client, existing, buffer, results).await;
                        let _ = op_tx.send(Operation::FetchFinish).await;
                    });
                } else if !want_quit.is_flagged() {
                    tracing::trace!("receiver idle start");
                    state = State::InIdle;

                    let stop = want_stop_idle.gate();
                    let client = task.client.clone();
                    let op_tx = task.op_tx.clone();
                    let opts = IdleOptions {
                        logout_timeout: IDLE_LOGOUT_TIMEOUT,
                        poll_interval: task.idle_fallback_interval,
                    };
                    tokio::spawn(async move {
                        if let Err(err) = client.idle(Some(stop), opts).await {
                            tracing::warn!(error = %err, "receiver idle failed");
                        }
                        let _ = op_tx.send(Operation::IdleFinish).await;
                    });
                } else {
                    break 'main;
                }
            }
            State::InIdle => match op {
                Operation::None | Operation::Timeout => {
                    want_fetch.flag();
                    want_stop_idle.flag();
                }
                Operation::IdleFinish => {
                    tracing::trace!("receiver idle finish");
                    want_stop_idle.reset();
                    state = State::None;
                    let _ = task.op_tx.send(Operation::None).await;
                }
                other => {
                    tracing::error!(
                        state = ?state,
                        operation = ?other,
                        "receiver invalid operation for state"
                    );
                }
            },
            State::InFetch => match op {
                Operation::None | Operation::Timeout => {}
                Operation::FetchFinish => {
                    tracing::trace!("receiver fetch finish");
                    state = State::None;
                    let _ = task.op_tx.send(Operation::None).await;
                }
                other => {
                    tracing::error!(
                        state = ?state,
                        operation = ?other,
                        "receiver invalid operation for state"
                    );
                }
            },
            State::InDelete => match op {
                Operation::None => {}
                Operation::DeleteFinish => {
                    tracing::trace!("receiver delete finish");
                    state = State::None;
                    let _ = task.op_tx.send(Operation::None).await;
                }
                Operation::Timeout => {
                    // Refresh once the delete completes.
                    want_fetch.flag();
                }
                other => {
                    tracing::error!(
                        state = ?state,
                        operation = ?other,
                        "receiver invalid operation for state"
                    );
                }
            },
        }
    }

    tracing::trace!(state = ?state, "receiver loop exit");
    let _ = task.has_quit_tx.send(true);
    tracing::trace!("receiver proc quit");
}

/// Whether a server-push update warrants a fetch.
fn handle_update(update: &Update) -> bool {
    match update {
        Update::Status { information } => {
            // Often contains useful context for the logs.
            tracing::info!(information = ?information, "receiver got status update");
            false
        }
        Update::Expunge(seq) => {
            tracing::trace!(seq, "receiver got expunge update");
            false
        }
        Update::MailboxSize(messages) => {
            tracing::trace!(messages, "receiver got mailbox update");
            true
        }
        Update::Recent(recent) => {
            tracing::trace!(recent, "receiver got recent update");
            false
        }
    }
}

fn log_message_state(msg: &Tracked) {
    tracing::info!(
        uid = msg.uid,
        seq = msg.seq,
        state = ?msg.state,
        "receiver message update"
    );
}

/// Track and emit previously unknown messages; returns how many were new.
async fn handle_fetch(
    out_tx: &mpsc::Sender<Message>,
    messages: &mut HashMap<u32, Tracked>,
    result: FetchResult,
) -> usize {
    tracing::trace!(uids = ?result.uids, "receiver got fetch result");

    let mut num = 0;
    for (uid, message) in result.messages {
        if messages.contains_key(&uid) {
            continue;
        }

        let tracked = Tracked {
            uid,
            seq: message.seq,
            state: MessageState::Unacked,
        };
        messages.insert(uid, tracked);
        log_message_state(&tracked);
        let _ = out_tx.send(message).await;
        num += 1;
    }

    num
}

/// Apply one delete outcome; returns a message that must be retried.
fn handle_delete(
    messages: &mut HashMap<u32, Tracked>,
    result: &DeleteResult,
) -> Option<Tracked> {
    if result.state == MessageState::Deleted {
        tracing::info!(uid = result.uid, state = ?result.state, "receiver message deleted");
        messages.remove(&result.uid);
        return None;
    }

    if let Some(msg) = messages.get_mut(&result.uid) {
        // Delete failed, try again.
        tracing::info!(uid = result.uid, state = ?result.state, "receiver message deletion failed");
        msg.state = result.state;
        let msg = *msg;
        log_message_state(&msg);
        return Some(msg);
    }

    // Unknown message, do nothing.
    tracing::trace!(uid = result.uid, "receiver message deletion unknown");
    None
}

/// Apply one ack; returns the message when it newly became acked.
fn handle_ack(messages: &mut HashMap<u32, Tracked>, ack: &AckRequest) -> Option<Tracked> {
    match &ack.error {
        Some(err) => {
            tracing::warn!(uid = ack.uid, error = %err, "receiver ack");
            return None;
        }
        None => tracing::info!(uid = ack.uid, "receiver ack"),
    }

    if let Some(msg) = messages.get_mut(&ack.uid)
        && msg.state == MessageState::Unacked
    {
        msg.state = MessageState::Acked;
        let msg = *msg;
        log_message_state(&msg);
        return Some(msg);
    }

    None
}
