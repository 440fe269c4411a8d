//! Background connection task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use imap_client::{ConnectionConfig, ImapClient, MailboxStatus, Update};

use crate::{Error, IdleRequest, LogoutRequest, Request};

pub(crate) struct Task {
    pub(crate) connection: ConnectionConfig,
    pub(crate) max_delay: Duration,
    pub(crate) updates_tx: Option<mpsc::Sender<Update>>,
    pub(crate) cmd_rx: mpsc::Receiver<Request>,
    pub(crate) idle_rx: mpsc::Receiver<IdleRequest>,
    pub(crate) logout_rx: mpsc::Receiver<LogoutRequest>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) logged_out_tx: watch::Sender<bool>,
    pub(crate) log_url: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Disconnected,
    Connected,
}

pub(crate) async fn run(mut task: Task) {
    let mut client: Option<ImapClient> = None;
    let mut pending_idle: Option<IdleRequest> = None;
    let mut next_delay = Duration::ZERO;
    let mut backoff = exp_backoff::State::new(
        2,
        Duration::from_secs(1),
        Duration::from_secs(1),
        task.max_delay,
    );
    let mut state = State::Disconnected;

    let logout = 'main: loop {
        tracing::trace!(
            url = %task.log_url,
            state = ?state,
            fake_idle = pending_idle.is_some(),
            "pimap loop enter"
        );

        if state == State::Disconnected {
            let pending_stop = pending_idle.as_ref().and_then(|req| req.stop.clone());

            tokio::select! {
                _ = flag_counter::wait_opt(pending_stop.clone()), if pending_stop.is_some() => {
                    // Stop a parked IDLE during disconnect.
                    tracing::trace!(url = %task.log_url, "pimap fake idle stop");
                    let Some(req) = pending_idle.take() else {
                        panic!("not in idle");
                    };
                    let _ = req.reply.send(Ok(()));
                }
                Some(req) = task.idle_rx.recv() => {
                    // We're disconnected, park the request until reconnect.
                    if pending_idle.is_some() {
                        panic!("already in idle");
                    }
                    tracing::trace!(url = %task.log_url, "pimap fake idle start");
                    pending_idle = Some(req);
                }
                Some(req) = task.logout_rx.recv() => {
                    tracing::trace!(
                        url = %task.log_url,
                        fake_idle = pending_idle.is_some(),
                        "pimap logout request"
                    );
                    if let Some(idle) = pending_idle.take() {
                        tracing::trace!(url = %task.log_url, "pimap fake idle stop");
                        let _ = idle.reply.send(Ok(()));
                    }
                    break 'main Some(req);
                }
                _ = tokio::time::sleep(next_delay) => {}
            }

            match connect_and_select(&task.connection).await {
                Ok(mut fresh) => {
                    forward_updates(&task.updates_tx, &mut fresh).await;
                    client = Some(fresh);
                    state = State::Connected;
                    backoff.reset();
                    next_delay = backoff.peek();
                }
                Err(err) => {
                    next_delay = backoff.advance();
                    tracing::error!(
                        url = %task.log_url,
                        error = %err,
                        new_delay = ?next_delay,
                        "pimap connection failed"
                    );
                    continue;
                }
            }
        }

        if state == State::Connected {
            let Some(c) = client.as_mut() else {
                state = State::Disconnected;
                continue;
            };

            // Upgrade a parked IDLE to a real one.
            if let Some(req) = pending_idle.take() {
                tracing::trace!(url = %task.log_url, "pimap idle enter");
                let res = c.idle(req.stop, req.opts).await;
                forward_updates(&task.updates_tx, c).await;
                let fatal =
                    matches!(&res, Err(err) if err.is_fatal()) || !c.is_connected();
                tracing::trace!(url = %task.log_url, fatal, "pimap idle exit");

                // A disconnect mid-IDLE is not the caller's error.
                let reply = if fatal { Ok(()) } else { res.map_err(Error::Client) };
                let _ = req.reply.send(reply);

                if fatal {
                    client = None;
                    state = State::Disconnected;
                }
                continue;
            }

            tokio::select! {
                Some(req) = task.logout_rx.recv() => {
                    tracing::trace!(url = %task.log_url, "pimap logout request");
                    break 'main Some(req);
                }
                Some(req) = task.idle_rx.recv() => {
                    pending_idle = Some(req);
                }
                Some(req) = task.cmd_rx.recv() => {
                    let fatal = handle_command(c, req).await;
                    forward_updates(&task.updates_tx, c).await;
                    if fatal || !c.is_connected() {
                        tracing::trace!(url = %task.log_url, "pimap disconnected");
                        client = None;
                        state = State::Disconnected;
                    }
                }
                else => break 'main None,
            }
        }
    };

    task.shutdown.store(true, Ordering::SeqCst);
    // New requests now fail fast at the handle; queued ones are drained below.

    if let Some(req) = logout {
        let _ = req.reply.send(());
    }
    if let Some(idle) = pending_idle.take() {
        let _ = idle.reply.send(Ok(()));
    }
    if let Some(c) = client.take()
        && let Err(err) = c.logout().await
    {
        tracing::info!(url = %task.log_url, error = %err, "logout failed");
    }
    drain_requests(&mut task);
    let _ = task.logged_out_tx.send(true);
    tracing::trace!(url = %task.log_url, "pimap proc exit");
}

/// Dial, authenticate, and select the configured mailbox.
async fn connect_and_select(connection: &ConnectionConfig) -> Result<ImapClient, Error> {
    let mut client = ImapClient::connect(connection).await?;

    if !connection.mailbox.is_empty()
        && let Err(err) = client.select(&connection.mailbox, false).await
    {
        let _ = client.logout().await;
        return Err(err.into());
    }

    Ok(client)
}

/// Execute one queued command; returns whether the session died.
async fn handle_command(client: &mut ImapClient, request: Request) -> bool {
    match request {
        Request::Select {
            name,
            read_only,
            reply,
        } => {
            let res = client.select(&name, read_only).await;
            let fatal = is_fatal(&res);
            let _ = reply.send(res.map_err(Error::Client));
            fatal
        }
        Request::Fetch { set, out, reply } => {
            let res = client.fetch(&set, out).await;
            let fatal = is_fatal(&res);
            let _ = reply.send(res.map_err(Error::Client));
            fatal
        }
        Request::UidStore {
            set,
            op,
            flags,
            out,
            reply,
        } => {
            let res = client.uid_store(&set, op, &flags, out).await;
            let fatal = is_fatal(&res);
            let _ = reply.send(res.map_err(Error::Client));
            fatal
        }
        Request::Expunge { out, reply } => {
            let res = client.expunge(out).await;
            let fatal = is_fatal(&res);
            let _ = reply.send(res.map_err(Error::Client));
            fatal
        }
        Request::Append {
            mailbox,
            body,
            reply,
        } => {
            let res = client.append(&mailbox, &body).await;
            let fatal = is_fatal(&res);
            let _ = reply.send(res.map_err(Error::Client));
            fatal
        }
        Request::Mailbox { reply } => {
            let _ = reply.send(client.mailbox().cloned());
            false
        }
    }
}

fn is_fatal<T>(res: &Result<T, imap_client::Error>) -> bool {
    matches!(res, Err(err) if err.is_fatal())
}

/// Deliver buffered server-push updates to the configured channel.
async fn forward_updates(updates_tx: &Option<mpsc::Sender<Update>>, client: &mut ImapClient) {
    let updates = client.take_updates();
    let Some(tx) = updates_tx else {
        return;
    };
    for update in updates {
        if tx.send(update).await.is_err() {
            break;
        }
    }
}

/// Answer every queued request after shutdown.
fn drain_requests(task: &mut Task) {
    let mut count = 0u32;
    loop {
        let mut drained = false;

        if let Ok(req) = task.logout_rx.try_recv() {
            count += 1;
            drained = true;
            let _ = req.reply.send(());
        }
        if let Ok(req) = task.idle_rx.try_recv() {
            count += 1;
            drained = true;
            let _ = req.reply.send(Err(Error::ConnectionClosed));
        }
        if let Ok(req) = task.cmd_rx.try_recv() {
            count += 1;
            drained = true;
            match req {
                Request::Select { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Request::Fetch { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Request::UidStore { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Request::Expunge { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Request::Append { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Request::Mailbox { reply } => {
                    let _ = reply.send(Some(MailboxStatus::placeholder(
                        &task.connection.mailbox,
                    )));
                }
            }
        }

        if !drained {
            break;
        }
    }
    tracing::trace!(url = %task.log_url, count, "pimap drained requests");
}
