//! Docker-backed end-to-end pump tests.

use std::time::Duration;

use tokio::sync::mpsc;

use imap_client::ConnectionConfig;
use pump_integration::{
    IMAP_PORT, TestError, connect_with_retry, fetch_bodies, start_greenmail, wait_for_count,
};

const SOURCE_USER: &str = "src";
const DEST_USER: &str = "dst";
const PASSWORD: &str = "secret";

fn connection(host: &str, port: u16, user: &str, mailbox: &str) -> ConnectionConfig {
    ConnectionConfig {
        host: host.to_string(),
        port,
        auth: imap_auth::Auth::Login {
            username: user.to_string(),
            password: PASSWORD.to_string(),
        },
        mailbox: mailbox.to_string(),
        tls: false,
        tls_skip_verify: false,
        debug: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pump_moves_mail_and_picks_up_new_messages() -> Result<(), TestError> {
    if !pump_integration::integration_tests_enabled() {
        eprintln!("skipping: set MAILPUMP_INTEGRATION_TESTS=1 to run");
        return Ok(());
    }

    let container = start_greenmail(&[(SOURCE_USER, PASSWORD), (DEST_USER, PASSWORD)]).await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(IMAP_PORT).await?;

    // Seed one message in the source INBOX.
    let first = b"Subject: one\r\n\r\nfirst message\r\n";
    let mut source_session = connect_with_retry(&host, port, SOURCE_USER, PASSWORD).await?;
    source_session.append("INBOX", None, None, first).await?;

    let mut stop = flag_counter::FlagCounter::new();
    let (done_tx, _done_rx) = mpsc::channel(1);
    let pump = pump::MailPump::new(pump::Config {
        source: connection(&host, port, SOURCE_USER, "INBOX"),
        dest: connection(&host, port, DEST_USER, "INBOX"),
        idle_fallback_interval: Some(Duration::from_secs(1)),
        batch_size: None,
        fetch_buffer_size: None,
        // GreenMail doesn't always push EXISTS, force periodic fetches.
        fetch_max_interval: Some(Duration::from_secs(2)),
        disable_deletions: false,
        stop: stop.gate(),
        done: done_tx,
    });

    // The message lands in the destination INBOX with its exact bytes.
    let mut dest_session = connect_with_retry(&host, port, DEST_USER, PASSWORD).await?;
    wait_for_count(&mut dest_session, "INBOX", 1, Duration::from_secs(30)).await?;
    let bodies = fetch_bodies(&mut dest_session, "INBOX").await?;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0], first);

    // The source copy is deleted.
    wait_for_count(&mut source_session, "INBOX", 0, Duration::from_secs(30)).await?;

    // A second message is picked up without any reconfiguration.
    let second = b"Subject: two\r\n\r\nsecond message\r\n";
    source_session.append("INBOX", None, None, second).await?;

    wait_for_count(&mut dest_session, "INBOX", 2, Duration::from_secs(30)).await?;
    wait_for_count(&mut source_session, "INBOX", 0, Duration::from_secs(30)).await?;

    stop.flag();
    pump.close().await;

    Ok(())
}
