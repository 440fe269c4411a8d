//! Docker-backed multi-source routing tests.

use std::time::Duration;

use tokio::sync::mpsc;

use imap_client::ConnectionConfig;
use pump_integration::{
    IMAP_PORT, TestError, connect_with_retry, start_greenmail, wait_for_count,
};

const SOURCE_A: &str = "alpha";
const SOURCE_B: &str = "beta";
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

fn source(host: &str, port: u16, user: &str) -> multi_pump::SourceConfig {
    multi_pump::SourceConfig {
        connection: connection(host, port, user, "INBOX"),
        idle_fallback_interval: Some(Duration::from_secs(1)),
        batch_size: None,
        fetch_buffer_size: None,
        fetch_max_interval: Some(Duration::from_secs(2)),
        disable_deletions: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routes_each_source_to_its_target_mailbox() -> Result<(), TestError> {
    if !pump_integration::integration_tests_enabled() {
        eprintln!("skipping: set MAILPUMP_INTEGRATION_TESTS=1 to run");
        return Ok(());
    }

    let container = start_greenmail(&[
        (SOURCE_A, PASSWORD),
        (SOURCE_B, PASSWORD),
        (DEST_USER, PASSWORD),
    ])
    .await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(IMAP_PORT).await?;

    // The second target mailbox has to exist up front.
    let mut dest_session = connect_with_retry(&host, port, DEST_USER, PASSWORD).await?;
    dest_session.create("Junk").await?;

    let mut session_a = connect_with_retry(&host, port, SOURCE_A, PASSWORD).await?;
    session_a
        .append("INBOX", None, None, b"Subject: a\r\n\r\nfrom alpha\r\n")
        .await?;
    let mut session_b = connect_with_retry(&host, port, SOURCE_B, PASSWORD).await?;
    session_b
        .append("INBOX", None, None, b"Subject: b\r\n\r\nfrom beta\r\n")
        .await?;

    let mut stop = flag_counter::FlagCounter::new();
    let (done_tx, _done_rx) = mpsc::channel(1);
    let pump = multi_pump::MultiPump::new(multi_pump::Config {
        destination: connection(&host, port, DEST_USER, ""),
        sources: vec![source(&host, port, SOURCE_A), source(&host, port, SOURCE_B)],
        target_mailboxes: vec!["INBOX".to_string(), "Junk".to_string()],
        stop: stop.gate(),
        done: done_tx,
    })?;

    // Each source lands in its own target mailbox, and both source copies
    // are deleted independently.
    wait_for_count(&mut dest_session, "INBOX", 1, Duration::from_secs(30)).await?;
    wait_for_count(&mut dest_session, "Junk", 1, Duration::from_secs(30)).await?;
    wait_for_count(&mut session_a, "INBOX", 0, Duration::from_secs(30)).await?;
    wait_for_count(&mut session_b, "INBOX", 0, Duration::from_secs(30)).await?;

    stop.flag();
    pump.close().await;

    Ok(())
}
