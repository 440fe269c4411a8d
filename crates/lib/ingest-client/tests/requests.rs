//! Request validation and shutdown behaviour.

use std::time::Duration;

use imap_client::{ConnectionConfig, Message};
use ingest_client::{Config, Error, IngestClient};
use tokio::sync::mpsc;

fn unreachable_config() -> ConnectionConfig {
    ConnectionConfig {
        host: "0.0.0.0".to_string(),
        port: 993,
        auth: imap_auth::Auth::Login {
            username: "username".to_string(),
            password: "password".to_string(),
        },
        mailbox: String::new(),
        tls: false,
        tls_skip_verify: false,
        debug: false,
    }
}

fn message(uid: u32) -> Message {
    Message {
        uid,
        seq: 1,
        flags: Vec::new(),
        internal_date: None,
        body: b"Subject: test\r\n\r\nhello\r\n".to_vec(),
    }
}

#[tokio::test]
async fn rejects_uid_zero_synchronously() {
    let ingest = IngestClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
    });

    let (reply_tx, _reply_rx) = mpsc::channel(1);
    let err = ingest
        .ingest_message("INBOX", message(0), reply_tx)
        .await
        .expect_err("uid zero must be rejected");
    assert!(matches!(err, Error::InvalidUid));

    ingest.close().await;
}

#[tokio::test]
async fn rejects_requests_after_close() {
    let ingest = IngestClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
    });

    tokio::time::timeout(Duration::from_secs(1), ingest.close())
        .await
        .expect("close did not return");

    let (reply_tx, _reply_rx) = mpsc::channel(1);
    let err = ingest
        .ingest_message("INBOX", message(1), reply_tx)
        .await
        .expect_err("requests after close must fail");
    assert!(matches!(err, Error::ConnectionClosed));
}
