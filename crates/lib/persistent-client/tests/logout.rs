//! Shutdown behaviour against an unreachable endpoint.

use std::time::Duration;

use imap_client::{ConnectionConfig, IdleOptions};
use persistent_client::{Config, Error, PersistentClient};

fn unreachable_config() -> ConnectionConfig {
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

fn idle_opts() -> IdleOptions {
    IdleOptions {
        logout_timeout: Duration::from_secs(250),
        poll_interval: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn logout_returns_quickly_when_disconnected() {
    let client = PersistentClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
        updates: None,
    });

    tokio::time::timeout(Duration::from_millis(500), client.logout())
        .await
        .expect("logout did not return in time")
        .expect("logout failed");

    let err = client
        .idle(None, idle_opts())
        .await
        .expect_err("idle after logout must fail");
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn redundant_logout_succeeds() {
    let client = PersistentClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
        updates: None,
    });

    client.logout().await.expect("first logout failed");
    client.logout().await.expect("second logout failed");

    tokio::time::timeout(Duration::from_secs(1), client.logged_out())
        .await
        .expect("logged-out gate did not fire");
}

#[tokio::test]
async fn idle_resolves_when_stopped_while_disconnected() {
    let client = PersistentClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
        updates: None,
    });

    let mut stop = flag_counter::FlagCounter::new();
    let gate = stop.gate();

    let idle = tokio::spawn({
        let client = client.clone();
        async move { client.idle(Some(gate), idle_opts()).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.flag();

    let res = tokio::time::timeout(Duration::from_secs(1), idle)
        .await
        .expect("idle did not return")
        .expect("idle task panicked");
    assert!(res.is_ok());

    client.logout().await.expect("logout failed");
}

#[tokio::test]
async fn mailbox_after_logout_is_a_placeholder() {
    let client = PersistentClient::new(Config {
        connection: unreachable_config(),
        max_delay: None,
        updates: None,
    });

    client.logout().await.expect("logout failed");

    let status = client.mailbox().await.expect("placeholder expected");
    assert_eq!(status.name, "INBOX");
    assert_eq!(status.exists, 0);
}
