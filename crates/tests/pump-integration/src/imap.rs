//! IMAP connectivity helpers.

use std::time::Duration;

use async_imap::Client;
use futures::TryStreamExt as _;
use tokio::net::TcpStream;

/// A test error.
pub type TestError = Box<dyn std::error::Error + Send + Sync>;

/// Connects to the IMAP server with retries until it is ready.
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
) -> Result<async_imap::Session<TcpStream>, std::io::Error> {
    let try_connect = || async move {
        let stream = TcpStream::connect((host, port)).await?;

        let mut client = Client::new(stream);

        let Some(_) = client.read_response().await? else {
            return Err(std::io::Error::other("missing IMAP greeting"));
        };

        let session = client
            .login(user, password)
            .await
            .map_err(|(err, _)| std::io::Error::other(err))?;

        Ok(session)
    };

    let mut attempts = 60u8;
    loop {
        let err = match try_connect().await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };

        let Some(attempts_left) = attempts.checked_sub(1) else {
            return Err(err);
        };

        attempts = attempts_left;
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Query the number of messages in the mailbox.
pub async fn message_count(
    session: &mut async_imap::Session<TcpStream>,
    mailbox: &str,
) -> Result<u32, async_imap::error::Error> {
    let status = session.status(mailbox, "(MESSAGES)").await?;
    Ok(status.exists)
}

/// Poll the mailbox until it holds exactly `expected` messages.
pub async fn wait_for_count(
    session: &mut async_imap::Session<TcpStream>,
    mailbox: &str,
    expected: u32,
    timeout: Duration,
) -> Result<(), TestError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = message_count(session, mailbox).await?;
        if count == expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "timed out waiting for {expected} messages in {mailbox}, have {count}"
            )
            .into());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Fetch the raw bodies of every message in the mailbox, in sequence order.
pub async fn fetch_bodies(
    session: &mut async_imap::Session<TcpStream>,
    mailbox: &str,
) -> Result<Vec<Vec<u8>>, async_imap::error::Error> {
    let mailbox = session.select(mailbox).await?;
    if mailbox.exists == 0 {
        return Ok(Vec::new());
    }

    let mut bodies = Vec::new();
    {
        let mut stream = session.fetch("1:*", "RFC822").await?;
        while let Some(fetch) = stream.try_next().await? {
            if let Some(body) = fetch.rfc822() {
                bodies.push(body.to_vec());
            }
        }
    }

    Ok(bodies)
}
