//! Tests for multi-pump JSON config parsing.

use std::path::PathBuf;

use config_core::*;

fn must_parse(json: &str) -> MultiConfig {
    config_load::parse_multi_str(json).expect("failed to parse JSON")
}

#[test]
fn parses_the_full_multi_config() {
    let config = must_parse(include_str!("fixtures/multi.json"));

    assert_eq!(config.log_level.as_deref(), Some("debug"));
    assert_eq!(config.log_format, Some(LogFormat::Json));

    assert_eq!(config.destination.url, "imaps://mail.example.com/");
    assert_eq!(config.destination.username, "archive@example.com");
    assert_eq!(config.destination.auth_method, AuthMethod::Login);

    assert_eq!(config.sources.len(), 2);

    let personal = &config.sources["personal"];
    assert_eq!(personal.target_mailbox, "INBOX");
    assert_eq!(personal.connection.url, "imaps://imap.example.com/INBOX");
    assert_eq!(personal.settings, PumpSettings::default());

    let spamtrap = &config.sources["spamtrap"];
    assert_eq!(spamtrap.target_mailbox, "Junk");
    assert_eq!(spamtrap.connection.auth_method, AuthMethod::Plain);
    assert_eq!(
        spamtrap.connection.password_file,
        Some(PathBuf::from("/run/secrets/trap-password"))
    );
    assert_eq!(spamtrap.settings.batch_size, Some(5));
    assert_eq!(spamtrap.settings.fetch_max_interval_secs, Some(60));
    assert!(spamtrap.settings.disable_deletions);
    assert_eq!(spamtrap.settings.idle_fallback_interval_secs, None);
}

#[test]
fn rejects_unknown_auth_methods() {
    let json = r#"{
        "destination": {
            "url": "imaps://mail.example.com/",
            "auth_method": "ntlm",
            "username": "archive@example.com"
        },
        "sources": {}
    }"#;

    assert!(config_load::parse_multi_str(json).is_err());
}
