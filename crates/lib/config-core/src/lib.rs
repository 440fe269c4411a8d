//! Shared configuration types for mailpump.

mod resolve;

pub use resolve::ResolveError;

use std::path::PathBuf;
use std::str::FromStr;

/// IMAP endpoint configuration.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ImapConfig {
    /// Endpoint URL (`imap://` or `imaps://`); the path is the mailbox.
    pub url: String,

    /// Authentication method.
    #[serde(default)]
    pub auth_method: AuthMethod,

    /// Username for authentication.
    ///
    /// Typically an email address.
    pub username: String,

    /// Password, or the refresh token for `oauthbearer`.
    ///
    /// Never serialized back out.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Read the password from this file instead.
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Read the password from this systemd credential instead.
    #[serde(default)]
    pub password_systemd_credential: Option<String>,

    /// Skip TLS peer verification. Debug only.
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Log protocol-level detail for this connection.
    #[serde(default)]
    pub debug: bool,

    /// OAuth2 client settings for `oauthbearer`.
    #[serde(default)]
    pub oauth2: OAuth2Config,
}

/// Supported authentication methods.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Username/password LOGIN.
    #[default]
    Login,

    /// SASL PLAIN.
    Plain,

    /// SASL OAUTHBEARER; the password field carries the refresh token.
    Oauthbearer,
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "login" => Ok(Self::Login),
            "plain" => Ok(Self::Plain),
            "oauthbearer" => Ok(Self::Oauthbearer),
            other => Err(format!("unknown auth method: {other}")),
        }
    }
}

/// OAuth2 client settings.
#[derive(Debug, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct OAuth2Config {
    /// Provider preset.
    #[serde(default)]
    pub provider: OAuth2Provider,

    /// OAuth2 client id.
    #[serde(default)]
    pub client_id: String,

    /// OAuth2 client secret.
    #[serde(default)]
    pub client_secret: String,

    /// Token endpoint URL.
    #[serde(default)]
    pub token_url: String,

    /// Scopes to request.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Known OAuth2 providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OAuth2Provider {
    /// Use the configured token URL and scopes as-is.
    #[default]
    Custom,

    /// Preset token URL and scope for Google Mail.
    Google,
}

impl FromStr for OAuth2Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "custom" => Ok(Self::Custom),
            "google" => Ok(Self::Google),
            other => Err(format!("unknown oauth2 provider: {other}")),
        }
    }
}

/// Log output format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,

    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Pump tuning knobs; absent values fall back to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct PumpSettings {
    /// Fallback poll interval for servers that don't support IDLE, seconds.
    #[serde(default)]
    pub idle_fallback_interval_secs: Option<u64>,

    /// Deletion batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Per-batch FETCH width.
    #[serde(default)]
    pub fetch_buffer_size: Option<usize>,

    /// Maximum interval between fetches, seconds. Can abort IDLE.
    #[serde(default)]
    pub fetch_max_interval_secs: Option<u64>,

    /// Disable deletions. For debugging only.
    #[serde(default)]
    pub disable_deletions: bool,
}

/// Single-source run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Source endpoint.
    pub source: ImapConfig,

    /// Destination endpoint; its mailbox is the append target.
    pub dest: ImapConfig,

    /// Tuning knobs.
    pub settings: PumpSettings,

    /// Log level.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

/// One named source in the multi-pump configuration.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SourceEntry {
    /// Source endpoint.
    pub connection: ImapConfig,

    /// Destination mailbox for this source's messages.
    pub target_mailbox: String,

    /// Per-source tuning overrides.
    #[serde(flatten)]
    pub settings: PumpSettings,
}

/// Multi-source run configuration.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MultiConfig {
    /// Destination endpoint.
    pub destination: ImapConfig,

    /// Named sources; names only appear in logs.
    pub sources: std::collections::BTreeMap<String, SourceEntry>,

    /// Log level.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Log output format.
    #[serde(default)]
    pub log_format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_from_str() {
        assert_eq!("login".parse(), Ok(AuthMethod::Login));
        assert_eq!("PLAIN".parse(), Ok(AuthMethod::Plain));
        assert_eq!("oauthbearer".parse(), Ok(AuthMethod::Oauthbearer));
        assert!("ntlm".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("text".parse(), Ok(LogFormat::Text));
        assert_eq!("JSON".parse(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
