//! Configuration loading for the mailpump binary.
//!
//! The `run` mode binds everything from `MAILPUMP_*` environment variables;
//! the `run-multi` mode reads a JSON file (or stdin).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use config_core::{
    AuthMethod, ImapConfig, LogFormat, MultiConfig, OAuth2Config, OAuth2Provider, PumpSettings,
    RunConfig,
};

/// An environment variable that failed to bind.
#[derive(Debug, thiserror::Error)]
#[error("{var}: {message}")]
pub struct EnvError {
    /// The variable in question.
    var: String,

    /// What went wrong.
    message: String,
}

/// Errors returned while loading the multi-pump configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to read the configuration from stdin.
    #[error("failed to read config from stdin: {0}")]
    Stdin(#[source] std::io::Error),

    /// Failed to parse the JSON contents.
    #[error("failed to parse JSON config: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Bind the single-source run configuration from the environment.
pub fn run_from_env() -> Result<RunConfig, EnvError> {
    Ok(RunConfig {
        source: imap_from_env("SOURCE")?,
        dest: imap_from_env("DEST")?,
        settings: PumpSettings {
            idle_fallback_interval_secs: maybe("MAILPUMP_IDLE_FALLBACK_INTERVAL_SECS")?,
            batch_size: maybe("MAILPUMP_BATCH_SIZE")?,
            fetch_buffer_size: maybe("MAILPUMP_FETCH_BUFFER_SIZE")?,
            fetch_max_interval_secs: maybe("MAILPUMP_FETCH_MAX_INTERVAL_SECS")?,
            disable_deletions: or("MAILPUMP_DISABLE_DELETIONS", false)?,
        },
        log_level: or("MAILPUMP_LOG_LEVEL", "info".to_string())?,
        log_format: or("MAILPUMP_LOG_FORMAT", LogFormat::default())?,
    })
}

/// Bind one endpoint from `MAILPUMP_<prefix>_*` variables.
fn imap_from_env(prefix: &str) -> Result<ImapConfig, EnvError> {
    let scopes: Option<String> = maybe(&format!("MAILPUMP_{prefix}_OAUTH2_SCOPES"))?;

    Ok(ImapConfig {
        url: must(&format!("MAILPUMP_{prefix}_URL"))?,
        auth_method: or(
            &format!("MAILPUMP_{prefix}_AUTH_METHOD"),
            AuthMethod::default(),
        )?,
        username: must(&format!("MAILPUMP_{prefix}_USERNAME"))?,
        password: maybe(&format!("MAILPUMP_{prefix}_PASSWORD"))?,
        password_file: maybe(&format!("MAILPUMP_{prefix}_PASSWORD_FILE"))?,
        password_systemd_credential: maybe(&format!(
            "MAILPUMP_{prefix}_PASSWORD_SYSTEMD_CREDENTIAL"
        ))?,
        tls_skip_verify: or(&format!("MAILPUMP_{prefix}_TLS_SKIP_VERIFY"), false)?,
        debug: or(&format!("MAILPUMP_{prefix}_DEBUG"), false)?,
        oauth2: OAuth2Config {
            provider: or(
                &format!("MAILPUMP_{prefix}_OAUTH2_PROVIDER"),
                OAuth2Provider::default(),
            )?,
            client_id: or(&format!("MAILPUMP_{prefix}_OAUTH2_CLIENT_ID"), String::new())?,
            client_secret: or(
                &format!("MAILPUMP_{prefix}_OAUTH2_CLIENT_SECRET"),
                String::new(),
            )?,
            token_url: or(&format!("MAILPUMP_{prefix}_OAUTH2_TOKEN_URL"), String::new())?,
            scopes: scopes
                .map(|raw| {
                    raw.split(',')
                        .map(|scope| scope.trim().to_string())
                        .filter(|scope| !scope.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        },
    })
}

/// Leak `var` to obtain the `&'static str` this version of `envfury` requires.
///
/// Callers build variable names dynamically (`MAILPUMP_{prefix}_URL`), so we
/// can't pass them through as borrows; config loading happens once at
/// startup, so the leak is not a practical concern.
fn leak(var: &str) -> &'static str {
    Box::leak(var.to_string().into_boxed_str())
}

fn must<T>(var: &str) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    envfury::must(leak(var)).map_err(|err| EnvError {
        var: var.to_string(),
        message: err.to_string(),
    })
}

fn maybe<T>(var: &str) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    envfury::maybe(leak(var)).map_err(|err| EnvError {
        var: var.to_string(),
        message: err.to_string(),
    })
}

fn or<T>(var: &str, default: T) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    envfury::or(leak(var), default).map_err(|err| EnvError {
        var: var.to_string(),
        message: err.to_string(),
    })
}

/// Load the multi-pump configuration from a JSON file on disk.
pub async fn load_multi_from_path<P>(path: P) -> Result<MultiConfig, LoadError>
where
    P: AsRef<Path>,
{
    let path_ref = path.as_ref();
    let contents = tokio::fs::read_to_string(path_ref)
        .await
        .map_err(|source| LoadError::Read {
            path: path_ref.to_path_buf(),
            source,
        })?;

    parse_multi_str(&contents).map_err(LoadError::Parse)
}

/// Load the multi-pump configuration from stdin.
pub async fn load_multi_from_stdin() -> Result<MultiConfig, LoadError> {
    use tokio::io::AsyncReadExt as _;

    let mut contents = String::new();
    tokio::io::stdin()
        .read_to_string(&mut contents)
        .await
        .map_err(LoadError::Stdin)?;

    parse_multi_str(&contents).map_err(LoadError::Parse)
}

/// Parse the multi-pump configuration directly from a JSON string.
pub fn parse_multi_str(contents: &str) -> Result<MultiConfig, serde_json::Error> {
    serde_json::from_str(contents)
}
