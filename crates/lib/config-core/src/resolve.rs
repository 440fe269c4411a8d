//! Resolution of endpoint configuration into connection settings.

use std::path::PathBuf;

use imap_auth::{Auth, OAuth2Params, TokenSource};
use imap_client::ConnectionConfig;

use crate::{AuthMethod, ImapConfig, OAuth2Config, OAuth2Provider};

/// Token endpoint for the `google` provider preset.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scope for the `google` provider preset.
const GOOGLE_MAIL_SCOPE: &str = "https://mail.google.com/";

/// Errors returned while resolving endpoint configuration.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The endpoint URL does not parse.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The endpoint URL has an unsupported scheme.
    #[error("invalid url scheme: {0}")]
    InvalidScheme(String),

    /// The endpoint URL has no host.
    #[error("url has no host")]
    MissingHost,

    /// No username was configured.
    #[error("username is required")]
    MissingUsername,

    /// No password source was configured.
    #[error(
        "one of password, password_file or password_systemd_credential is required"
    )]
    MissingPassword,

    /// Reading the password file failed.
    #[error("failed to read password file {path}: {source}")]
    PasswordFile {
        /// Path to the password file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A systemd credential was configured without a credentials directory.
    #[error("systemd credentials directory is not available")]
    NoCredentialsDirectory,

    /// Reading the systemd credential failed.
    #[error("failed to read systemd credential {name}: {source}")]
    SystemdCredential {
        /// Credential name.
        name: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required OAuth2 setting is missing.
    #[error("oauth2 {0} is not set")]
    OAuth2Missing(&'static str),

    /// Building the OAuth2 token source failed.
    #[error("oauth2 token source: {0}")]
    Token(#[from] imap_auth::TokenError),
}

impl ImapConfig {
    /// Resolve into the connection settings the clients consume.
    pub async fn resolve(&self) -> Result<ConnectionConfig, ResolveError> {
        let (host, port, tls, mailbox) = extract_url(&self.url)?;

        if self.username.is_empty() {
            return Err(ResolveError::MissingUsername);
        }
        let password = self.read_password().await?;

        let auth = match self.auth_method {
            AuthMethod::Login => Auth::Login {
                username: self.username.clone(),
                password,
            },
            AuthMethod::Plain => Auth::Plain {
                username: self.username.clone(),
                password,
            },
            AuthMethod::Oauthbearer => {
                let params = self.oauth2.resolve()?;
                Auth::OAuthBearer {
                    username: self.username.clone(),
                    tokens: TokenSource::new(params, password)?,
                }
            }
        };

        Ok(ConnectionConfig {
            host,
            port,
            auth,
            mailbox,
            tls,
            tls_skip_verify: self.tls_skip_verify,
            debug: self.debug,
        })
    }

    /// Read the password from whichever source is configured.
    async fn read_password(&self) -> Result<String, ResolveError> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }

        if let Some(path) = &self.password_file {
            let contents = tokio::fs::read_to_string(path).await.map_err(|source| {
                ResolveError::PasswordFile {
                    path: path.clone(),
                    source,
                }
            })?;
            return Ok(contents.trim().to_string());
        }

        if let Some(name) = &self.password_systemd_credential {
            let dir = std::env::var_os("CREDENTIALS_DIRECTORY")
                .ok_or(ResolveError::NoCredentialsDirectory)?;
            let path = PathBuf::from(dir).join(name);
            let contents = tokio::fs::read_to_string(&path).await.map_err(|source| {
                ResolveError::SystemdCredential {
                    name: name.clone(),
                    source,
                }
            })?;
            return Ok(contents.trim().to_string());
        }

        Err(ResolveError::MissingPassword)
    }
}

impl OAuth2Config {
    /// Apply the provider preset and validate the client settings.
    pub fn resolve(&self) -> Result<OAuth2Params, ResolveError> {
        if self.client_id.is_empty() {
            return Err(ResolveError::OAuth2Missing("client id"));
        }
        if self.client_secret.is_empty() {
            return Err(ResolveError::OAuth2Missing("client secret"));
        }

        match self.provider {
            OAuth2Provider::Custom => {
                if self.token_url.is_empty() {
                    return Err(ResolveError::OAuth2Missing("token url"));
                }
                if self.scopes.is_empty() {
                    return Err(ResolveError::OAuth2Missing("scopes"));
                }
                Ok(OAuth2Params {
                    client_id: self.client_id.clone(),
                    client_secret: self.client_secret.clone(),
                    token_url: self.token_url.clone(),
                    scopes: self.scopes.clone(),
                })
            }
            OAuth2Provider::Google => Ok(OAuth2Params {
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
                token_url: GOOGLE_TOKEN_URL.to_string(),
                scopes: vec![GOOGLE_MAIL_SCOPE.to_string()],
            }),
        }
    }
}

/// Split an `imap://` / `imaps://` URL into host, port, TLS, and mailbox.
fn extract_url(raw: &str) -> Result<(String, u16, bool, String), ResolveError> {
    let parsed = url::Url::parse(raw)?;

    let (default_port, tls) = match parsed.scheme() {
        "imap" => (143, false),
        "imaps" => (993, true),
        other => return Err(ResolveError::InvalidScheme(other.to_string())),
    };

    let host = parsed
        .host_str()
        .ok_or(ResolveError::MissingHost)?
        .to_string();
    let port = parsed.port().unwrap_or(default_port);
    let mailbox = parsed.path().trim_start_matches('/').to_string();

    Ok((host, port, tls, mailbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_imaps_defaults() {
        let (host, port, tls, mailbox) = extract_url("imaps://mail.example.com/Archive")
            .expect("url must parse");
        assert_eq!(host, "mail.example.com");
        assert_eq!(port, 993);
        assert!(tls);
        assert_eq!(mailbox, "Archive");
    }

    #[test]
    fn extracts_imap_with_port_and_no_mailbox() {
        let (host, port, tls, mailbox) =
            extract_url("imap://mail.example.com:1143").expect("url must parse");
        assert_eq!(host, "mail.example.com");
        assert_eq!(port, 1143);
        assert!(!tls);
        assert_eq!(mailbox, "");
    }

    #[test]
    fn rejects_unknown_schemes() {
        let err = extract_url("pop3://mail.example.com").expect_err("must fail");
        assert!(matches!(err, ResolveError::InvalidScheme(scheme) if scheme == "pop3"));
    }

    #[tokio::test]
    async fn missing_password_is_an_error() {
        let config = ImapConfig {
            url: "imap://mail.example.com/INBOX".to_string(),
            auth_method: AuthMethod::Login,
            username: "user@example.com".to_string(),
            password: None,
            password_file: None,
            password_systemd_credential: None,
            tls_skip_verify: false,
            debug: false,
            oauth2: OAuth2Config::default(),
        };

        let err = config.resolve().await.expect_err("must fail");
        assert!(matches!(err, ResolveError::MissingPassword));
    }

    #[tokio::test]
    async fn google_provider_presets_token_url_and_scopes() {
        let config = OAuth2Config {
            provider: OAuth2Provider::Google,
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_url: String::new(),
            scopes: Vec::new(),
        };

        let params = config.resolve().expect("must resolve");
        assert_eq!(params.token_url, GOOGLE_TOKEN_URL);
        assert_eq!(params.scopes, vec![GOOGLE_MAIL_SCOPE.to_string()]);
    }

    #[test]
    fn custom_provider_requires_token_url() {
        let config = OAuth2Config {
            provider: OAuth2Provider::Custom,
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_url: String::new(),
            scopes: vec!["scope".to_string()],
        };

        let err = config.resolve().expect_err("must fail");
        assert!(matches!(err, ResolveError::OAuth2Missing("token url")));
    }
}
