//! IMAP authentication.

mod token;

pub use token::{OAuth2Params, TokenError, TokenSource};

/// An auth error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Login failed.
    #[error("login: {0}")]
    Login(#[source] async_imap::error::Error),

    /// SASL PLAIN failed.
    #[error("sasl plain: {0}")]
    Plain(#[source] async_imap::error::Error),

    /// SASL OAUTHBEARER failed.
    #[error("sasl oauthbearer: {0}")]
    OAuthBearer(#[source] async_imap::error::Error),

    /// Obtaining a bearer token failed.
    #[error("token: {0}")]
    Token(#[from] TokenError),
}

/// Auth params.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Username/password login.
    Login {
        /// Username for IMAP authentication.
        ///
        /// Typically an email address.
        username: String,

        /// Password for IMAP authentication.
        password: String,
    },

    /// SASL PLAIN with an empty authorization identity.
    Plain {
        /// Username for IMAP authentication.
        username: String,

        /// Password for IMAP authentication.
        password: String,
    },

    /// SASL OAUTHBEARER backed by a refreshable token source.
    OAuthBearer {
        /// The user for IMAP authentication.
        ///
        /// Typically an email address.
        username: String,

        /// Source of short-lived bearer tokens.
        tokens: TokenSource,
    },
}

/// Authenticate the client to obtain a session.
pub async fn authenticate<T>(
    client: async_imap::Client<T>,
    auth: &Auth,
) -> Result<async_imap::Session<T>, Error>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    match auth {
        Auth::Login { username, password } => client
            .login(username, password)
            .await
            .map_err(|(err, _client)| Error::Login(err)),
        Auth::Plain { username, password } => client
            .authenticate("PLAIN", PlainAuthenticator { username, password })
            .await
            .map_err(|(err, _client)| Error::Plain(err)),
        Auth::OAuthBearer { username, tokens } => {
            let access_token = tokens.access_token().await?;
            client
                .authenticate(
                    "OAUTHBEARER",
                    OAuthBearerAuthenticator {
                        username,
                        access_token: &access_token,
                    },
                )
                .await
                .map_err(|(err, _client)| Error::OAuthBearer(err))
        }
    }
}

/// An internal SASL PLAIN authenticator for provided credentials.
struct PlainAuthenticator<'a> {
    /// Username.
    username: &'a str,

    /// Password.
    password: &'a str,
}

impl async_imap::Authenticator for PlainAuthenticator<'_> {
    type Response = String;

    fn process(&mut self, _: &[u8]) -> Self::Response {
        plain_initial_response(self.username, self.password)
    }
}

/// An internal OAUTHBEARER authenticator for a freshly obtained token.
struct OAuthBearerAuthenticator<'a> {
    /// User.
    username: &'a str,

    /// Access token.
    access_token: &'a str,
}

impl async_imap::Authenticator for OAuthBearerAuthenticator<'_> {
    type Response = String;

    fn process(&mut self, _: &[u8]) -> Self::Response {
        oauthbearer_initial_response(self.username, self.access_token)
    }
}

/// SASL PLAIN initial response with an empty authorization identity.
fn plain_initial_response(username: &str, password: &str) -> String {
    format!("\u{0}{username}\u{0}{password}")
}

/// OAUTHBEARER initial response per RFC 7628.
fn oauthbearer_initial_response(username: &str, access_token: &str) -> String {
    format!("n,a={username},\u{1}auth=Bearer {access_token}\u{1}\u{1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_bytes() {
        let response = plain_initial_response("username", "password");
        assert_eq!(response.as_bytes(), b"\x00username\x00password");
    }

    #[test]
    fn oauthbearer_initial_response_bytes() {
        let response = oauthbearer_initial_response("username", "token");
        assert_eq!(
            response.as_bytes(),
            b"n,a=username,\x01auth=Bearer token\x01\x01"
        );
    }
}
