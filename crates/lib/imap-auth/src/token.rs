//! Refreshable OAuth2 bearer token source.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use oauth2::TokenResponse as _;

/// If the token expires in less than this duration, refresh it.
const EXPIRATION_IMMINENCE_TOLERANCE: Duration = Duration::from_secs(30);

/// OAuth2 client settings for the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuth2Params {
    /// OAuth2 client id.
    pub client_id: String,

    /// OAuth2 client secret.
    pub client_secret: String,

    /// Token endpoint URL.
    pub token_url: String,

    /// Scopes to request on refresh.
    pub scopes: Vec<String>,
}

/// The configured OAuth2 client type: only the token endpoint is set.
type TokenClient = oauth2::basic::BasicClient<
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

/// An error that can occur while obtaining a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token endpoint URL is invalid.
    #[error("invalid token url: {0}")]
    TokenUrl(#[source] oauth2::url::ParseError),

    /// Building the HTTP client failed.
    #[error("http client: {0}")]
    Http(#[source] reqwest::Error),

    /// Exchanging the refresh token failed.
    #[error("unable to exchange refresh token: {0}")]
    ExchangeRefreshToken(
        #[source]
        oauth2::RequestTokenError<
            oauth2::HttpClientError<reqwest::Error>,
            oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>,
        >,
    ),
}

/// A refreshable bearer token source.
///
/// Holds the refresh token and the last obtained access token; refreshes
/// through the token endpoint when the access token is missing or about to
/// expire. A rotated refresh token from the exchange response replaces the
/// stored one.
#[derive(Clone)]
pub struct TokenSource {
    inner: Arc<tokio::sync::Mutex<Inner>>,
}

struct Inner {
    /// The OAuth2 client for refreshing the token.
    oauth2_client: TokenClient,

    /// The HTTP client for refreshing the token.
    http_client: reqwest::Client,

    /// Scopes to request on refresh.
    scopes: Vec<String>,

    /// The long-lived refresh token.
    refresh_token: String,

    /// The last obtained access token.
    access_token: Option<String>,

    /// When the access token expires, when known.
    expires_at: Option<SystemTime>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource").finish_non_exhaustive()
    }
}

impl TokenSource {
    /// Create a token source for the given client settings and refresh token.
    pub fn new(params: OAuth2Params, refresh_token: String) -> Result<Self, TokenError> {
        let OAuth2Params {
            client_id,
            client_secret,
            token_url,
            scopes,
        } = params;

        let oauth2_client = oauth2::basic::BasicClient::new(oauth2::ClientId::new(client_id))
            .set_client_secret(oauth2::ClientSecret::new(client_secret))
            .set_token_uri(oauth2::TokenUrl::new(token_url).map_err(TokenError::TokenUrl)?);

        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(TokenError::Http)?;

        Ok(Self {
            inner: Arc::new(tokio::sync::Mutex::new(Inner {
                oauth2_client,
                http_client,
                scopes,
                refresh_token,
                access_token: None,
                expires_at: None,
            })),
        })
    }

    /// Get an up-to-date access token, refreshing when needed.
    pub async fn access_token(&self) -> Result<String, TokenError> {
        let mut inner = self.inner.lock().await;

        let cached = match (&inner.access_token, inner.expires_at) {
            (Some(token), Some(expires_at))
                if SystemTime::now() + EXPIRATION_IMMINENCE_TOLERANCE < expires_at =>
            {
                Some(token.clone())
            }
            (Some(token), None) => Some(token.clone()),
            _ => None,
        };
        if let Some(token) = cached {
            return Ok(token);
        }

        tracing::debug!("refreshing OAuth2 access token");

        let refresh_token = oauth2::RefreshToken::new(inner.refresh_token.clone());
        let mut request = inner.oauth2_client.exchange_refresh_token(&refresh_token);
        for scope in &inner.scopes {
            request = request.add_scope(oauth2::Scope::new(scope.clone()));
        }

        let res = request
            .request_async(&inner.http_client)
            .await
            .map_err(TokenError::ExchangeRefreshToken)?;

        let access_token = res.access_token().secret().clone();
        inner.access_token = Some(access_token.clone());
        inner.expires_at = res
            .expires_in()
            .map(|expires_in| SystemTime::now() + expires_in);
        if let Some(refresh_token) = res.refresh_token() {
            inner.refresh_token = refresh_token.secret().clone();
        }

        Ok(access_token)
    }
}
