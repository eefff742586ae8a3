//! Embedded link flow for connecting a bank through an OAuth-style
//! aggregation provider: `/link` hands the browser to the provider's
//! authorization page, `/callback` receives the one-time code and trades
//! it for tokens through a caller-supplied [`TokenExchanger`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{Extension, FromRequest, RequestParts},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use url::Url;

lazy_static! {
    // Url cannot parse the bare path axum's uri() exposes; anchor it to a
    // placeholder base. __Do not depend on the host, scheme, or any non
    // path part of a Url constructed with this base.__
    static ref BASE_URL: Url = {
        Url::parse("http://localhost").unwrap()
    };
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("unable to parse argument")]
    ParseError(#[from] serde_json::Error),
    #[error("failed to decode base64 argument")]
    DecodeError(#[from] base64::DecodeError),
    #[error("authorization code exchange failed")]
    ExchangeError(#[source] anyhow::Error),
    #[error("invalid string source")]
    BadRequest(#[from] std::string::FromUtf8Error),
}

impl IntoResponse for LinkError {
    fn into_response(self) -> Response {
        match self {
            LinkError::InvalidArgument(s) => (StatusCode::BAD_REQUEST, Html(s)),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("something really bad happened".into()),
            ),
        }
        .into_response()
    }
}

/// Token pair produced by exchanging an authorization code.
#[derive(Debug, Clone)]
pub struct Grant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub connection_id: String,
}

/// Performs the authorization-code exchange against the provider.
#[async_trait]
pub trait TokenExchanger: Send + Sync + 'static {
    async fn exchange(&self, code: &str) -> anyhow::Result<Grant>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum LinkMode {
    Connect,
    Reconnect(String),
}

#[async_trait]
impl<B> FromRequest<B> for LinkMode
where
    B: Send,
{
    type Rejection = LinkError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let url = Url::options()
            .base_url(Some(&BASE_URL))
            .parse(&req.uri().to_string())
            .map_err(|_| LinkError::InvalidArgument("invalid uri".into()))?;

        let mode = url
            .query_pairs()
            .find(|(key, value)| matches!((key.as_ref(), value), ("mode", _)));

        let id = url
            .query_pairs()
            .find(|(key, value)| matches!((key.as_ref(), value), ("connection", _)));

        match mode {
            Some((k, v)) => match (k.as_ref(), v.as_ref()) {
                ("mode", "connect") => Ok(LinkMode::Connect),
                ("mode", "reconnect") => match id {
                    Some(i) => Ok(LinkMode::Reconnect(i.1.to_string())),
                    None => Err(LinkError::InvalidArgument(
                        "reconnect mode must include connection".into(),
                    )),
                },
                ("mode", _) => Err(LinkError::InvalidArgument(
                    "unsupported mode argument".into(),
                )),
                _ => Ok(LinkMode::Connect),
            },
            None => Ok(LinkMode::Connect),
        }
    }
}

/// State can be used to curry data during the link flow lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    /// A system-specific user ID for which the credentials are being created.
    pub user_id: String,
    /// Arbitrary key value pairs containing metadata about the exchange request.
    pub context: Option<HashMap<String, String>>,
}

impl State {
    pub fn to_opaque(self) -> Result<String, serde_json::Error> {
        Ok(base64::encode_config(
            serde_json::to_string(&self)?.as_bytes(),
            base64::URL_SAFE,
        ))
    }
}

#[async_trait]
impl<B> FromRequest<B> for State
where
    B: Send,
{
    type Rejection = LinkError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let url = Url::options()
            .base_url(Some(&BASE_URL))
            .parse(&req.uri().to_string())
            .map_err(|_| LinkError::InvalidArgument("invalid_uri".into()))?;

        let state = url
            .query_pairs()
            .find(|(key, value)| matches!((key.as_ref(), value), ("state", _)));

        match state {
            Some((_, token)) => Ok(serde_json::from_str(&String::from_utf8(
                base64::decode_config(token.as_bytes(), base64::URL_SAFE)?,
            )?)?),
            None => Ok(Self {
                user_id: "".to_string(),
                context: None,
            }),
        }
    }
}

/// The one-time authorization code delivered to the redirect callback.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthorizationCode(pub String);

#[async_trait]
impl<B> FromRequest<B> for AuthorizationCode
where
    B: Send,
{
    type Rejection = LinkError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let url = Url::options()
            .base_url(Some(&BASE_URL))
            .parse(&req.uri().to_string())
            .map_err(|_| LinkError::InvalidArgument("invalid uri".into()))?;

        if let Some((_, reason)) = url
            .query_pairs()
            .find(|(key, value)| matches!((key.as_ref(), value), ("error", _)))
        {
            return Err(LinkError::InvalidArgument(format!(
                "authorization denied: {reason}"
            )));
        }

        match url
            .query_pairs()
            .find(|(key, value)| matches!((key.as_ref(), value), ("code", _)))
        {
            Some((_, code)) if !code.is_empty() => Ok(AuthorizationCode(code.to_string())),
            _ => Err(LinkError::InvalidArgument(
                "callback must include a code".into(),
            )),
        }
    }
}

/// Tokens are the credentials produced by a completed link flow.
#[derive(Debug, Clone)]
pub struct Token {
    /// The provider's identifier for the new connection.
    pub connection_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    /// Link-flow state context.
    pub state: State,
}

/// Provider-facing parameters for building the authorization redirect.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub authorize_url: Url,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
}

pub struct LinkServer<E: TokenExchanger> {
    pub exchanger: E,
    pub config: LinkConfig,
    pub link_channel: broadcast::Sender<Token>,
    pub listener: broadcast::Receiver<Token>,
}

impl<E: TokenExchanger> LinkServer<E> {
    pub fn new(exchanger: E, config: LinkConfig) -> Self {
        let (tx, rx) = broadcast::channel(1);

        Self {
            exchanger,
            config,
            link_channel: tx,
            listener: rx,
        }
    }

    pub fn on_exchange(&self) -> broadcast::Receiver<Token> {
        self.link_channel.subscribe()
    }

    pub fn start(self) -> Router {
        let exchanger: Arc<dyn TokenExchanger> = Arc::new(self.exchanger);

        Router::new()
            .route("/link", get(initialize_link))
            .route("/callback", get(exchange_callback))
            .layer(Extension(Arc::new(self.config)))
            .layer(Extension(exchanger))
            .layer(Extension(self.link_channel))
    }
}

async fn initialize_link(
    mode: LinkMode,
    state: State,
    config: Extension<Arc<LinkConfig>>,
) -> Result<Redirect, LinkError> {
    let mut url = config.authorize_url.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("scope", &config.scope)
        .append_pair("state", &state.to_opaque()?);

    if let LinkMode::Reconnect(connection_id) = &mode {
        url.query_pairs_mut()
            .append_pair("connection_id", connection_id);
    }

    Ok(Redirect::to(url.as_str()))
}

async fn exchange_callback(
    code: AuthorizationCode,
    state: State,
    exchanger: Extension<Arc<dyn TokenExchanger>>,
    on_exchange: Extension<broadcast::Sender<Token>>,
) -> Result<Html<&'static str>, LinkError> {
    let grant = exchanger
        .exchange(&code.0)
        .await
        .map_err(LinkError::ExchangeError)?;

    on_exchange
        .send(Token {
            connection_id: grant.connection_id,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in: grant.expires_in,
            state,
        })
        .map_err(|_| LinkError::InvalidArgument("no active link listener".into()))?;

    Ok(Html("Connected. You can close this window."))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::RequestParts;

    fn request_parts_from_uri(uri: &str) -> RequestParts<()> {
        RequestParts::new(
            axum::http::Request::builder()
                .uri(uri)
                .body(())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn extract_mode_from_query() {
        let tests = vec![
            ("http://localhost:4000/link", LinkMode::Connect),
            ("http://localhost:4000/link?mode=connect", LinkMode::Connect),
            (
                "http://localhost:4000/link?mode=connect&connection=foobar",
                LinkMode::Connect,
            ),
            (
                "http://localhost:4000/link?mode=reconnect&connection=foobar",
                LinkMode::Reconnect("foobar".to_string()),
            ),
        ];

        for t in tests {
            let mut req = request_parts_from_uri(t.0);
            assert_eq!(LinkMode::from_request(&mut req).await.unwrap(), t.1)
        }
    }

    #[tokio::test]
    async fn extract_mode_from_query_rejects_invalid_params() {
        let tests = vec![
            (
                "http://localhost:4000/link?mode=invalid",
                LinkError::InvalidArgument("unsupported mode argument".into()),
            ),
            (
                "http://localhost:4000/link?mode=reconnect",
                LinkError::InvalidArgument("reconnect mode must include connection".into()),
            ),
        ];

        for t in tests {
            let mut req = request_parts_from_uri(t.0);
            assert_eq!(
                LinkMode::from_request(&mut req)
                    .await
                    .unwrap_err()
                    .to_string(),
                t.1.to_string()
            )
        }
    }

    #[tokio::test]
    async fn extract_state_from_query_param() {
        let state = State {
            user_id: "foobar@tester.com".to_string(),
            context: None,
        };

        let mut req = request_parts_from_uri(&format!(
            "http://localhost:4000/link?state={}",
            state.clone().to_opaque().unwrap()
        ));
        assert_eq!(State::from_request(&mut req).await.unwrap(), state)
    }

    #[tokio::test]
    async fn link_without_state_params_provides_default() {
        let state = State {
            user_id: "".to_string(),
            context: None,
        };

        let mut req = request_parts_from_uri("http://localhost:4000/link");
        assert_eq!(State::from_request(&mut req).await.unwrap(), state)
    }

    #[tokio::test]
    async fn extract_code_from_callback_query() {
        let mut req = request_parts_from_uri("http://localhost:4000/callback?code=one-time-code");
        assert_eq!(
            AuthorizationCode::from_request(&mut req).await.unwrap(),
            AuthorizationCode("one-time-code".to_string())
        );
    }

    #[tokio::test]
    async fn denied_authorization_is_rejected() {
        let mut req =
            request_parts_from_uri("http://localhost:4000/callback?error=access_denied");
        let err = AuthorizationCode::from_request(&mut req).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "authorization denied: access_denied"
        );
    }

    #[tokio::test]
    async fn callback_without_code_is_rejected() {
        let mut req = request_parts_from_uri("http://localhost:4000/callback");
        assert!(AuthorizationCode::from_request(&mut req).await.is_err());
    }
}
