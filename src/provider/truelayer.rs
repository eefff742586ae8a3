use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{
    AccountSource, DateRange, Error, ProviderAccount, ProviderBalance, ProviderTransaction,
    TokenGrant, TokenSource, TransactionSource, TransactionsPage,
};

const DEFAULT_BASE_URL: &str = "https://api.truelayer.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// HTTP client for a TrueLayer-style aggregation API. All data calls are
/// bearer-token authenticated; responses are parsed into typed structs at
/// this boundary and malformed payloads are rejected as `Unavailable`.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    redirect_uri: String,
}

impl Client {
    pub fn new(credentials: Credentials, redirect_uri: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Override the API base URL, primarily for tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, Error> {
        let response = self
            .http
            .post(self.endpoint("/oauth/token"))
            .timeout(REQUEST_TIMEOUT)
            .form(params)
            .send()
            .await
            .map_err(transport_error)?;

        let grant: wire::TokenGrant = decode(response).await?;

        Ok(TokenGrant {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            connection_id: grant.connection_id,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(self.endpoint(path))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        decode(response).await
    }
}

#[async_trait]
impl TokenSource for Client {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, Error> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
            ("redirect_uri", &self.redirect_uri),
            ("code", code),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, Error> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

#[async_trait]
impl AccountSource for Client {
    async fn accounts(&self, access_token: &str) -> Result<Vec<ProviderAccount>, Error> {
        let body: wire::Results<wire::Account> = self.get(access_token, "/accounts", &[]).await?;

        Ok(body
            .results
            .into_iter()
            .map(|account| ProviderAccount {
                external_id: account.account_id,
                name: account.display_name,
                institution: account.provider.display_name,
                currency: account.currency,
            })
            .collect())
    }

    async fn balance(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<ProviderBalance, Error> {
        let path = format!("/accounts/{external_id}/balance");
        let body: wire::Results<wire::Balance> = self.get(access_token, &path, &[]).await?;

        let balance = body
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unavailable("provider returned no balance".into()))?;

        Ok(ProviderBalance {
            current: balance.current,
            available: balance.available,
            currency: balance.currency,
        })
    }
}

#[async_trait]
impl TransactionSource for Client {
    async fn transactions(
        &self,
        access_token: &str,
        external_id: &str,
        range: &DateRange,
        page: Option<&str>,
    ) -> Result<TransactionsPage, Error> {
        let mut query = vec![("to", range.to.format("%Y-%m-%d").to_string())];
        if let Some(from) = range.from {
            query.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(page) = page {
            query.push(("page", page.to_string()));
        }

        let path = format!("/accounts/{external_id}/transactions");
        let body: wire::TransactionsPage = self.get(access_token, &path, &query).await?;

        let mut results = Vec::with_capacity(body.results.len());
        for entry in body.results {
            results.push(ProviderTransaction {
                date: parse_transaction_date(&entry.timestamp)?,
                payee: entry.merchant_name.unwrap_or(entry.description),
                external_id: entry.transaction_id,
                amount: entry.amount,
            });
        }

        Ok(TransactionsPage {
            results,
            total_count: body.total_count,
            next_page: body.next_page,
        })
    }
}

fn parse_transaction_date(raw: &str) -> Result<NaiveDate, Error> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.naive_utc().date());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| Error::Unavailable(format!("unparseable transaction timestamp {raw:?}")))
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Unavailable("provider request timed out".into());
    }

    Error::Unavailable(err.to_string())
}

fn rate_limit_reset(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
    let status = response.status();
    let reset_in = rate_limit_reset(response.headers());
    let body = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|_| Error::Unavailable("malformed provider payload".into()));
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::TokenInvalid),
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            reset_in: reset_in.unwrap_or(DEFAULT_RATE_LIMIT_RESET),
        }),
        StatusCode::BAD_REQUEST => match serde_json::from_str::<wire::ErrorBody>(&body) {
            Ok(err) if err.error == "invalid_grant" => Err(Error::InvalidOrExpiredCode),
            Ok(err) => Err(Error::Unavailable(format!("provider rejected request: {}", err.error))),
            Err(_) => Err(Error::Unavailable(format!("provider returned {status}"))),
        },
        _ => Err(Error::Unavailable(format!("provider returned {status}"))),
    }
}

mod wire {
    use rust_decimal::Decimal;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Results<T> {
        pub results: Vec<T>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TokenGrant {
        pub access_token: String,
        #[serde(default)]
        pub refresh_token: Option<String>,
        #[serde(default)]
        pub expires_in: Option<i64>,
        pub connection_id: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct Account {
        pub account_id: String,
        pub display_name: String,
        pub provider: Provider,
        pub currency: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct Provider {
        pub display_name: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct Balance {
        pub current: Decimal,
        #[serde(default)]
        pub available: Option<Decimal>,
        pub currency: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct Transaction {
        pub transaction_id: String,
        pub description: String,
        #[serde(default)]
        pub merchant_name: Option<String>,
        pub amount: Decimal,
        pub timestamp: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct TransactionsPage {
        pub results: Vec<Transaction>,
        pub total_count: usize,
        #[serde(default)]
        pub next_page: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorBody {
        pub error: String,
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_client(server: &MockServer) -> Client {
        Client::new(
            Credentials {
                client_id: "client-id".into(),
                client_secret: "client-secret".into(),
            },
            "http://localhost/callback",
        )
        .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn exchanges_authorization_code_for_token_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok_x",
                "refresh_token": "refresh_x",
                "expires_in": 3600,
                "connection_id": "conn_1"
            })))
            .mount(&server)
            .await;

        let grant = test_client(&server).exchange_code("abc123").await.unwrap();

        assert_eq!(grant.access_token, "tok_x");
        assert_eq!(grant.connection_id, "conn_1");
        assert_eq!(grant.refresh_token.as_deref(), Some("refresh_x"));
        assert!(grant.expires_at.is_some());
    }

    #[tokio::test]
    async fn consumed_code_maps_to_invalid_or_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let err = test_client(&server).exchange_code("abc123").await.unwrap_err();

        assert!(matches!(err, Error::InvalidOrExpiredCode));
    }

    #[tokio::test]
    async fn revoked_token_requires_reconnection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = test_client(&server).accounts("tok_dead").await.unwrap_err();

        assert!(matches!(err, Error::TokenInvalid));
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = test_client(&server).accounts("tok_x").await.unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn rate_limit_carries_reset_from_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let err = test_client(&server).accounts("tok_x").await.unwrap_err();

        match err {
            Error::RateLimited { reset_in } => assert_eq!(reset_in, Duration::from_secs(30)),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transactions_request_is_range_and_page_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/ext_1/transactions"))
            .and(query_param("from", "2026-01-01"))
            .and(query_param("to", "2026-02-01"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{
                    "transaction_id": "txn_9",
                    "description": "COFFEE SHOP",
                    "merchant_name": "Coffee Shop",
                    "amount": -4.50,
                    "timestamp": "2026-01-15T09:30:00Z"
                }],
                "total_count": 41,
                "next_page": "3"
            })))
            .mount(&server)
            .await;

        let range = DateRange {
            from: Some(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()),
            to: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
        };
        let page = test_client(&server)
            .transactions("tok_x", "ext_1", &range, Some("2"))
            .await
            .unwrap();

        assert_eq!(page.total_count, 41);
        assert_eq!(page.next_page.as_deref(), Some("3"));
        assert_eq!(page.results.len(), 1);
        let txn = &page.results[0];
        assert_eq!(txn.external_id, "txn_9");
        assert_eq!(txn.payee, "Coffee Shop");
        assert_eq!(txn.date, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
    }
}
