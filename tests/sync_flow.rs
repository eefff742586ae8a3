use std::sync::Arc;

use hyper::{Body, Client, Method, Request};
use tokio::sync::Mutex;
use ulid::Ulid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bursar::core::Account;
use bursar::provider::truelayer;
use bursar::server::{router, Context};
use bursar::store::SqliteStore;
use bursar::sync::Engine;

async fn mount_provider(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("code=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok_x",
            "refresh_token": "refresh_x",
            "expires_in": 3600,
            "connection_id": "conn_1"
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;

    // The authorization code is single-use.
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                {
                    "account_id": "ext_1",
                    "display_name": "Everyday Checking",
                    "provider": {"display_name": "First Bank"},
                    "currency": "GBP"
                },
                {
                    "account_id": "ext_2",
                    "display_name": "Holiday Saver",
                    "provider": {"display_name": "First Bank"},
                    "currency": "GBP"
                }
            ]
        })))
        .mount(server)
        .await;

    for (account, current) in [("ext_1", 1000.25), ("ext_2", 420.0)] {
        Mock::given(method("GET"))
            .and(path(format!("/accounts/{account}/balance")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"current": current, "available": current, "currency": "GBP"}]
            })))
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/accounts/ext_1/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                {
                    "transaction_id": "txn_1",
                    "description": "CARD PAYMENT",
                    "merchant_name": "Grocer",
                    "amount": -12.34,
                    "timestamp": "2026-04-02T12:00:00Z"
                },
                {
                    "transaction_id": "txn_2",
                    "description": "SALARY",
                    "amount": 2500.0,
                    "timestamp": "2026-04-01T09:00:00Z"
                }
            ],
            "total_count": 2
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/accounts/ext_2/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{
                "transaction_id": "txn_3",
                "description": "TRANSFER IN",
                "amount": 100.0,
                "timestamp": "2026-04-03T08:00:00Z"
            }],
            "total_count": 1
        })))
        .mount(server)
        .await;
}

async fn start_api(provider: &MockServer) -> std::net::SocketAddr {
    let mut store = SqliteStore::new("sqlite::memory:").await.unwrap();

    // ext_2 is already tracked locally under a stale display name.
    store
        .accounts()
        .upsert(&Account {
            id: Ulid::new().to_string(),
            user_id: "user-1".to_string(),
            external_id: "ext_2".to_string(),
            name: "Old Saver".to_string(),
            institution: "First Bank".to_string(),
            currency: "GBP".to_string(),
            last_synced_at: None,
        })
        .await
        .unwrap();

    let client = truelayer::Client::new(
        truelayer::Credentials {
            client_id: "client-id".into(),
            client_secret: "client-secret".into(),
        },
        "http://localhost/callback",
    )
    .with_base_url(provider.uri());

    let ctx = Arc::new(Context {
        store: Mutex::new(store),
        engine: Engine::new(client),
    });

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], 0));
    let server = axum::Server::bind(&addr).serve(router(ctx).into_make_service());
    let addr = server.local_addr();

    tokio::spawn(async move {
        server.await.unwrap();
    });

    addr
}

async fn request_json(
    client: &Client<hyper::client::HttpConnector>,
    method: Method,
    uri: String,
    user: &str,
    body: Option<serde_json::Value>,
) -> (hyper::StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", user);

    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = client.request(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, json)
}

#[tokio::test]
async fn exchange_then_sync_reconciles_accounts_and_transactions() {
    let provider = MockServer::start().await;
    mount_provider(&provider).await;
    let addr = start_api(&provider).await;
    let client = Client::new();

    // First exchange of the one-time code succeeds.
    let (status, body) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/exchange-token"),
        "user-1",
        Some(serde_json::json!({"code": "abc123"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["access_token"], "tok_x");
    assert_eq!(body["connection_id"], "conn_1");

    // The callback fired a second time; the code is consumed, but the
    // user already holds the connection so the retry is benign.
    let (status, body) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/exchange-token"),
        "user-1",
        Some(serde_json::json!({"code": "abc123"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["connection_id"], "conn_1");

    // A different user replaying the code has nothing to fall back on.
    let (status, body) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/exchange-token"),
        "user-2",
        Some(serde_json::json!({"code": "abc123"})),
    )
    .await;
    assert_eq!(status, 409);
    assert!(body["error"].as_str().unwrap().contains("authorization code"));

    // Sync: ext_1 is created, ext_2 reconciled onto the existing row.
    let (status, body) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/sync"),
        "user-1",
        Some(serde_json::json!({
            "access_token": "tok_x",
            "connection_id": "conn_1"
        })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["accounts_synced"], 2);
    assert_eq!(body["transactions_ingested"], 3);
    assert_eq!(body["errors"].as_array().unwrap().len(), 0);

    // Everything ingested awaits categorization, grouped per account with
    // no duplicate account rows.
    let (status, body) = request_json(
        &client,
        Method::GET,
        format!("http://{addr}/accounts/pending-categorization"),
        "user-1",
        None,
    )
    .await;
    assert_eq!(status, 200);
    let pending = body["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 2);
    let mut counts: Vec<i64> = pending
        .iter()
        .map(|entry| entry["pendingCount"].as_i64().unwrap())
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2]);

    // Running the same sync again ingests nothing new.
    let (status, body) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/sync"),
        "user-1",
        Some(serde_json::json!({
            "access_token": "tok_x",
            "connection_id": "conn_1",
            "force": true
        })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["transactions_ingested"], 0);
}

#[tokio::test]
async fn requests_without_identity_are_rejected() {
    let provider = MockServer::start().await;
    let addr = start_api(&provider).await;
    let client = Client::new();

    let response = client
        .request(
            Request::builder()
                .method(Method::GET)
                .uri(format!("http://{addr}/accounts/pending-categorization"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn syncing_an_unknown_connection_is_not_found() {
    let provider = MockServer::start().await;
    let addr = start_api(&provider).await;
    let client = Client::new();

    let (status, _) = request_json(
        &client,
        Method::POST,
        format!("http://{addr}/sync"),
        "user-1",
        Some(serde_json::json!({
            "access_token": "tok_x",
            "connection_id": "conn_missing"
        })),
    )
    .await;

    assert_eq!(status, 404);
}
