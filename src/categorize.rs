use std::time::Duration;

use anyhow::Result;
use axum::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{money, CategoryRef, PredefinedCategory, Transaction};
use crate::provider;
use crate::store::SqliteStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

/// Bounds for one worker invocation. Runs with fewer than `min_batch`
/// pending transactions are skipped to keep classifier calls worthwhile.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub min_batch: usize,
    pub max_batch: usize,
}

/// Process-wide worker counters, reset on restart. Injected explicitly so
/// handlers never reach for mutable globals.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub batches: u64,
    pub classified: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub transaction_id: String,
    pub category: String,
}

#[derive(Debug)]
pub struct BatchReport {
    pub selected: usize,
    pub classified: usize,
    /// Present when the classifier was rate-limited; the batch stays
    /// pending and should be retried after this long.
    pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, batch: &[Transaction]) -> Result<Vec<Assignment>, provider::Error>;
}

/// One bounded categorization pass. Rate limiting is not a failure: no
/// transaction is marked attempted, the report simply carries the reset.
#[tracing::instrument(skip(store, classifier, stats))]
pub async fn run_batch<C: Classifier>(
    store: &mut SqliteStore,
    classifier: &C,
    opts: &BatchOptions,
    stats: &mut WorkerStats,
) -> Result<BatchReport> {
    let pending = store.txns().pending_batch(opts.max_batch).await?;
    let mut report = BatchReport {
        selected: pending.len(),
        classified: 0,
        retry_after: None,
    };

    if pending.len() < opts.min_batch {
        debug!(
            pending = pending.len(),
            min = opts.min_batch,
            "below minimum batch size, skipping run"
        );
        return Ok(report);
    }

    stats.batches += 1;

    let assignments = match classifier.classify(&pending).await {
        Ok(assignments) => assignments,
        Err(provider::Error::RateLimited { reset_in }) => {
            stats.rate_limited += 1;
            info!(reset_in = reset_in.as_secs(), "classifier rate limited, batch stays pending");
            report.retry_after = Some(reset_in);
            return Ok(report);
        }
        Err(e) => anyhow::bail!("classification request failed: {e}"),
    };

    for assignment in assignments {
        let predefined = match PredefinedCategory::parse(&assignment.category) {
            Some(predefined) => predefined,
            None => {
                warn!(
                    category = %assignment.category,
                    transaction = %assignment.transaction_id,
                    "classifier returned an unknown label, leaving transaction pending"
                );
                continue;
            }
        };

        match store
            .txns()
            .assign_category(
                &assignment.transaction_id,
                &CategoryRef::Predefined(predefined),
            )
            .await
        {
            Ok(()) => {
                report.classified += 1;
                stats.classified += 1;
            }
            Err(crate::store::Error::NotFound) => {
                warn!(transaction = %assignment.transaction_id, "classifier referenced an unknown transaction");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}

/// HTTP client for the external classification service.
#[derive(Clone)]
pub struct HttpClassifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    transactions: Vec<ClassifyEntry<'a>>,
}

#[derive(Serialize)]
struct ClassifyEntry<'a> {
    id: &'a str,
    payee: &'a str,
    amount: String,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    results: Vec<ClassifyResult>,
}

#[derive(Deserialize)]
struct ClassifyResult {
    transaction_id: String,
    category: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    reset: Option<u64>,
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, batch: &[Transaction]) -> Result<Vec<Assignment>, provider::Error> {
        let request = ClassifyRequest {
            transactions: batch
                .iter()
                .map(|txn| ClassifyEntry {
                    id: &txn.id,
                    payee: &txn.payee,
                    amount: money::from_miliunits(txn.amount_miliunits).to_string(),
                })
                .collect(),
        };

        let url = format!("{}/classify", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| provider::Error::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| provider::Error::Unavailable(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset = serde_json::from_str::<RateLimitBody>(&body)
                .ok()
                .and_then(|b| b.reset)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_RESET);

            return Err(provider::Error::RateLimited { reset_in: reset });
        }

        if !status.is_success() {
            return Err(provider::Error::Unavailable(format!(
                "classifier returned {status}"
            )));
        }

        let parsed: ClassifyResponse = serde_json::from_str(&body)
            .map_err(|_| provider::Error::Unavailable("malformed classifier payload".into()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| Assignment {
                transaction_id: r.transaction_id,
                category: r.category,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::core::NewTransaction;
    use crate::store::tests::TestStore;

    use super::*;

    struct StubClassifier {
        response: Result<Vec<Assignment>, provider::Error>,
    }

    #[async_trait]
    impl Classifier for StubClassifier {
        async fn classify(
            &self,
            _batch: &[Transaction],
        ) -> Result<Vec<Assignment>, provider::Error> {
            match &self.response {
                Ok(assignments) => Ok(assignments.clone()),
                Err(provider::Error::RateLimited { reset_in }) => {
                    Err(provider::Error::RateLimited { reset_in: *reset_in })
                }
                Err(provider::Error::Unavailable(m)) => {
                    Err(provider::Error::Unavailable(m.clone()))
                }
                Err(_) => unreachable!("stub only models transient errors"),
            }
        }
    }

    async fn seed_pending(store: &mut TestStore, n: usize) -> Vec<Transaction> {
        let account = store.new_account("user-1", "ext_1").await;
        let mut txns = Vec::with_capacity(n);
        for i in 0..n {
            let txn = store
                .db()
                .txns()
                .save(&NewTransaction {
                    account_id: account.id.clone(),
                    external_id: Some(format!("txn_{i}")),
                    amount_miliunits: -2_000,
                    payee: "Grocer".to_string(),
                    date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
                    notes: None,
                })
                .await
                .unwrap();
            txns.push(txn);
        }
        txns
    }

    #[tokio::test]
    async fn below_minimum_batch_is_skipped() {
        let mut store = TestStore::new().await;
        seed_pending(&mut store, 2).await;
        let classifier = StubClassifier {
            response: Err(provider::Error::Unavailable(
                "classifier must not be called".into(),
            )),
        };
        let mut stats = WorkerStats::default();

        let report = run_batch(
            store.db(),
            &classifier,
            &BatchOptions {
                min_batch: 5,
                max_batch: 50,
            },
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(report.selected, 2);
        assert_eq!(report.classified, 0);
        assert_eq!(stats.batches, 0);
    }

    #[tokio::test]
    async fn successful_batch_writes_back_categories() {
        let mut store = TestStore::new().await;
        let txns = seed_pending(&mut store, 3).await;
        let classifier = StubClassifier {
            response: Ok(vec![
                Assignment {
                    transaction_id: txns[0].id.clone(),
                    category: "GROCERIES".to_string(),
                },
                Assignment {
                    transaction_id: txns[1].id.clone(),
                    category: "groceries".to_string(),
                },
            ]),
        };
        let mut stats = WorkerStats::default();

        let report = run_batch(
            store.db(),
            &classifier,
            &BatchOptions {
                min_batch: 1,
                max_batch: 50,
            },
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(report.selected, 3);
        assert_eq!(report.classified, 2);
        assert_eq!(stats.classified, 2);
        assert_eq!(
            store
                .db()
                .txns()
                .pending_count(&txns[0].account_id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn rate_limit_leaves_every_transaction_pending() {
        let mut store = TestStore::new().await;
        let txns = seed_pending(&mut store, 4).await;
        let classifier = StubClassifier {
            response: Err(provider::Error::RateLimited {
                reset_in: Duration::from_secs(30),
            }),
        };
        let mut stats = WorkerStats::default();

        let report = run_batch(
            store.db(),
            &classifier,
            &BatchOptions {
                min_batch: 1,
                max_batch: 50,
            },
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(report.retry_after, Some(Duration::from_secs(30)));
        assert!(report.retry_after.unwrap() > Duration::ZERO);
        assert_eq!(report.classified, 0);
        assert_eq!(stats.rate_limited, 1);
        // Nothing was marked attempted or failed.
        assert_eq!(
            store
                .db()
                .txns()
                .pending_count(&txns[0].account_id)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn unknown_labels_leave_transactions_pending() {
        let mut store = TestStore::new().await;
        let txns = seed_pending(&mut store, 1).await;
        let classifier = StubClassifier {
            response: Ok(vec![Assignment {
                transaction_id: txns[0].id.clone(),
                category: "NOT_A_CATEGORY".to_string(),
            }]),
        };
        let mut stats = WorkerStats::default();

        let report = run_batch(
            store.db(),
            &classifier,
            &BatchOptions {
                min_batch: 1,
                max_batch: 50,
            },
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(report.classified, 0);
        assert_eq!(
            store
                .db()
                .txns()
                .pending_count(&txns[0].account_id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn max_batch_bounds_the_selection() {
        let mut store = TestStore::new().await;
        seed_pending(&mut store, 6).await;
        let classifier = StubClassifier {
            response: Ok(vec![]),
        };
        let mut stats = WorkerStats::default();

        let report = run_batch(
            store.db(),
            &classifier,
            &BatchOptions {
                min_batch: 1,
                max_batch: 4,
            },
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(report.selected, 4);
    }

    #[tokio::test]
    async fn http_classifier_surfaces_reset_contract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({"remaining": 0, "reset": 45})),
            )
            .mount(&server)
            .await;

        let classifier = HttpClassifier::new(server.uri(), "test-key");
        let err = classifier.classify(&[]).await.unwrap_err();

        match err {
            provider::Error::RateLimited { reset_in } => {
                assert_eq!(reset_in, Duration::from_secs(45))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_classifier_parses_assignments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"transaction_id": "t1", "category": "DINING"}]
            })))
            .mount(&server)
            .await;

        let classifier = HttpClassifier::new(server.uri(), "test-key");
        let assignments = classifier.classify(&[]).await.unwrap();

        assert_eq!(assignments.len(), 1);
        assert_eq!(&assignments[0].transaction_id, "t1");
        assert_eq!(&assignments[0].category, "DINING");
    }
}
