//! Similarity scoring against the NLU service.
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use prometheus::Counter;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SimilarityError;
use crate::pipeline::similarity::SimilarityProvider;
use crate::util::retry::{RetryConfig, is_retryable_error, is_retryable_status};

#[derive(Debug, Serialize)]
struct SimilarityRequest<'a> {
    sentence: &'a str,
    candidates: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct SimilarityResponse {
    scores: Vec<f32>,
}

#[derive(Debug, Clone)]
pub(crate) struct NluClientConfig {
    pub(crate) base_url: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
    pub(crate) retry: RetryConfig,
}

impl From<&crate::config::Config> for NluClientConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            base_url: config.nlu_url().to_string(),
            connect_timeout: config.nlu_connect_timeout(),
            total_timeout: config.nlu_total_timeout(),
            retry: RetryConfig::new(
                config.nlu_max_retries().saturating_add(1),
                config.nlu_backoff_base_ms(),
                config.nlu_backoff_cap_ms(),
            ),
        }
    }
}

/// HTTP [`SimilarityProvider`] backed by the NLU service.
#[derive(Debug, Clone)]
pub(crate) struct NluSimilarityClient {
    client: Client,
    endpoint: Url,
    retry: RetryConfig,
    retries_total: Option<Counter>,
}

impl NluSimilarityClient {
    /// # Errors
    /// Fails when the base URL does not parse or the HTTP client cannot be built.
    pub(crate) fn new(config: NluClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build NLU HTTP client")?;

        let endpoint = similarity_endpoint(&config.base_url)?;

        Ok(Self {
            client,
            endpoint,
            retry: config.retry,
            retries_total: None,
        })
    }

    #[must_use]
    pub(crate) fn with_retry_counter(mut self, counter: Counter) -> Self {
        self.retries_total = Some(counter);
        self
    }

    async fn request_once(&self, body: &SimilarityRequest<'_>) -> Result<Vec<f32>, Attempt> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(body)
            .send()
            .await
            .map_err(|error| Attempt {
                retryable: is_retryable_error(&error),
                error: anyhow::Error::new(error).context("NLU similarity request failed"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(Attempt {
                retryable: is_retryable_status(status),
                error: anyhow!("NLU returned error status {status}: {error_body}"),
            });
        }

        let parsed: SimilarityResponse = response.json().await.map_err(|error| Attempt {
            retryable: false,
            error: anyhow::Error::new(error).context("failed to deserialize NLU similarity response"),
        })?;
        Ok(parsed.scores)
    }
}

/// `{base}/similarity`, keeping any path prefix on `base`.
fn similarity_endpoint(base_url: &str) -> anyhow::Result<Url> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .context("invalid NLU base URL")?
        .join("similarity")
        .context("failed to build NLU similarity URL")
}

struct Attempt {
    retryable: bool,
    error: anyhow::Error,
}

#[async_trait]
impl SimilarityProvider for NluSimilarityClient {
    async fn score(
        &self,
        sentence: &str,
        candidates: &[&str],
    ) -> Result<Vec<f32>, SimilarityError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let body = SimilarityRequest {
            sentence,
            candidates,
        };
        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            attempt += 1;

            match self.request_once(&body).await {
                Ok(scores) if scores.len() == candidates.len() => {
                    debug!(candidates = candidates.len(), attempt, "NLU similarity scored");
                    return Ok(scores);
                }
                Ok(scores) => {
                    return Err(SimilarityError::MalformedResponse {
                        expected: candidates.len(),
                        got: scores.len(),
                    });
                }
                Err(failure) if failure.retryable && self.retry.can_retry(attempt) => {
                    warn!(attempt, error = %failure.error, "retrying NLU similarity request");
                    if let Some(counter) = &self.retries_total {
                        counter.inc();
                    }
                }
                Err(failure) => return Err(SimilarityError::Unavailable(failure.error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String, max_attempts: usize) -> NluClientConfig {
        NluClientConfig {
            base_url,
            connect_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(5),
            retry: RetryConfig::new(max_attempts, 1, 5),
        }
    }

    #[tokio::test]
    async fn score_posts_sentence_and_candidates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/similarity"))
            .and(body_json(serde_json::json!({
                "sentence": "where is my parcel",
                "candidates": ["track parcel", "cancel order"]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "scores": [0.91, 0.12] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = NluSimilarityClient::new(test_config(server.uri(), 3)).expect("client builds");
        let scores = client
            .score("where is my parcel", &["track parcel", "cancel order"])
            .await
            .expect("score succeeds");

        assert_eq!(scores, vec![0.91, 0.12]);
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/similarity"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "scores": [0.5] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let base = format!("{}/api/v1", server.uri());
        let client = NluSimilarityClient::new(test_config(base, 1)).expect("client builds");
        let scores = client
            .score("where is my parcel", &["track parcel"])
            .await
            .expect("score succeeds");

        assert_eq!(scores, vec![0.5]);
    }

    #[test]
    fn similarity_endpoint_appends_segment() {
        for (base, expected) in [
            ("http://nlu:8080", "http://nlu:8080/similarity"),
            ("http://nlu:8080/", "http://nlu:8080/similarity"),
            ("http://nlu:8080/api/v1", "http://nlu:8080/api/v1/similarity"),
            ("http://nlu:8080/api/v1/", "http://nlu:8080/api/v1/similarity"),
        ] {
            assert_eq!(similarity_endpoint(base).expect("valid").as_str(), expected);
        }
        assert!(similarity_endpoint("not a url").is_err());
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported_unavailable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/similarity"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let counter = Counter::new("test_nlu_retries_total", "retries").expect("counter");
        let client = NluSimilarityClient::new(test_config(server.uri(), 3))
            .expect("client builds")
            .with_retry_counter(counter.clone());
        let error = client
            .score("hello", &["hi"])
            .await
            .expect_err("all attempts fail");

        assert!(matches!(error, SimilarityError::Unavailable(_)));
        assert!((counter.get() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/similarity"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let client = NluSimilarityClient::new(test_config(server.uri(), 3)).expect("client builds");
        let error = client.score("hello", &["hi"]).await.expect_err("400 fails");

        assert!(error.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn score_count_mismatch_is_malformed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/similarity"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "scores": [0.5] })),
            )
            .mount(&server)
            .await;

        let client = NluSimilarityClient::new(test_config(server.uri(), 1)).expect("client builds");
        let error = client
            .score("hello", &["hi", "hey"])
            .await
            .expect_err("mismatch fails");

        assert!(matches!(
            error,
            SimilarityError::MalformedResponse {
                expected: 2,
                got: 1
            }
        ));
    }

    #[tokio::test]
    async fn no_candidates_skips_the_request() {
        let client = NluSimilarityClient::new(test_config("http://127.0.0.1:9".to_string(), 1))
            .expect("client builds");
        assert!(client.score("hello", &[]).await.expect("empty").is_empty());
    }
}
