//! JSON-over-HTTP transport with retry/backoff for the inventory service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Only requests that can be replayed safely are retried.
pub fn is_idempotent(method: &Method) -> bool {
    [Method::GET, Method::PUT, Method::DELETE, Method::HEAD].contains(method)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("hostsync/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut backoff = defaults.backoff;
        if let Some(retries) = std::env::var("HOSTSYNC_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            backoff.max_retries = retries;
        }
        Self {
            base_url: std::env::var("HOSTSYNC_SERVER").unwrap_or(defaults.base_url),
            username: std::env::var("HOSTSYNC_USERNAME").ok(),
            password: std::env::var("HOSTSYNC_PASSWORD").ok(),
            timeout: std::env::var("HOSTSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff,
            ..defaults
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {method} {url}: {body}")]
    HttpStatus {
        status: u16,
        method: String,
        url: String,
        body: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Authenticated JSON client bound to one server.
#[derive(Debug)]
pub struct JsonClient {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl JsonClient {
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, TransportError> {
        self.request::<JsonValue>(Method::GET, path, query, None).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<JsonValue, TransportError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<JsonValue, TransportError> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<JsonValue, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let span = info_span!("http_request", method = %method, url = %url);
        self.send_with_retries(method, &url, query, body)
            .instrument(span)
            .await
    }

    async fn send_with_retries<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<JsonValue, TransportError> {
        // A closed semaphore only happens on drop; proceed unthrottled in that case.
        let _permit = self.limit.acquire().await.ok();
        let max_retries = if is_idempotent(&method) {
            self.backoff.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let mut request = self.client.request(method.clone(), url).query(query);
            if let Some(username) = &self.username {
                request = request.basic_auth(username, self.password.as_ref());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return decode_body(url, &bytes);
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(status = status.as_u16(), attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        method: method.to_string(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(error = %err, attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }
    }
}

fn decode_body(url: &str, bytes: &[u8]) -> Result<JsonValue, TransportError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(bytes).map_err(|source| TransportError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> JsonClient {
        JsonClient::new(TransportConfig {
            base_url: format!("{}/", server.uri()),
            username: Some("admin".into()),
            password: Some("changeme".into()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert!(is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
    }

    #[tokio::test]
    async fn get_sends_auth_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/hosts"))
            .and(query_param("per_page", "20"))
            .and(basic_auth("admin", "changeme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let value = client_for(&server)
            .get("/api/hosts", &[("per_page", "20".to_string())])
            .await
            .expect("get");
        assert_eq!(value["total"], json!(3));
    }

    #[tokio::test]
    async fn retryable_status_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/organizations"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .expect(1)
            .mount(&server)
            .await;

        let value = client_for(&server)
            .get("/api/organizations", &[])
            .await
            .expect("get after retry");
        assert_eq!(value["results"], json!([]));
    }

    #[tokio::test]
    async fn post_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/katello/api/host_subscriptions"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .post("/katello/api/host_subscriptions", &json!({"name": "h1"}))
            .await
            .expect_err("post fails");
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[tokio::test]
    async fn empty_body_decodes_as_null() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/katello/api/hosts/1/subscriptions/add_subscriptions"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let value = client_for(&server)
            .put("/katello/api/hosts/1/subscriptions/add_subscriptions", &json!({}))
            .await
            .expect("put");
        assert_eq!(value, JsonValue::Null);
    }
}
