use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::error::AnalysisError;
use crate::utils::http::get_http_client;

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: StatusCode,
    pub body: String,
}

/// One HTTP round trip. `Err` means the request never produced a status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(get_http_client().clone())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(ProviderResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_range: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(800),
            jitter_range: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter_range: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_range,
        }
    }

    /// Lower bound of the wait after the rate-limited attempt `attempt_index` (0-based).
    pub fn backoff_floor(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Floor plus a uniform jitter in `[0, jitter_range)`.
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        let floor = self.backoff_floor(attempt_index);
        let jitter_ms = self.jitter_range.as_millis() as u64;
        if jitter_ms == 0 {
            return floor;
        }
        let jitter = rand::thread_rng().gen_range(0..jitter_ms);
        floor.saturating_add(Duration::from_millis(jitter))
    }

    pub fn network_delay(&self) -> Duration {
        self.base_delay
    }
}

/// Removes a secret from text that may end up in logs or error messages.
pub fn redact_secret(text: &str, secret: &str) -> String {
    let secret = secret.trim();
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "[redacted]")
}

/// Sends `request`, retrying transport failures with a fixed delay and 429
/// responses with exponential backoff. Every other status is returned as is.
pub async fn send_with_retry(
    transport: &dyn Transport,
    request: &ProviderRequest,
    policy: &RetryPolicy,
    secret: &str,
) -> Result<ProviderResponse, AnalysisError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_network_error = None;

    for attempt_index in 0..max_attempts {
        let attempt = attempt_index + 1;
        let is_last = attempt == max_attempts;

        let response = match transport.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                let err_text = redact_secret(&format!("{err:#}"), secret);
                warn!(
                    "Gemini request failed to send: {} (attempt={}/{}, retrying={})",
                    err_text, attempt, max_attempts, !is_last
                );
                last_network_error = Some(err_text);
                if !is_last {
                    tokio::time::sleep(policy.network_delay()).await;
                }
                continue;
            }
        };

        if response.status != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        // A 429 after an earlier transport failure supersedes it.
        last_network_error = None;
        if is_last {
            warn!(
                "Gemini rate limited on final attempt {}/{}; giving up",
                attempt, max_attempts
            );
            break;
        }
        let delay = policy.backoff_delay(attempt_index);
        warn!(
            "Gemini rate limited (429), attempt {}/{}; backing off for {} ms",
            attempt,
            max_attempts,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }

    match last_network_error {
        Some(message) => Err(AnalysisError::Network {
            attempts: max_attempts,
            message,
        }),
        None => Err(AnalysisError::RateLimitExceeded {
            attempts: max_attempts,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    pub(crate) enum Step {
        Status(u16),
        Fail(&'static str),
    }

    /// Plays back a fixed list of outcomes; the last one repeats forever.
    pub(crate) struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        last: Mutex<Option<Step>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }

        fn outcome(step: &Step) -> Result<ProviderResponse> {
            match step {
                Step::Status(code) => Ok(ProviderResponse {
                    status: StatusCode::from_u16(*code).unwrap(),
                    body: "{}".to_string(),
                }),
                Step::Fail(message) => Err(anyhow!(*message)),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, _request: &ProviderRequest) -> Result<ProviderResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.steps.lock().pop_front();
            let mut last = self.last.lock();
            if let Some(step) = next {
                *last = Some(step);
            }
            let step = last.as_ref().expect("scripted transport needs at least one step");
            Self::outcome(step)
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            method: Method::POST,
            url: "http://localhost/models/test:generateContent".to_string(),
            headers: vec![],
            body: json!({}),
        }
    }

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_of_rate_limiting() {
        let transport = ScriptedTransport::new(vec![Step::Status(429)]);
        let result = send_with_retry(&transport, &request(), &instant_policy(3), "").await;
        assert_eq!(result.unwrap_err(), AnalysisError::RateLimitExceeded { attempts: 3 });
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_server_errors_without_retrying() {
        let transport = ScriptedTransport::new(vec![Step::Status(500), Step::Status(200)]);
        let response = send_with_retry(&transport, &request(), &instant_policy(3), "")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_when_rate_limit_clears() {
        let transport =
            ScriptedTransport::new(vec![Step::Status(429), Step::Status(429), Step::Status(200)]);
        let response = send_with_retry(&transport, &request(), &instant_policy(3), "")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_network_error_with_redacted_secret() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail("connection reset"),
            Step::Fail("dns failure for key=sekrit"),
        ]);
        let err = send_with_retry(&transport, &request(), &instant_policy(2), "sekrit")
            .await
            .unwrap_err();
        match err {
            AnalysisError::Network { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("dns failure"));
                assert!(!message.contains("sekrit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_transport_failures_then_succeeds() {
        let transport = ScriptedTransport::new(vec![Step::Fail("timeout"), Step::Status(200)]);
        let response = send_with_retry(&transport, &request(), &instant_policy(3), "")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn final_rate_limit_supersedes_earlier_network_error() {
        let transport =
            ScriptedTransport::new(vec![Step::Fail("connection reset"), Step::Status(429)]);
        let err = send_with_retry(&transport, &request(), &instant_policy(2), "")
            .await
            .unwrap_err();
        assert_eq!(err, AnalysisError::RateLimitExceeded { attempts: 2 });
    }

    #[tokio::test]
    async fn final_network_error_supersedes_earlier_rate_limit() {
        let transport =
            ScriptedTransport::new(vec![Step::Status(429), Step::Fail("connection reset")]);
        let err = send_with_retry(&transport, &request(), &instant_policy(2), "")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Network { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_wait_a_fixed_delay() {
        let transport = ScriptedTransport::new(vec![Step::Fail("timeout")]);
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::ZERO);

        let started = tokio::time::Instant::now();
        let err = send_with_retry(&transport, &request(), &policy, "")
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, AnalysisError::Network { attempts: 3, .. }));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_back_off_exponentially() {
        let transport = ScriptedTransport::new(vec![Step::Status(429)]);
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::ZERO);

        let started = tokio::time::Instant::now();
        let err = send_with_retry(&transport, &request(), &policy, "")
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, AnalysisError::RateLimitExceeded { attempts: 3 });
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[test]
    fn backoff_grows_and_stays_within_jitter_window() {
        let policy = RetryPolicy::new(
            6,
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        let mut previous_floor = Duration::ZERO;
        for attempt_index in 0..5 {
            let floor = policy.backoff_floor(attempt_index);
            assert_eq!(floor, Duration::from_millis(100 * 2u64.pow(attempt_index)));
            assert!(floor >= previous_floor);
            previous_floor = floor;

            for _ in 0..50 {
                let delay = policy.backoff_delay(attempt_index);
                assert!(delay >= floor);
                assert!(delay < floor + Duration::from_millis(50));
            }
        }
    }

    #[test]
    fn policy_never_allows_zero_attempts() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
    }
}
