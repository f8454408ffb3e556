//! Retry wrapper around a provider.
//!
//! Rate limits and transient server errors back off exponentially; once the
//! budget is exhausted a rate-limit error surfaces as
//! [`Error::ProviderRateLimit`] so the branch terminates as ERRORED.

use std::time::Duration;

use tracing::warn;

use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

fn is_retryable(error: &Error) -> bool {
    match error {
        Error::ProviderRateLimit(_) => true,
        Error::ProviderError { status, .. } => *status >= 500,
        Error::Http(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

/// Provider decorator that retries transient failures.
pub struct RetryingProvider<P: LlmProvider> {
    inner: P,
    config: RetryConfig,
}

impl<P: LlmProvider> RetryingProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let mut delay = self.config.initial_delay;
        let mut attempt = 0u32;

        loop {
            match self.inner.chat(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ContentBlock, Message, StopReason, Usage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures: AtomicU32,
        calls: AtomicU32,
        error: Mutex<Option<fn() -> Error>>,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: fn() -> Error) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                error: Mutex::new(Some(error)),
            }
        }
    }

    impl LlmProvider for FlakyProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                let make = self.error.lock().unwrap().unwrap();
                return Err(make());
            }
            Ok(ChatResponse {
                content: vec![ContentBlock::Text { text: "ok".into() }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "m".into(),
                raw_blocks: None,
            })
        }

        fn model_name(&self) -> &str {
            "m"
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("", vec![Message::user("hi")])
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let provider = RetryingProvider::new(
            FlakyProvider::new(2, || Error::ProviderRateLimit("429".into())),
            fast_config(),
        );
        let response = provider.chat(request()).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_rate_limit() {
        let provider = RetryingProvider::new(
            FlakyProvider::new(10, || Error::ProviderRateLimit("429".into())),
            fast_config(),
        );
        let err = provider.chat(request()).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderRateLimit");
        // 1 initial + 3 retries
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn client_errors_do_not_retry() {
        let provider = RetryingProvider::new(
            FlakyProvider::new(10, || Error::ProviderError {
                status: 400,
                message: "bad request".into(),
            }),
            fast_config(),
        );
        let err = provider.chat(request()).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderError");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_retry() {
        let provider = RetryingProvider::new(
            FlakyProvider::new(1, || Error::ProviderError {
                status: 503,
                message: "overloaded".into(),
            }),
            fast_config(),
        );
        let response = provider.chat(request()).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 2);
    }
}
