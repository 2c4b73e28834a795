//! Mock LLM provider for deterministic testing.
//!
//! Returns pre-configured responses without making any network calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::provider::*;
use relay_core::{InputItem, RelayError, Result};

/// A mock LLM provider that returns pre-configured responses.
///
/// # Example
/// ```
/// use relay_llm::mock::MockProvider;
/// let provider = MockProvider::new("test")
///     .with_response("Hello, world!");
/// ```
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    /// Track all requests received (for assertions in tests).
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
    name: String,
    models: Vec<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A structured upstream failure to return instead of a response.
#[derive(Clone, Debug, Default)]
pub struct MockError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub output: Vec<InputItem>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub last_call_usage: Option<Usage>,
    pub response_id: Option<String>,
    /// Sleep before answering.
    pub delay: Option<Duration>,
    /// If set, the provider will return this error instead.
    pub error: Option<MockError>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            output: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage::new(100, 50),
            last_call_usage: None,
            response_id: None,
            delay: None,
            error: None,
        }
    }
}

impl MockResponse {
    /// Create a text response.
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// Create an error response with only a message.
    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(MockError {
                message: msg.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create an error response with an HTTP status.
    pub fn http_error(status: u16, msg: &str) -> Self {
        Self {
            error: Some(MockError {
                status: Some(status),
                code: None,
                message: msg.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: Usage, last_call: Option<Usage>) -> Self {
        self.usage = usage;
        self.last_call_usage = last_call;
        self
    }
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(vec![])),
            name: name.into(),
            models: vec!["test-model".to_string()],
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(MockResponse::text(text));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push_back(MockResponse::error(error));
        self
    }

    /// Queue an error response carrying an HTTP status.
    pub fn with_http_error(self, status: u16, error: &str) -> Self {
        self.responses
            .lock()
            .push_back(MockResponse::http_error(status, error));
        self
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push_back(resp);
        self
    }

    /// Queue a response directly (for shared `Arc` access patterns).
    pub fn queue_response(&self, resp: MockResponse) {
        self.responses.lock().push_back(resp);
    }

    /// Get all requests that were made to this provider.
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Pop the next queued response, or return a default "no response queued" message.
    fn next_response(&self) -> MockResponse {
        self.responses.lock().pop_front().unwrap_or_else(|| MockResponse {
            text: "(mock: no more queued responses)".to_string(),
            ..Default::default()
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().push(request.clone());
        let mock = self.next_response();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = mock.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = mock.error {
            return Err(RelayError::Provider {
                provider: self.name.clone(),
                status: error.status,
                code: error.code,
                message: error.message,
            });
        }

        let mut output = mock.output;
        if !mock.text.is_empty() {
            output.push(InputItem::assistant(mock.text.clone()));
        }

        Ok(LlmResponse {
            output,
            text: mock.text,
            usage: mock.usage,
            last_call_usage: mock.last_call_usage,
            response_id: mock.response_id,
            stop_reason: mock.stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request() -> LlmRequest {
        LlmRequest {
            model: "test".into(),
            input: vec![InputItem::user("hello")],
            max_tokens: 100,
            temperature: 0.7,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_text_response() {
        let provider = MockProvider::new("mock").with_response("Hello!");
        let resp = provider.complete(&make_request()).await.unwrap();
        assert_eq!(resp.text, "Hello!");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.output.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_structured_error() {
        let provider = MockProvider::new("mock").with_http_error(429, "slow down");
        match provider.complete(&make_request()).await {
            Err(RelayError::Provider {
                provider, status, ..
            }) => {
                assert_eq!(provider, "mock");
                assert_eq!(status, Some(429));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let provider = MockProvider::new("mock").with_response("ok");
        let mut req = make_request();
        req.system = Some("be nice".into());
        let _ = provider.complete(&req).await;
        let recorded = provider.recorded_requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].system, Some("be nice".into()));
    }

    #[tokio::test]
    async fn test_mock_multiple_responses_in_order() {
        let provider = MockProvider::new("mock")
            .with_response("first")
            .with_response("second");
        let req = make_request();
        assert_eq!(provider.complete(&req).await.unwrap().text, "first");
        assert_eq!(provider.complete(&req).await.unwrap().text, "second");
        assert!(provider.complete(&req).await.unwrap().text.contains("no more"));
    }
}
