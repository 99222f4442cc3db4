use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError};

/// Scripted client for tests. Responses come back in FIFO order and every
/// request is captured so tests can assert on prompt content.
#[derive(Debug, Default, Clone)]
pub struct MockLLMClient {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LLMError>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<CompletionResponse, LLMError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    /// Convenience for the common case of enqueueing a plain text reply.
    pub fn enqueue_text(&self, content: &str) {
        self.enqueue_response(Ok(CompletionResponse {
            content: content.to_string(),
            model: "mock".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
        }));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("lock requests").len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.requests.lock().expect("lock requests").push(request);
        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            Err(LLMError::ProviderError(
                "mock response not provided".to_string(),
            ))
        })
    }
}
