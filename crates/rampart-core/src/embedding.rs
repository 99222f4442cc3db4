use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("embedding service returned no vector")]
    MissingVector,
    #[error("embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

/// Async interface over an embedding service. Vectors from a single client
/// are always the same model and dimensionality, which is what makes the
/// stored cosine comparisons meaningful.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn model(&self) -> &str;
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint. Works against
/// hosted providers and local servers alike; an empty api key skips the
/// Authorization header for servers that do not check one.
pub struct HttpEmbeddingClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    expected_dimensions: usize,
}

impl HttpEmbeddingClient {
    pub fn new(http: Client, config: &EmbeddingConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            expected_dimensions: config.dimensions as usize,
        }
    }

    /// Build with a fresh connection pool. Use [`Self::new`] to share one.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(Client::new(), config)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self.http.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": [text],
        }));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let decoded: EmbeddingResponse = serde_json::from_str(&body)?;

        let vector = decoded
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(EmbeddingError::MissingVector)?;

        if vector.len() != self.expected_dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                got: vector.len(),
                expected: self.expected_dimensions,
            });
        }

        Ok(vector)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Scripted embedding client for tests, same queue discipline as
/// [`crate::llm::MockLLMClient`].
#[derive(Debug, Default, Clone)]
pub struct MockEmbeddingClient {
    responses: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Vec<f32>>>>,
    inputs: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockEmbeddingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_vector(&self, vector: Vec<f32>) {
        self.responses.lock().expect("lock responses").push_back(vector);
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().expect("lock inputs").clone()
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inputs.lock().expect("lock inputs").push(text.to_string());
        self.responses
            .lock()
            .expect("lock responses")
            .pop_front()
            .ok_or(EmbeddingError::MissingVector)
    }

    fn model(&self) -> &str {
        "mock-embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer, api_key: &str, dimensions: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            endpoint: format!("{}/v1/embeddings", server.uri()),
            api_key: api_key.into(),
            model: "nomic-embed-text".into(),
            dimensions,
        }
    }

    #[tokio::test]
    async fn posts_model_and_input_and_parses_vector() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "nomic-embed-text",
                "input": ["avoid force pushes"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(Client::new(), &test_config(&server, "sk-test", 3));
        let vector = client.embed("avoid force pushes").await.expect("embed");
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        assert_eq!(client.model(), "nomic-embed-text");
    }

    #[tokio::test]
    async fn rejects_vector_with_wrong_dimensions() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.5, 0.5]}],
            })))
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(Client::new(), &test_config(&server, "", 3));
        let err = client.embed("anything").await.expect_err("should fail");
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { got: 2, expected: 3 }
        ));
    }

    #[tokio::test]
    async fn empty_data_is_missing_vector() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})),
            )
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(Client::new(), &test_config(&server, "", 3));
        let err = client.embed("anything").await.expect_err("should fail");
        assert!(matches!(err, EmbeddingError::MissingVector));
    }

    #[tokio::test]
    async fn server_error_surfaces_as_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(Client::new(), &test_config(&server, "", 3));
        let err = client.embed("anything").await.expect_err("should fail");
        assert!(matches!(err, EmbeddingError::Http(_)));
    }

    #[tokio::test]
    async fn mock_client_replays_queue_and_records_inputs() {
        let mock = MockEmbeddingClient::new();
        mock.enqueue_vector(vec![1.0, 0.0]);

        let vector = mock.embed("first").await.expect("vector");
        assert_eq!(vector, vec![1.0, 0.0]);
        assert!(mock.embed("second").await.is_err());
        assert_eq!(mock.inputs(), vec!["first", "second"]);
    }
}
