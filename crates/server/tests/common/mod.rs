//! Common test utilities for API testing with mocks.
//!
//! Builds an in-process router over the core testing mocks so requests can
//! be driven with `oneshot` without a listener or real storage.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use imgpress_core::testing::{MockEncoder, MockMetadataStore, MockObjectStore};
use imgpress_core::{
    Config, ConversionService, Converter, ConverterConfig, MetadataStore, ProgressTracker,
};
use imgpress_server::state::AppState;

/// Re-export fixtures for test convenience
pub use imgpress_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Shared with the converter; seed objects and inspect results here
    pub store: MockObjectStore,
    pub metadata: Arc<MockMetadataStore>,
    pub state: Arc<AppState<MockObjectStore, MockEncoder>>,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a fixture with a started converter and a fast mock encoder.
    pub async fn new() -> Self {
        Self::with_encoder(MockEncoder::new()).await
    }

    /// Create a fixture whose converter uses `encoder`.
    pub async fn with_encoder(encoder: MockEncoder) -> Self {
        let converter_config = ConverterConfig::default().with_workers(2);
        let config = Config {
            converter: converter_config.clone(),
            ..Default::default()
        };

        let store = MockObjectStore::new();
        let metadata = Arc::new(MockMetadataStore::new());
        let progress = ProgressTracker::new(converter_config.progress_queue_capacity);

        let converter = Arc::new(
            Converter::new(converter_config, store.clone(), encoder)
                .with_progress(progress.clone()),
        );
        converter.start();

        let service = Arc::new(ConversionService::new(
            converter,
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        ));
        let state = Arc::new(AppState::new(config, service, progress));
        let router = imgpress_server::api::create_router(Arc::clone(&state));

        Self {
            router,
            store,
            metadata,
            state,
        }
    }

    /// Put each path into the store with distinct image bytes.
    pub async fn seed(&self, paths: &[&str]) {
        for (i, path) in paths.iter().enumerate() {
            self.store
                .insert(path, fixtures::image_bytes(1_000 + i * 10))
                .await;
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a GET request and return the raw body text.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        (status, String::from_utf8_lossy(&body_bytes).into_owned())
    }

    /// Poll the status endpoint until the last job has finished.
    pub async fn wait_for_job(&self) -> Value {
        for _ in 0..200 {
            let response = self.get("/api/v1/images/convert/status").await;
            let job = &response.body["last_job"];
            if !job.is_null() && !job["finished_at"].is_null() {
                return job.clone();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Conversion job did not finish in time");
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}
