//! JSON client for the backend test manager (`/testmanager`) and test runner
//! (`/testrunner`) services.

mod model;

pub use model::{
    BiometricType, CreateRunRequest, MasterData, TestCase, TestFilter, TestReport, TestRun, UiInput,
};

use async_trait::async_trait;
use mdstest_core::{ComposedRequest, ValidationReport};
use model::{ComposeRequestBody, ComposeRequestResponse, RunCreated, ValidateResponseBody};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const RESULT_VERBOSITY: &str = "Detailed";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend returned status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("unexpected backend response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("invalid backend url: {0}")]
    Url(String),
    #[error("http client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

/// Backend operations the run executor depends on.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Build the protocol request for one test case against a device descriptor.
    async fn compose_request(
        &self,
        run_id: &str,
        test_id: &str,
        device_info: &Value,
    ) -> Result<ComposedRequest, BackendError>;

    /// Judge the device response to a composed request.
    async fn validate_response(
        &self,
        run_id: &str,
        test_id: &str,
        request: &ComposedRequest,
        response: &str,
    ) -> Result<ValidationReport, BackendError>;
}

/// Turns a raw INFO payload into a decoded device descriptor.
#[async_trait]
pub trait DeviceInfoDecoder: Send + Sync {
    async fn decode_device_info(&self, raw: &Value) -> Result<Value, BackendError>;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base: Url,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, BackendError> {
        let base = Url::parse(base_url).map_err(|e| BackendError::Url(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Url(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(format!("mdstest/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BackendError::Client)?;
        Ok(BackendClient { client, base })
    }

    pub async fn master_data(&self) -> Result<MasterData, BackendError> {
        self.call(Method::GET, &["testmanager", "masterdata"], None::<&()>).await
    }

    pub async fn tests(&self, filter: &TestFilter) -> Result<Vec<TestCase>, BackendError> {
        self.call(Method::POST, &["testmanager", "test"], Some(filter)).await
    }

    /// Returns the new run id.
    pub async fn create_run(&self, req: &CreateRunRequest) -> Result<String, BackendError> {
        let created: RunCreated = self.call(Method::POST, &["testmanager", "createrun"], Some(req)).await?;
        Ok(created.run_id)
    }

    pub async fn runs(&self, email: &str) -> Result<Vec<TestRun>, BackendError> {
        self.call(Method::GET, &["testmanager", "runs", email], None::<&()>).await
    }

    pub async fn report(&self, run_id: &str) -> Result<TestReport, BackendError> {
        self.call(Method::GET, &["testmanager", "report", run_id, "json"], None::<&()>).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        let shown = url.to_string();
        let mut req = self.client.request(method.clone(), url);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|source| BackendError::Http { url: shown.clone(), source })?;
        let status = resp.status();
        debug!(url = %shown, %method, status = status.as_u16(), "backend responded");
        if !status.is_success() {
            return Err(BackendError::Status { url: shown, status: status.as_u16() });
        }
        let bytes = resp.bytes().await.map_err(|source| BackendError::Http { url: shown.clone(), source })?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode { url: shown, reason: e.to_string() })
    }
}

#[async_trait]
impl TestRunner for BackendClient {
    async fn compose_request(
        &self,
        run_id: &str,
        test_id: &str,
        device_info: &Value,
    ) -> Result<ComposedRequest, BackendError> {
        let body = ComposeRequestBody { run_id, test_id, device_info: device_info.to_string() };
        let resp: ComposeRequestResponse =
            self.call(Method::POST, &["testrunner", "composerequest"], Some(&body)).await?;
        if let Some(echoed) = resp.test_id.as_deref() {
            if echoed != test_id {
                debug!(expected = test_id, echoed, run = ?resp.run_id, "compose response echoed another test id");
            }
        }
        Ok(resp.request_info_dto)
    }

    async fn validate_response(
        &self,
        run_id: &str,
        test_id: &str,
        request: &ComposedRequest,
        response: &str,
    ) -> Result<ValidationReport, BackendError> {
        let mds_request = serde_json::to_string(request).map_err(|e| BackendError::Decode {
            url: "validateresponse".into(),
            reason: e.to_string(),
        })?;
        let body = ValidateResponseBody {
            run_id,
            test_id,
            mds_request,
            mds_response: response,
            result_verbosity: RESULT_VERBOSITY,
        };
        self.call(Method::POST, &["testrunner", "validateresponse"], Some(&body)).await
    }
}

#[async_trait]
impl DeviceInfoDecoder for BackendClient {
    async fn decode_device_info(&self, raw: &Value) -> Result<Value, BackendError> {
        let decoded: Value = self.call(Method::POST, &["testrunner", "decodedeviceinfo"], Some(raw)).await?;
        if decoded.is_null() {
            return Err(BackendError::Decode {
                url: "decodedeviceinfo".into(),
                reason: "decoder returned no device info".into(),
            });
        }
        Ok(decoded)
    }
}
