//! Executes a test run against one device: compose → dispatch → validate per
//! test case, all test cases in parallel, outcomes collected by test id.

mod report;

pub use report::RunReport;

use backend_client::TestRunner;
use mdstest_core::{FailureKind, Port, TestOutcome};
use mds_dispatch::DeviceTransport;
use registry_sqlite::{DeviceRegistry, RegistryError};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no device registered on port {0}")]
    DeviceNotFound(Port),
    #[error("device registry: {0}")]
    Registry(#[from] RegistryError),
}

/// The device a run is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub port: Port,
    /// Descriptor handed to the backend when composing requests.
    pub descriptor: Value,
}

impl Device {
    pub fn new(port: Port, descriptor: Value) -> Self {
        Device { port, descriptor }
    }

    /// Select a registered device, preferring its decoded info over the raw
    /// discovery payload.
    pub async fn from_registry(registry: &DeviceRegistry, port: Port) -> Result<Self, ExecError> {
        match registry.get_info(port).await {
            Ok(info) => return Ok(Device::new(port, info.decoded)),
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match registry.get(port).await {
            Ok(record) => Ok(Device::new(port, record.payload)),
            Err(RegistryError::NotFound(_)) => Err(ExecError::DeviceNotFound(port)),
            Err(e) => Err(e.into()),
        }
    }
}

/// A run id and the test cases to execute under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub run_id: String,
    pub tests: Vec<String>,
}

impl RunPlan {
    pub fn new(run_id: impl Into<String>, tests: Vec<String>) -> Self {
        RunPlan { run_id: run_id.into(), tests }
    }

    /// Test ids in plan order, duplicates dropped.
    fn unique_tests(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tests.iter().filter(|t| seen.insert(t.as_str())).cloned().collect()
    }
}

pub struct RunExecutor {
    transport: Arc<dyn DeviceTransport>,
    runner: Arc<dyn TestRunner>,
    max_parallel: Option<usize>,
}

impl RunExecutor {
    pub fn new(transport: Arc<dyn DeviceTransport>, runner: Arc<dyn TestRunner>) -> Self {
        RunExecutor { transport, runner, max_parallel: None }
    }

    /// Bound the number of test pipelines in flight. `None` launches all at once.
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel.map(|n| n.max(1));
        self
    }

    pub async fn execute(&self, run: &RunPlan, device: &Device) -> RunReport {
        self.execute_with_cancel(run, device, CancellationToken::new()).await
    }

    /// Run every test in `run`. The returned report holds exactly one
    /// outcome per distinct test id. Tests not yet started when `cancel`
    /// fires are recorded as `Cancelled`; started ones run to completion.
    #[instrument(skip_all, fields(run_id = %run.run_id, port = device.port))]
    pub async fn execute_with_cancel(
        &self,
        run: &RunPlan,
        device: &Device,
        cancel: CancellationToken,
    ) -> RunReport {
        let tests = run.unique_tests();
        let mut report = RunReport::with_tests(run.run_id.clone(), tests.clone());
        let limit = self.max_parallel.unwrap_or(tests.len()).max(1);
        let device = Arc::new(device.clone());
        let mut queue: VecDeque<String> = tests.into();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut set = JoinSet::new();

        loop {
            while set.len() < limit && !cancel.is_cancelled() {
                let Some(test_id) = queue.pop_front() else { break };
                in_flight.insert(test_id.clone());
                let pipeline = Pipeline {
                    transport: self.transport.clone(),
                    runner: self.runner.clone(),
                    run_id: run.run_id.clone(),
                    device: device.clone(),
                };
                set.spawn(async move {
                    let outcome = pipeline.run(&test_id).await;
                    (test_id, outcome)
                });
            }

            match set.join_next().await {
                Some(Ok((test_id, outcome))) => {
                    debug!(test_id = %test_id, status = %outcome.status(), "test finished");
                    in_flight.remove(&test_id);
                    report.record(&run.run_id, &test_id, outcome);
                }
                Some(Err(e)) => warn!(error = %e, "test pipeline aborted"),
                None => break,
            }
        }

        // a panicked pipeline leaves its id behind in `in_flight`
        for test_id in in_flight {
            report.record(&run.run_id, &test_id, TestOutcome::failed(FailureKind::Aborted, "test pipeline aborted"));
        }
        for test_id in queue {
            report.record(&run.run_id, &test_id, TestOutcome::failed(FailureKind::Cancelled, "run cancelled before start"));
        }

        info!(tests = report.len(), passed = report.passed(), failed = report.failed(), "run complete");
        report
    }
}

/// One test case's strictly sequential compose → dispatch → validate chain.
struct Pipeline {
    transport: Arc<dyn DeviceTransport>,
    runner: Arc<dyn TestRunner>,
    run_id: String,
    device: Arc<Device>,
}

impl Pipeline {
    async fn run(&self, test_id: &str) -> TestOutcome {
        let request = match self.runner.compose_request(&self.run_id, test_id, &self.device.descriptor).await {
            Ok(r) => r.for_port(self.device.port),
            Err(e) => return TestOutcome::failed(FailureKind::ComposeFailed, e.to_string()),
        };
        let response = match self.transport.dispatch(&request).await {
            Ok(body) => body,
            Err(e) => return TestOutcome::failed(e.kind(), e.to_string()),
        };
        match self.runner.validate_response(&self.run_id, test_id, &request, &response).await {
            Ok(verdict) => TestOutcome::validated(request, response, verdict),
            Err(e) => TestOutcome::failed(FailureKind::ValidateFailed, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backend_client::BackendError;
    use mdstest_core::{ComposedRequest, DeviceInfo, DiscoveryRecord, ValidationReport};
    use mds_dispatch::{DispatchError, ProbeKind};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend fake: compose fails for ids containing "nocompose", validate
    /// fails for ids containing "novalidate", "panic" panics, and the
    /// request URL path is the test id so the device fake can vary per test.
    #[derive(Default)]
    struct FakeBackend {
        composed_with: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl TestRunner for FakeBackend {
        async fn compose_request(
            &self,
            run_id: &str,
            test_id: &str,
            device_info: &Value,
        ) -> Result<ComposedRequest, BackendError> {
            self.composed_with.lock().unwrap().push(device_info.clone());
            if test_id.contains("nocompose") {
                return Err(BackendError::Status { url: "composerequest".into(), status: 500 });
            }
            if test_id.contains("panic") {
                panic!("compose exploded");
            }
            Ok(ComposedRequest::new(
                "MOSIPDISC",
                format!("http://127.0.0.1:<device_service_port>/{run_id}/{test_id}"),
                "",
            ))
        }

        async fn validate_response(
            &self,
            run_id: &str,
            test_id: &str,
            _request: &ComposedRequest,
            response: &str,
        ) -> Result<ValidationReport, BackendError> {
            if test_id.contains("novalidate") {
                return Err(BackendError::Decode { url: "validateresponse".into(), reason: "null".into() });
            }
            Ok(ValidationReport {
                run_id: run_id.into(),
                test_id: test_id.into(),
                status: "Passed".into(),
                summary: Some(response.to_string()),
                request: None,
                response: Some(response.to_string()),
                details: vec![],
            })
        }
    }

    /// Device fake: answers with the request URL, slower for earlier tests so
    /// completion order is the reverse of launch order. URLs ending in
    /// "offline" are unreachable.
    #[derive(Default)]
    struct FakeDevice {
        seen_urls: Mutex<Vec<String>>,
        /// Cancelled as soon as any request reaches the device.
        cancel_on_dispatch: Option<CancellationToken>,
    }

    #[async_trait]
    impl DeviceTransport for FakeDevice {
        async fn probe(&self, _kind: ProbeKind, _port: Port) -> Result<Value, DispatchError> {
            unreachable!("executor never probes")
        }

        async fn dispatch(&self, request: &ComposedRequest) -> Result<String, DispatchError> {
            self.seen_urls.lock().unwrap().push(request.url.clone());
            if let Some(token) = &self.cancel_on_dispatch {
                token.cancel();
            }
            if request.url.ends_with("offline") {
                return Err(DispatchError::Unreachable { url: request.url.clone(), reason: "refused".into() });
            }
            let delay = if request.url.ends_with("T1") { 40 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(format!("reply:{}", request.url))
        }
    }

    fn executor() -> (RunExecutor, Arc<FakeBackend>, Arc<FakeDevice>) {
        let backend = Arc::new(FakeBackend::default());
        let device = Arc::new(FakeDevice::default());
        (RunExecutor::new(device.clone(), backend.clone()), backend, device)
    }

    fn plan(tests: &[&str]) -> RunPlan {
        RunPlan::new("R1", tests.iter().map(|t| t.to_string()).collect())
    }

    #[tokio::test]
    async fn compose_failure_only_fails_that_test() {
        let (exec, _, _) = executor();
        let device = Device::new(4501, json!({ "deviceId": "1" }));

        let report = exec.execute(&plan(&["T1", "T2-nocompose"]), &device).await;

        assert_eq!(report.len(), 2);
        assert!(report.outcome("T1").unwrap().passed());
        assert_eq!(report.outcome("T2-nocompose").unwrap().failure_kind(), Some(FailureKind::ComposeFailed));
    }

    #[tokio::test]
    async fn port_placeholder_is_resolved_before_dispatch() {
        let (exec, backend, device_fake) = executor();
        let device = Device::new(4550, json!({ "deviceId": "x" }));

        let report = exec.execute(&plan(&["T1"]), &device).await;

        assert_eq!(device_fake.seen_urls.lock().unwrap().as_slice(), ["http://127.0.0.1:4550/R1/T1"]);
        assert_eq!(backend.composed_with.lock().unwrap()[0], json!({ "deviceId": "x" }));
        match report.outcome("T1").unwrap() {
            TestOutcome::Validated { request, response, .. } => {
                assert_eq!(request.url, "http://127.0.0.1:4550/R1/T1");
                assert_eq!(response, "reply:http://127.0.0.1:4550/R1/T1");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_failure_kind_is_recorded_per_test() {
        let (exec, _, _) = executor();
        let device = Device::new(4501, json!({}));
        let tests = ["T1", "T2", "nocompose", "offline", "novalidate", "T3"];

        let report = exec.execute(&plan(&tests), &device).await;

        assert_eq!(report.len(), tests.len());
        assert!(report.all_complete());
        assert_eq!(report.passed(), 3);
        assert_eq!(report.outcome("offline").unwrap().failure_kind(), Some(FailureKind::Unreachable));
        assert_eq!(report.outcome("novalidate").unwrap().failure_kind(), Some(FailureKind::ValidateFailed));
        let order: Vec<&str> = report.iter_planned().map(|(t, _)| t).collect();
        assert_eq!(order, tests.to_vec());
    }

    #[tokio::test]
    async fn bounded_parallelism_still_completes_everything() {
        let (exec, _, _) = executor();
        let exec = exec.with_max_parallel(Some(1));
        let tests: Vec<String> = (0..12).map(|i| format!("T{i}")).collect();
        let run = RunPlan::new("R1", tests.clone());

        let report = exec.execute(&run, &Device::new(4501, json!({}))).await;

        assert_eq!(report.len(), 12);
        assert!(tests.iter().all(|t| report.is_complete(t)));
    }

    #[tokio::test]
    async fn duplicate_test_ids_run_once() {
        let (exec, _, device_fake) = executor();
        let report = exec.execute(&plan(&["T1", "T1", "T2"]), &Device::new(4501, json!({}))).await;
        assert_eq!(report.len(), 2);
        assert_eq!(device_fake.seen_urls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn panicking_pipeline_is_recorded_as_aborted() {
        let (exec, _, _) = executor();
        let report = exec.execute(&plan(&["T1", "panic"]), &Device::new(4501, json!({}))).await;
        assert_eq!(report.len(), 2);
        assert!(report.outcome("T1").unwrap().passed());
        assert_eq!(report.outcome("panic").unwrap().failure_kind(), Some(FailureKind::Aborted));
    }

    #[tokio::test]
    async fn cancelled_run_records_unstarted_tests() {
        let (exec, _, device_fake) = executor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = exec
            .execute_with_cancel(&plan(&["T1", "T2"]), &Device::new(4501, json!({})), cancel)
            .await;

        assert_eq!(report.len(), 2);
        assert_eq!(report.outcome("T2").unwrap().failure_kind(), Some(FailureKind::Cancelled));
        assert!(device_fake.seen_urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_run_finishes_running_test_and_skips_queued() {
        let cancel = CancellationToken::new();
        let device_fake = Arc::new(FakeDevice { cancel_on_dispatch: Some(cancel.clone()), ..Default::default() });
        let exec = RunExecutor::new(device_fake.clone(), Arc::new(FakeBackend::default())).with_max_parallel(Some(1));

        let report = exec
            .execute_with_cancel(&plan(&["T1", "T2", "T3"]), &Device::new(4501, json!({})), cancel)
            .await;

        assert_eq!(report.len(), 3);
        assert!(report.outcome("T1").unwrap().passed());
        assert_eq!(report.outcome("T2").unwrap().failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(report.outcome("T3").unwrap().failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(device_fake.seen_urls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_plan_yields_empty_report() {
        let (exec, _, _) = executor();
        let report = exec.execute(&plan(&[]), &Device::new(4501, json!({}))).await;
        assert!(report.is_empty());
        assert_eq!(report.run_id(), "R1");
    }

    #[tokio::test]
    async fn device_selection_prefers_decoded_info() {
        let registry = DeviceRegistry::open_in_memory().unwrap();
        registry.merge(DiscoveryRecord::new(4501, json!({ "raw": true }))).await.unwrap();
        registry.merge(DiscoveryRecord::new(4502, json!({ "raw": true }))).await.unwrap();
        registry.merge_info(DeviceInfo::new(4502, json!({ "decoded": true }))).await.unwrap();

        let d1 = Device::from_registry(&registry, 4501).await.unwrap();
        let d2 = Device::from_registry(&registry, 4502).await.unwrap();
        assert_eq!(d1.descriptor, json!({ "raw": true }));
        assert_eq!(d2.descriptor, json!({ "decoded": true }));
        assert!(matches!(
            Device::from_registry(&registry, 4600).await,
            Err(ExecError::DeviceNotFound(4600))
        ));
    }
}
