//! Wire types for the test manager and test runner services.

use mdstest_core::{null_as_default, ComposedRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricType {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_type: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub segments: Vec<String>,
}

/// Taxonomy used to filter the test catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterData {
    #[serde(default, deserialize_with = "null_as_default")]
    pub biometric_type: Vec<BiometricType>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mds_specification_version: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub process: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFilter {
    pub biometric_type: String,
    pub device_type: String,
    pub mds_specification_version: String,
    pub process: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiInput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub field: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub behaviour: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub test_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub test_description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub request_generator: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ui_input: Vec<UiInput>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub processes: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub biometric_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mds_spec_versions: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub validators: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub mds_spec_version: String,
    pub process: String,
    pub biometric_type: String,
    pub device_type: String,
    pub tests: Vec<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunCreated {
    pub run_id: String,
}

/// Run as tracked by the test manager. Also the shape of its JSON report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub run_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub run_status: String,
    #[serde(default)]
    pub created_on: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tests: Vec<String>,
    #[serde(default)]
    pub test_report: Option<BTreeMap<String, Value>>,
}

pub type TestReport = TestRun;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ComposeRequestBody<'a> {
    pub run_id: &'a str,
    pub test_id: &'a str,
    /// Device descriptor as JSON text.
    pub device_info: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ComposeRequestResponse {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub test_id: Option<String>,
    pub request_info_dto: ComposedRequest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateResponseBody<'a> {
    pub run_id: &'a str,
    pub test_id: &'a str,
    /// Composed request as JSON text.
    pub mds_request: String,
    pub mds_response: &'a str,
    pub result_verbosity: &'a str,
}
