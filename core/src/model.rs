//! Records, requests and outcomes shared across the engine crates.
//!
//! Payloads that the engine does not interpret (device descriptors, backend
//! decode output) stay as `serde_json::Value` so they round-trip untouched.

use crate::{now_rfc3339, FailureKind, Port};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Placeholder the backend leaves in composed URLs for the device port.
pub const DEVICE_PORT_PLACEHOLDER: &str = "<device_service_port>";

/// Deserialize an explicit `null` the same as a missing field.
///
/// Use together with `#[serde(default)]` on fields the backend may leave unset.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of a successful discovery probe on one port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub port: Port,
    pub payload: Value,
    pub discovered_at: String,
}

impl DiscoveryRecord {
    pub fn new(port: Port, payload: Value) -> Self {
        DiscoveryRecord { port, payload, discovered_at: now_rfc3339() }
    }
}

/// Decoded device descriptor, as returned by the backend decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub port: Port,
    pub decoded: Value,
    pub decoded_at: String,
}

impl DeviceInfo {
    pub fn new(port: Port, decoded: Value) -> Self {
        DeviceInfo { port, decoded, decoded_at: now_rfc3339() }
    }

    /// Device kind from the decoded digital id (e.g. "Finger", "Iris", "Face").
    pub fn device_kind(&self) -> Option<&str> {
        self.lookup(&["/digitalIdDecoded/type", "/digitalId/type"])
    }

    pub fn device_sub_type(&self) -> Option<&str> {
        self.lookup(&["/digitalIdDecoded/deviceSubType", "/digitalId/deviceSubType"])
    }

    pub fn device_status(&self) -> Option<&str> {
        self.lookup(&["/deviceStatus"])
    }

    pub fn purpose(&self) -> Option<&str> {
        self.lookup(&["/purpose"])
    }

    /// Supported MDS specification versions advertised by the device.
    pub fn spec_versions(&self) -> Vec<String> {
        match self.root().get("specVersion") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            }
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    // Decoders may wrap a single device in a one-element array.
    fn root(&self) -> &Value {
        match &self.decoded {
            Value::Array(items) if !items.is_empty() => &items[0],
            other => other,
        }
    }

    fn lookup(&self, pointers: &[&str]) -> Option<&str> {
        let root = self.root();
        pointers.iter().find_map(|p| root.pointer(p).and_then(Value::as_str))
    }
}

/// A protocol request built by the backend for one test case and device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedRequest {
    pub verb: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ComposedRequest {
    pub fn new(verb: impl Into<String>, url: impl Into<String>, body: impl Into<String>) -> Self {
        ComposedRequest { verb: verb.into(), url: url.into(), body: body.into(), headers: BTreeMap::new() }
    }

    /// Copy of the request with the device port placeholder filled in.
    pub fn for_port(&self, port: Port) -> ComposedRequest {
        let port = port.to_string();
        ComposedRequest {
            verb: self.verb.clone(),
            url: self.url.replace(DEVICE_PORT_PLACEHOLDER, &port),
            body: self.body.replace(DEVICE_PORT_PLACEHOLDER, &port),
            headers: self.headers.clone(),
        }
    }
}

/// Outcome of one named validation inside a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetail {
    #[serde(default, deserialize_with = "null_as_default")]
    pub validation_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub validation_description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<String>,
}

/// Validator verdict for one (run, test) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub run_id: String,
    pub test_id: String,
    pub status: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub details: Vec<ValidationDetail>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.status.eq_ignore_ascii_case("passed")
    }
}

/// Per-test-case result recorded in a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TestOutcome {
    /// Compose, dispatch and validate all completed; the verdict is the validator's.
    Validated {
        request: ComposedRequest,
        response: String,
        report: ValidationReport,
        executed_at: String,
    },
    /// The pipeline stopped at a step; later steps never ran.
    Failed {
        kind: FailureKind,
        message: String,
        executed_at: String,
    },
}

impl TestOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        TestOutcome::Failed { kind, message: message.into(), executed_at: now_rfc3339() }
    }

    pub fn validated(request: ComposedRequest, response: String, report: ValidationReport) -> Self {
        TestOutcome::Validated { request, response, report, executed_at: now_rfc3339() }
    }

    /// True only when the validator ran and reported a pass.
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Validated { report, .. } if report.passed())
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TestOutcome::Failed { kind, .. } => Some(*kind),
            TestOutcome::Validated { .. } => None,
        }
    }

    /// Short status string for tabular output.
    pub fn status(&self) -> String {
        match self {
            TestOutcome::Validated { report, .. } => report.status.clone(),
            TestOutcome::Failed { kind, .. } => kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composed_request_accepts_null_headers_and_body() {
        let req: ComposedRequest = serde_json::from_value(json!({
            "verb": "MOSIPDISC",
            "url": "http://127.0.0.1:<device_service_port>/device",
            "headers": null,
            "body": null
        }))
        .unwrap();
        assert!(req.headers.is_empty());
        assert_eq!(req.body, "");

        let detail: ValidationDetail = serde_json::from_value(json!({
            "validationName": "SchemaValidator", "validationDescription": null, "status": "Passed", "errors": null
        }))
        .unwrap();
        assert_eq!(detail.validation_description, "");
        assert!(detail.errors.is_empty());
    }

    #[test]
    fn composed_request_fills_port_placeholder() {
        let req = ComposedRequest::new(
            "MOSIPDISC",
            "http://127.0.0.1:<device_service_port>/device",
            r#"{"type":"Biometric Device"}"#,
        );
        let resolved = req.for_port(4501);
        assert_eq!(resolved.url, "http://127.0.0.1:4501/device");
        assert_eq!(resolved.verb, "MOSIPDISC");
        assert_eq!(resolved.body, req.body);
    }

    #[test]
    fn composed_request_accepts_backend_shape() {
        let req: ComposedRequest = serde_json::from_value(json!({
            "url": "http://127.0.0.1:<device_service_port>/capture",
            "verb": "CAPTURE",
            "body": "{}"
        }))
        .unwrap();
        assert!(req.headers.is_empty());
        assert_eq!(req.verb, "CAPTURE");
    }

    #[test]
    fn device_info_accessors() {
        let info = DeviceInfo::new(
            4501,
            json!([{
                "deviceStatus": "Ready",
                "purpose": "Registration",
                "specVersion": ["0.9.2", "0.9.3"],
                "digitalIdDecoded": { "type": "Finger", "deviceSubType": "Slap" }
            }]),
        );
        assert_eq!(info.device_kind(), Some("Finger"));
        assert_eq!(info.device_sub_type(), Some("Slap"));
        assert_eq!(info.device_status(), Some("Ready"));
        assert_eq!(info.purpose(), Some("Registration"));
        assert_eq!(info.spec_versions(), vec!["0.9.2".to_string(), "0.9.3".to_string()]);
    }

    #[test]
    fn outcome_pass_and_failure() {
        let report = ValidationReport {
            run_id: "R1".into(),
            test_id: "T1".into(),
            status: "Passed".into(),
            summary: None,
            request: None,
            response: None,
            details: vec![],
        };
        let ok = TestOutcome::validated(ComposedRequest::new("MOSIPDISC", "u", ""), "{}".into(), report);
        assert!(ok.passed());
        assert_eq!(ok.failure_kind(), None);

        let bad = TestOutcome::failed(FailureKind::ComposeFailed, "backend said no");
        assert!(!bad.passed());
        assert_eq!(bad.failure_kind(), Some(FailureKind::ComposeFailed));
        assert_eq!(bad.status(), "ComposeFailed");
        let v = serde_json::to_value(&bad).unwrap();
        assert_eq!(v["outcome"], "failed");
        assert_eq!(v["kind"], "ComposeFailed");
    }
}
