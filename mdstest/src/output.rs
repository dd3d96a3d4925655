use anyhow::{anyhow, Result};
use backend_client::TestCase;
use clap::ValueEnum;
use device_scan::ScanSummary;
use mdstest_core::{DeviceInfo, DiscoveryRecord, Port, TestOutcome};
use run_exec::RunReport;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

/// Write `content` to `out` (truncating) or stdout.
pub fn emit(out: Option<&Path>, content: &str) -> Result<()> {
    match out {
        Some(path) => {
            let file = OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
            let mut w = BufWriter::new(file);
            w.write_all(content.as_bytes())?;
            if !content.ends_with('\n') {
                writeln!(w)?;
            }
            w.flush()?;
        }
        None => println!("{}", content.trim_end_matches('\n')),
    }
    Ok(())
}

fn csv_string<I, R>(header: &[&str], rows: I) -> Result<String>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    let bytes = wtr.into_inner().map_err(|e| anyhow!("csv flush: {}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}

pub fn render_scan(summary: &ScanSummary, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => {
            let mut line = format!(
                "{}: {} device(s) found ({} probed, {} without a device service)",
                summary.range, summary.found, summary.probed, summary.failed
            );
            if summary.cancelled {
                line.push_str(" [cancelled]");
            }
            for f in &summary.decode_failures {
                line.push_str(&format!("\n  {}: decode failed: {}", f.port, f.message));
            }
            line
        }
        OutputFormat::Json => serde_json::to_string_pretty(summary)?,
        OutputFormat::Csv => csv_string(
            &["range", "probed", "found", "failed", "cancelled", "decode_failures"],
            [[
                summary.range.to_string(),
                summary.probed.to_string(),
                summary.found.to_string(),
                summary.failed.to_string(),
                summary.cancelled.to_string(),
                summary.decode_failures.len().to_string(),
            ]],
        )?,
    })
}

pub fn render_devices(devices: &BTreeMap<Port, DiscoveryRecord>, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text if devices.is_empty() => "no devices discovered".to_string(),
        OutputFormat::Text => devices
            .values()
            .map(|d| format!("{:<6} {}  {}", d.port, d.discovered_at, d.payload))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => serde_json::to_string_pretty(&devices.values().collect::<Vec<_>>())?,
        OutputFormat::Csv => csv_string(
            &["port", "discovered_at", "payload"],
            devices.values().map(|d| [d.port.to_string(), d.discovered_at.clone(), d.payload.to_string()]),
        )?,
    })
}

pub fn render_device_infos(infos: &BTreeMap<Port, DeviceInfo>, format: OutputFormat) -> Result<String> {
    let opt = |v: Option<&str>| v.unwrap_or("-").to_string();
    Ok(match format {
        OutputFormat::Text if infos.is_empty() => "no device info recorded".to_string(),
        OutputFormat::Text => infos
            .values()
            .map(|i| {
                format!(
                    "{:<6} {:<8} {:<12} {:<10} {:<14} {}",
                    i.port,
                    opt(i.device_kind()),
                    opt(i.device_sub_type()),
                    opt(i.device_status()),
                    opt(i.purpose()),
                    i.spec_versions().join(",")
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => serde_json::to_string_pretty(&infos.values().collect::<Vec<_>>())?,
        OutputFormat::Csv => csv_string(
            &["port", "type", "sub_type", "status", "purpose", "spec_versions", "decoded_at"],
            infos.values().map(|i| {
                [
                    i.port.to_string(),
                    opt(i.device_kind()),
                    opt(i.device_sub_type()),
                    opt(i.device_status()),
                    opt(i.purpose()),
                    i.spec_versions().join("|"),
                    i.decoded_at.clone(),
                ]
            }),
        )?,
    })
}

pub fn render_tests(tests: &[TestCase], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => tests
            .iter()
            .map(|t| format!("{:<16} {}", t.test_id, t.test_description))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => serde_json::to_string_pretty(tests)?,
        OutputFormat::Csv => csv_string(
            &["test_id", "description", "request_generator"],
            tests.iter().map(|t| [t.test_id.as_str(), t.test_description.as_str(), t.request_generator.as_str()]),
        )?,
    })
}

fn outcome_row(test_id: &str, outcome: Option<&TestOutcome>) -> [String; 6] {
    match outcome {
        None => [test_id.to_string(), "Pending".into(), String::new(), String::new(), String::new(), String::new()],
        Some(TestOutcome::Validated { request, report, executed_at, .. }) => [
            test_id.to_string(),
            report.status.clone(),
            request.verb.clone(),
            request.url.clone(),
            report.summary.clone().unwrap_or_default(),
            executed_at.clone(),
        ],
        Some(TestOutcome::Failed { kind, message, executed_at }) => [
            test_id.to_string(),
            kind.to_string(),
            String::new(),
            String::new(),
            message.clone(),
            executed_at.clone(),
        ],
    }
}

pub fn render_report(report: &RunReport, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => {
            let mut lines: Vec<String> = report
                .iter_planned()
                .map(|(id, o)| {
                    let row = outcome_row(id, o);
                    format!("{:<16} {:<22} {}", row[0], row[1], row[4])
                })
                .collect();
            lines.push(format!(
                "run {}: {} passed, {} failed, {} tests",
                report.run_id(),
                report.passed(),
                report.failed(),
                report.len()
            ));
            lines.join("\n")
        }
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Csv => csv_string(
            &["test_id", "status", "verb", "url", "detail", "executed_at"],
            report.iter_planned().map(|(id, o)| outcome_row(id, o)),
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdstest_core::{ComposedRequest, FailureKind, PortRange, ValidationReport};
    use serde_json::json;

    fn sample_report() -> RunReport {
        let mut report = RunReport::with_tests("R1", vec!["T1".into(), "T2".into()]);
        let verdict = ValidationReport {
            run_id: "R1".into(),
            test_id: "T1".into(),
            status: "Passed".into(),
            summary: Some("all checks ok".into()),
            request: None,
            response: None,
            details: vec![],
        };
        report.record(
            "R1",
            "T1",
            TestOutcome::validated(ComposedRequest::new("MOSIPDISC", "http://127.0.0.1:4501/device", ""), "{}".into(), verdict),
        );
        report.record("R1", "T2", TestOutcome::failed(FailureKind::ComposeFailed, "status 500"));
        report
    }

    #[test]
    fn report_text_has_summary_line() {
        let text = render_report(&sample_report(), OutputFormat::Text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("T1") && lines[0].contains("Passed"));
        assert!(lines[1].contains("ComposeFailed"));
        assert_eq!(lines[2], "run R1: 1 passed, 1 failed, 2 tests");
    }

    #[test]
    fn report_csv_has_one_row_per_test() {
        let csv = render_report(&sample_report(), OutputFormat::Csv).unwrap();
        let mut rdr = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "Passed");
        assert_eq!(&rows[0][2], "MOSIPDISC");
        assert_eq!(&rows[1][4], "status 500");
    }

    #[test]
    fn report_json_is_keyed_by_test() {
        let v: serde_json::Value = serde_json::from_str(&render_report(&sample_report(), OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(v["run_id"], "R1");
        assert_eq!(v["outcomes"]["T2"]["outcome"], "failed");
        assert_eq!(v["outcomes"]["T1"]["outcome"], "validated");
    }

    #[test]
    fn device_info_rows_use_decoded_fields() {
        let mut infos = BTreeMap::new();
        infos.insert(
            4501,
            DeviceInfo::new(
                4501,
                json!([{ "deviceStatus": "Ready", "purpose": "Auth", "specVersion": ["0.9.5"],
                         "digitalIdDecoded": { "type": "Finger", "deviceSubType": "Slap" } }]),
            ),
        );
        let text = render_device_infos(&infos, OutputFormat::Text).unwrap();
        assert!(text.starts_with("4501"));
        assert!(text.contains("Finger") && text.contains("Slap") && text.contains("0.9.5"));
    }

    #[test]
    fn empty_device_list_text() {
        assert_eq!(render_devices(&BTreeMap::new(), OutputFormat::Text).unwrap(), "no devices discovered");
        let csv = render_devices(&BTreeMap::new(), OutputFormat::Csv).unwrap();
        assert_eq!(csv.trim(), "port,discovered_at,payload");
    }

    #[test]
    fn scan_text_flags_cancellation() {
        let summary = ScanSummary {
            range: PortRange::new(4501, 4600).unwrap(),
            probed: 40,
            found: 2,
            failed: 38,
            cancelled: true,
            decode_failures: vec![],
        };
        let text = render_scan(&summary, OutputFormat::Text).unwrap();
        assert_eq!(text, "4501-4600: 2 device(s) found (40 probed, 38 without a device service) [cancelled]");
    }

    #[test]
    fn emit_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        emit(Some(&path), "a,b").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,b\n");
    }
}
