//! Per-tool payload loaders.
//!
//! Each per-tool agent has a loader that reads its collector's artifact
//! from the report directory and serializes it into a prompt payload,
//! clipped to a fixed character budget.

use serde_json::{json, Value};
use std::path::Path;

/// Maximum characters of raw data sent per tool (keeps tokens in check).
pub const MAX_TOOL_PAYLOAD_CHARS: usize = 6000;

const TRUNCATION_MARKER: &str = "\n... [truncated]";
const MAX_CSV_ROWS: usize = 200;

#[derive(Debug, Clone)]
pub struct LoadedPayload {
    pub text: String,
    pub has_data: bool,
}

impl LoadedPayload {
    fn none(message: &str) -> Self {
        LoadedPayload {
            text: message.to_string(),
            has_data: false,
        }
    }

    fn some(text: String) -> Self {
        LoadedPayload {
            text: clip_payload(&text),
            has_data: true,
        }
    }
}

/// Enforce the payload budget: the result never exceeds
/// [`MAX_TOOL_PAYLOAD_CHARS`], marker included.
pub fn clip_payload(text: &str) -> String {
    let total: usize = text.chars().count();
    if total <= MAX_TOOL_PAYLOAD_CHARS {
        return text.to_string();
    }
    let keep = MAX_TOOL_PAYLOAD_CHARS - TRUNCATION_MARKER.chars().count();
    let clipped: String = text.chars().take(keep).collect();
    format!("{}{}", clipped, TRUNCATION_MARKER)
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn read_text(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    Some(raw)
}

/// Read a CSV re-joined as comma lines, capped at [`MAX_CSV_ROWS`] with a
/// trailing truncation line.
fn read_csv_as_text(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());
    let mut lines = Vec::new();
    for (i, record) in reader.records().enumerate() {
        if i >= MAX_CSV_ROWS {
            lines.push(format!("... truncated ({}+ rows)", i));
            break;
        }
        match record {
            Ok(r) => lines.push(r.iter().collect::<Vec<_>>().join(",")),
            Err(_) => continue,
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n"))
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn summary_json(report_dir: &Path, tool: &str) -> Option<Value> {
    read_json(
        &report_dir
            .join("artifacts")
            .join(tool)
            .join(format!("{}_summary.json", tool)),
    )
}

/// Load the payload for one agent. Missing or empty backing data yields
/// `has_data = false` with a human-readable sentence instead of content.
pub fn load_for_agent(agent_name: &str, report_dir: &Path) -> LoadedPayload {
    match agent_name {
        "sysmon-analyzer" => match summary_json(report_dir, "sysmon") {
            Some(data) => LoadedPayload::some(compact_json(&data)),
            None => LoadedPayload::none("No Sysmon data was collected for this analysis."),
        },
        "procmon-analyzer" => match summary_json(report_dir, "procmon") {
            Some(data) => LoadedPayload::some(compact_json(&data)),
            None => LoadedPayload::none("No Procmon data was collected for this analysis."),
        },
        "network-analyzer" => match summary_json(report_dir, "network") {
            Some(data) => LoadedPayload::some(compact_json(&data)),
            None => LoadedPayload::none("No network capture data was collected for this analysis."),
        },
        "handle-analyzer" => {
            match read_text(&report_dir.join("artifacts").join("handle").join("handle_snapshot.txt"))
            {
                Some(text) => LoadedPayload::some(text),
                None => {
                    LoadedPayload::none("No handle snapshot data was collected for this analysis.")
                }
            }
        }
        "tcpvcon-analyzer" => {
            match read_csv_as_text(
                &report_dir
                    .join("artifacts")
                    .join("tcpvcon")
                    .join("tcpvcon_snapshot.csv"),
            ) {
                Some(text) => LoadedPayload::some(text),
                None => LoadedPayload::none("No TCPVcon data was collected for this analysis."),
            }
        }
        "metadata-analyzer" => {
            let metadata = read_json(&report_dir.join("artifacts").join("metadata.json"));
            let manifest = read_json(&report_dir.join("analysis_manifest.json"));
            let mut combined = serde_json::Map::new();
            if let Some(manifest) = manifest {
                combined.insert(
                    "manifest".to_string(),
                    json!({
                        "sample_name": manifest.get("sample_name"),
                        "status": manifest.get("status"),
                        "started_at": manifest.get("started_at"),
                        "completed_at": manifest.get("completed_at"),
                        "timeout": manifest.get("timeout"),
                        "sysmon_events": manifest.get("sysmon_events"),
                        "files_collected_count": manifest
                            .get("files_collected")
                            .and_then(Value::as_array)
                            .map(|a| a.len())
                            .unwrap_or(0),
                    }),
                );
            }
            if let Some(metadata) = metadata {
                combined.insert("metadata".to_string(), metadata);
            }
            if combined.is_empty() {
                LoadedPayload::none("No metadata available for this analysis.")
            } else {
                LoadedPayload::some(compact_json(&Value::Object(combined)))
            }
        }
        _ => LoadedPayload::none("No loader registered for this agent."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn missing_data_is_a_no_data_sentence() {
        let report = tempdir().unwrap();
        for agent in [
            "sysmon-analyzer",
            "procmon-analyzer",
            "network-analyzer",
            "handle-analyzer",
            "tcpvcon-analyzer",
            "metadata-analyzer",
        ] {
            let payload = load_for_agent(agent, report.path());
            assert!(!payload.has_data, "{} should have no data", agent);
            assert!(payload.text.starts_with("No "), "{}: {}", agent, payload.text);
        }
    }

    #[test]
    fn summary_json_is_compacted() {
        let report = tempdir().unwrap();
        write(
            &report.path().join("artifacts/sysmon/sysmon_summary.json"),
            "{\n  \"sample\": \"hello.exe\",\n  \"total_events\": 3\n}",
        );
        let payload = load_for_agent("sysmon-analyzer", report.path());
        assert!(payload.has_data);
        assert!(!payload.text.contains('\n'));
        assert!(payload.text.contains("\"sample\":\"hello.exe\""));
    }

    #[test]
    fn payloads_never_exceed_the_budget() {
        let report = tempdir().unwrap();
        let big = format!("{{\"blob\": \"{}\"}}", "a".repeat(20_000));
        write(&report.path().join("artifacts/network/network_summary.json"), &big);
        let payload = load_for_agent("network-analyzer", report.path());
        assert!(payload.has_data);
        assert!(payload.text.chars().count() <= MAX_TOOL_PAYLOAD_CHARS);
        assert!(payload.text.ends_with("... [truncated]"));
    }

    #[test]
    fn csv_rows_are_capped_with_marker() {
        let report = tempdir().unwrap();
        let mut raw = String::from("Protocol,Process,PID\n");
        for i in 0..250 {
            raw.push_str(&format!("TCP,sample.exe,{}\n", i));
        }
        write(
            &report.path().join("artifacts/tcpvcon/tcpvcon_snapshot.csv"),
            &raw,
        );
        let payload = load_for_agent("tcpvcon-analyzer", report.path());
        assert!(payload.has_data);
        assert!(payload.text.contains("... truncated (200+ rows)"));
    }

    #[test]
    fn metadata_combines_manifest_and_agent_metadata() {
        let report = tempdir().unwrap();
        write(
            &report.path().join("analysis_manifest.json"),
            r#"{"sample_name":"hello.exe","status":"complete","timeout":60,"files_collected":["a","b"]}"#,
        );
        write(
            &report.path().join("artifacts/metadata.json"),
            r#"{"agent_version":"1.3.0"}"#,
        );
        let payload = load_for_agent("metadata-analyzer", report.path());
        assert!(payload.has_data);
        assert!(payload.text.contains("\"files_collected_count\":2"));
        assert!(payload.text.contains("\"agent_version\":\"1.3.0\""));
    }

    #[test]
    fn empty_handle_snapshot_counts_as_no_data() {
        let report = tempdir().unwrap();
        write(
            &report.path().join("artifacts/handle/handle_snapshot.txt"),
            "   \n",
        );
        let payload = load_for_agent("handle-analyzer", report.path());
        assert!(!payload.has_data);
    }
}
