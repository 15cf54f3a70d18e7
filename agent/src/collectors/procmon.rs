use super::{collector_dir, ensure_dir, Collector, CollectorReport};
use crate::procutil::run_with_timeout;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const SEARCH_PATHS: &[&str] = &[
    r"C:\Tools\Procmon64.exe",
    r"C:\Tools\Procmon.exe",
    r"C:\SysinternalsSuite\Procmon64.exe",
    r"C:\SysinternalsSuite\Procmon.exe",
];

const MAX_PATHS_PER_BUCKET: usize = 80;
const MAX_NETWORK_PROCESS_ROWS: usize = 50;

const NOTABLE_FILE_OPS: &[&str] = &["Write", "Create", "Delete", "SetDisposition", "SetRename"];
const NOTABLE_REGISTRY_OPS: &[&str] = &["SetValue", "CreateKey", "DeleteKey", "DeleteValue"];

/// Flushes the Process Monitor backing log, converts it to CSV and reduces
/// it to the operations performed by the sample process.
pub struct ProcmonCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
}

#[derive(Debug, Default, Serialize)]
pub struct ProcmonSummary {
    pub sample: String,
    pub total_rows: usize,
    pub sample_rows: usize,
    pub file_operations: Vec<OpEntry>,
    pub registry_operations: Vec<OpEntry>,
    pub network_operations: Vec<OpEntry>,
    pub process_operations: Vec<OpEntry>,
}

#[derive(Debug, Serialize)]
pub struct OpEntry {
    pub operation: String,
    pub path: String,
}

pub fn find_exe() -> Option<&'static str> {
    SEARCH_PATHS.iter().copied().find(|p| Path::new(p).is_file())
}

impl ProcmonCollector {
    pub fn new(workdir: &Path) -> Self {
        ProcmonCollector {
            output_dir: collector_dir(workdir, "procmon"),
            sample: Mutex::new(None),
        }
    }

    /// Backing file the runner points Procmon at before detonation.
    pub fn backing_file(&self) -> PathBuf {
        self.output_dir.join("procmon.pml")
    }

    async fn collect_inner(&self) -> Result<CollectorReport, Box<dyn std::error::Error + Send + Sync>> {
        let Some(exe) = find_exe() else {
            log::warn!("Procmon not found, skipping");
            return Ok(CollectorReport::unavailable(self.name()));
        };

        // Terminate to flush buffered events; a hung instance gets killed
        // by the timeout and we continue with whatever hit disk.
        let _ = run_with_timeout(exe, &["/Terminate"], 30).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let pml = self.backing_file();
        if !pml.is_file() {
            log::warn!("No Procmon log at {}", pml.display());
            return Ok(CollectorReport::no_data(self.name()));
        }

        let csv_path = self.output_dir.join("procmon.csv");
        let pml_arg = pml.to_string_lossy().to_string();
        let csv_arg = csv_path.to_string_lossy().to_string();
        let _ = run_with_timeout(exe, &["/OpenLog", &pml_arg, "/SaveAs", &csv_arg], 120).await;
        if !csv_path.is_file() {
            return Ok(CollectorReport::no_data(self.name()));
        }

        let sample = self.sample.lock().unwrap().clone().unwrap_or_default();
        let raw = std::fs::read_to_string(&csv_path)?;
        let summary = summarize_csv(&raw, &sample)?;

        ensure_dir(&self.output_dir)?;
        let summary_path = self.output_dir.join("procmon_summary.json");
        std::fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;
        log::info!(
            "Procmon summary written ({} of {} rows matched sample)",
            summary.sample_rows,
            summary.total_rows
        );

        Ok(CollectorReport::ok(
            self.name(),
            vec![
                summary_path.to_string_lossy().to_string(),
                csv_path.to_string_lossy().to_string(),
            ],
        ))
    }
}

#[async_trait]
impl Collector for ProcmonCollector {
    fn name(&self) -> &'static str {
        "procmon"
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn is_available(&self) -> bool {
        find_exe().is_some()
    }

    fn set_sample(&self, base: &str) {
        *self.sample.lock().unwrap() = Some(base.to_string());
    }

    async fn collect(&self) -> CollectorReport {
        match self.collect_inner().await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Procmon collection failed: {}", e);
                CollectorReport::error(self.name(), &e.to_string())
            }
        }
    }
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.eq_ignore_ascii_case(name))
}

struct Bucket {
    entries: Vec<OpEntry>,
    seen: HashSet<String>,
    cap: usize,
}

impl Bucket {
    fn new(cap: usize) -> Self {
        Bucket {
            entries: Vec::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    fn push(&mut self, operation: &str, path: &str) {
        if self.entries.len() >= self.cap || path.is_empty() {
            return;
        }
        if self.seen.insert(path.to_lowercase()) {
            self.entries.push(OpEntry {
                operation: operation.to_string(),
                path: path.to_string(),
            });
        }
    }
}

/// Reduce a Procmon CSV export to the sample's notable operations.
pub fn summarize_csv(
    raw: &str,
    sample_base: &str,
) -> Result<ProcmonSummary, Box<dyn std::error::Error + Send + Sync>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(raw.as_bytes());
    let headers = reader.headers()?.clone();
    let proc_col = column_index(&headers, "Process Name").ok_or("missing 'Process Name' column")?;
    let op_col = column_index(&headers, "Operation").ok_or("missing 'Operation' column")?;
    let path_col = column_index(&headers, "Path").ok_or("missing 'Path' column")?;

    let needle = sample_base.to_lowercase();
    let mut summary = ProcmonSummary {
        sample: sample_base.to_string(),
        ..Default::default()
    };
    let mut files = Bucket::new(MAX_PATHS_PER_BUCKET);
    let mut registry = Bucket::new(MAX_PATHS_PER_BUCKET);
    let mut network = Bucket::new(MAX_NETWORK_PROCESS_ROWS);
    let mut process = Bucket::new(MAX_NETWORK_PROCESS_ROWS);

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => continue, // tolerate ragged rows in tool output
        };
        summary.total_rows += 1;

        let proc_name = record.get(proc_col).unwrap_or("");
        if needle.is_empty() || !proc_name.to_lowercase().contains(&needle) {
            continue;
        }
        summary.sample_rows += 1;

        let op = record.get(op_col).unwrap_or("");
        let path = record.get(path_col).unwrap_or("");

        if op.starts_with("Reg") {
            if NOTABLE_REGISTRY_OPS.iter().any(|n| op.contains(n)) {
                registry.push(op, path);
            }
        } else if op.starts_with("TCP") || op.starts_with("UDP") {
            network.push(op, path);
        } else if op.contains("Process") {
            process.push(op, path);
        } else if NOTABLE_FILE_OPS.iter().any(|n| op.contains(n)) {
            files.push(op, path);
        }
    }

    summary.file_operations = files.entries;
    summary.registry_operations = registry.entries;
    summary.network_operations = network.entries;
    summary.process_operations = process.entries;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_with_rows(rows: &[(&str, &str, &str)]) -> String {
        let mut out = String::from(
            "\"Time of Day\",\"Process Name\",\"PID\",\"Operation\",\"Path\",\"Result\",\"Detail\"\n",
        );
        for (proc_name, op, path) in rows {
            out.push_str(&format!(
                "\"10:00:00\",\"{}\",\"1234\",\"{}\",\"{}\",\"SUCCESS\",\"\"\n",
                proc_name, op, path
            ));
        }
        out
    }

    #[test]
    fn filters_to_sample_rows_and_buckets() {
        let raw = csv_with_rows(&[
            ("sample.exe", "WriteFile", r"C:\Temp\drop.bin"),
            ("sample.exe", "RegSetValue", r"HKCU\Software\Run\upd"),
            ("sample.exe", "TCP Connect", "203.0.113.9:4444"),
            ("sample.exe", "Process Create", r"C:\Windows\System32\cmd.exe"),
            ("sample.exe", "ReadFile", r"C:\Windows\System32\kernel32.dll"),
            ("explorer.exe", "WriteFile", r"C:\Temp\other.bin"),
        ]);
        let summary = summarize_csv(&raw, "sample.exe").unwrap();
        assert_eq!(summary.total_rows, 6);
        assert_eq!(summary.sample_rows, 5);
        assert_eq!(summary.file_operations.len(), 1);
        assert_eq!(summary.registry_operations.len(), 1);
        assert_eq!(summary.network_operations.len(), 1);
        assert_eq!(summary.process_operations.len(), 1);
        // ReadFile is not a notable file operation.
        assert!(summary
            .file_operations
            .iter()
            .all(|e| e.path != r"C:\Windows\System32\kernel32.dll"));
    }

    #[test]
    fn buckets_deduplicate_and_cap() {
        let mut rows = Vec::new();
        let paths: Vec<String> = (0..100).map(|i| format!(r"C:\Temp\f{}.bin", i)).collect();
        for path in &paths {
            rows.push(("sample.exe", "CreateFile", path.as_str()));
            rows.push(("sample.exe", "WriteFile", path.as_str())); // duplicate path
        }
        let raw = csv_with_rows(&rows);
        let summary = summarize_csv(&raw, "sample.exe").unwrap();
        assert_eq!(summary.file_operations.len(), MAX_PATHS_PER_BUCKET);
        let unique: HashSet<_> = summary.file_operations.iter().map(|e| &e.path).collect();
        assert_eq!(unique.len(), MAX_PATHS_PER_BUCKET);
    }

    #[test]
    fn network_bucket_caps_at_fifty() {
        let addrs: Vec<String> = (0..70).map(|i| format!("203.0.113.{}:80", i)).collect();
        let rows: Vec<(&str, &str, &str)> = addrs
            .iter()
            .map(|a| ("sample.exe", "TCP Send", a.as_str()))
            .collect();
        let raw = csv_with_rows(&rows);
        let summary = summarize_csv(&raw, "sample.exe").unwrap();
        assert_eq!(summary.network_operations.len(), MAX_NETWORK_PROCESS_ROWS);
    }

    #[test]
    fn missing_columns_is_an_error() {
        let raw = "\"A\",\"B\"\n\"1\",\"2\"\n";
        assert!(summarize_csv(raw, "sample.exe").is_err());
    }
}
