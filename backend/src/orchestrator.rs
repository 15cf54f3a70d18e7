use crate::agent_client::AgentClient;
use crate::vbox::VBoxClient;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use walkdir::WalkDir;

const POLL_INTERVAL_SECS: u64 = 5;
const POLL_GRACE_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub agent_host: String,
    pub agent_port: u16,
    pub agent_timeout_secs: u64,
    pub vm_name: String,
    pub vboxmanage_path: String,
    pub share_dir: PathBuf,
    pub samples_dir: PathBuf,
    pub reports_dir: PathBuf,
}

/// Stores the result of one complete analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_id: String,
    pub sample_name: String,
    pub sample_sha256: Option<String>,
    pub status: String, // pending | running | complete | failed
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub timeout: u64,
    pub error: Option<String>,
    pub report_dir: Option<String>,
    pub sysmon_events: usize,
    pub files_collected: Vec<String>,
    pub agent_package: Option<String>,
}

fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// New analysis ids sort by start time; the uuid tail keeps same-second
/// submissions distinct.
pub fn new_analysis_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", stamp, &suffix[..8])
}

/// Drives the end-to-end analysis workflow via the in-VM agent.
pub struct SandboxOrchestrator {
    pub config: OrchestratorConfig,
    agent: AgentClient,
    vbox: VBoxClient,
    running: AtomicBool,
    current: Mutex<Option<AnalysisResult>>,
}

impl SandboxOrchestrator {
    pub fn new(config: OrchestratorConfig) -> std::io::Result<Self> {
        for dir in [&config.share_dir, &config.samples_dir, &config.reports_dir] {
            std::fs::create_dir_all(dir)?;
        }
        let agent = AgentClient::new(&config.agent_host, config.agent_port, config.agent_timeout_secs);
        let vbox = VBoxClient::new(config.vboxmanage_path.clone());
        Ok(SandboxOrchestrator {
            config,
            agent,
            vbox,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    pub fn current_analysis(&self) -> Option<AnalysisResult> {
        self.current.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute the full analysis workflow. At most one analysis is in
    /// flight; a concurrent submission gets a conflict error.
    pub async fn run_analysis(
        &self,
        sample_path: &Path,
        timeout: u64,
        screenshot_interval: u64,
    ) -> Result<AnalysisResult, String> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err("Analysis already in progress".to_string());
        }

        let sample_name = sample_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "sample.bin".to_string());
        let analysis_id = new_analysis_id();
        let report_dir = self.config.reports_dir.join(&analysis_id);

        let mut result = AnalysisResult {
            analysis_id: analysis_id.clone(),
            sample_name: sample_name.clone(),
            sample_sha256: None,
            status: "running".to_string(),
            started_at: Some(utc_now_iso()),
            completed_at: None,
            timeout,
            error: None,
            report_dir: Some(report_dir.to_string_lossy().to_string()),
            sysmon_events: 0,
            files_collected: Vec::new(),
            agent_package: None,
        };
        *self.current.lock().unwrap() = Some(result.clone());

        match self
            .drive(sample_path, &sample_name, timeout, screenshot_interval, &report_dir, &mut result)
            .await
        {
            Ok(()) => {
                result.status = "complete".to_string();
                log::info!(
                    "Analysis complete: {} ({} files collected)",
                    analysis_id,
                    result.files_collected.len()
                );
            }
            Err(e) => {
                result.status = "failed".to_string();
                result.error = Some(e.to_string());
                log::error!("Analysis failed: {}", e);
            }
        }
        result.completed_at = Some(utc_now_iso());

        // The manifest is written even for failed runs.
        let manifest_path = report_dir.join("analysis_manifest.json");
        if let Err(e) = std::fs::create_dir_all(&report_dir).and_then(|_| {
            std::fs::write(
                &manifest_path,
                serde_json::to_vec_pretty(&result).unwrap_or_default(),
            )
        }) {
            log::error!("Could not write manifest: {}", e);
        }

        *self.current.lock().unwrap() = Some(result.clone());
        self.running.store(false, Ordering::SeqCst);
        Ok(result)
    }

    async fn drive(
        &self,
        sample_path: &Path,
        sample_name: &str,
        timeout: u64,
        screenshot_interval: u64,
        report_dir: &Path,
        result: &mut AnalysisResult,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(report_dir)?;

        // [1/5] Archive the sample locally, keeping its digest.
        let stored = self
            .config
            .samples_dir
            .join(format!("{}_{}", result.analysis_id, sample_name));
        std::fs::copy(sample_path, &stored)?;
        result.sample_sha256 = Some(hex::encode(Sha256::digest(std::fs::read(&stored)?)));
        log::info!("[1/5] Sample archived: {}", stored.display());

        // [2/5] Stage it in the shared channel under its exact name.
        let share_dest = self.config.share_dir.join(sample_name);
        std::fs::copy(sample_path, &share_dest)?;
        log::info!("[2/5] Sample placed in shared folder: {}", share_dest.display());

        // [3/5] Dispatch the execute command.
        log::info!(
            "[3/5] Requesting agent to execute '{}' (timeout={}s)...",
            sample_name,
            timeout
        );
        let resp = self
            .agent
            .execute(sample_name, timeout, screenshot_interval)
            .await?;
        if resp.get("status").and_then(Value::as_str) == Some("error") {
            let reason = resp
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(format!("Agent rejected execute: {}", reason).into());
        }

        // [4/5] Poll until idle/error while snapshotting the VM display.
        log::info!("[4/5] Polling agent status...");
        let screenshot_dir = report_dir.join("screenshots");
        std::fs::create_dir_all(&screenshot_dir)?;
        let stop = Arc::new(Notify::new());
        let screenshot_task = tokio::spawn(screenshot_loop(
            self.vbox.clone(),
            self.config.vm_name.clone(),
            screenshot_dir.clone(),
            screenshot_interval.max(1),
            Arc::clone(&stop),
        ));

        let poll_outcome = self.poll_until_done(timeout + POLL_GRACE_SECS).await;

        // notify_one buffers a permit, so a loop that is mid-capture still
        // observes the signal at its next wait.
        stop.notify_one();
        if tokio::time::timeout(Duration::from_secs(15), screenshot_task)
            .await
            .is_err()
        {
            log::warn!("Screenshot task did not stop within 15s");
        }
        poll_outcome?;
        log::info!("[4/5] Agent finished execution + collection");

        // [5/5] Retrieve and unpack the result package.
        log::info!("[5/5] Retrieving results from shared folder...");
        let package = find_result_zip(&self.config.share_dir, sample_name);
        match &package {
            Some(zip_path) => {
                result.agent_package = zip_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string());
                result.files_collected = extract_results(zip_path, report_dir)?;
            }
            None => log::warn!("No result zip found in shared folder for '{}'", sample_name),
        }
        result.sysmon_events = count_sysmon_events(report_dir);

        // Merge host-captured screenshots into the file list.
        let mut screenshots: Vec<PathBuf> = std::fs::read_dir(&screenshot_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
            .collect();
        screenshots.sort();
        log::info!("Host screenshots: {} captured", screenshots.len());
        for shot in screenshots {
            if let Ok(rel) = shot.strip_prefix(report_dir) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !result.files_collected.contains(&rel) {
                    result.files_collected.push(rel);
                }
            }
        }

        Ok(())
    }

    async fn poll_until_done(
        &self,
        max_wait: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut elapsed = 0u64;
        while elapsed <= max_wait {
            match self.agent.status().await {
                Ok(resp) => {
                    let data = resp.get("data").cloned().unwrap_or_else(|| json!({}));
                    let status = data
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    log::info!("  Agent status: {} (elapsed={}s)", status, elapsed);
                    if status == "idle" || status == "error" {
                        if status == "error" {
                            let last_err = data
                                .get("last_error")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            log::warn!("Agent reported error: {}", last_err);
                        }
                        return Ok(());
                    }
                }
                Err(e) => log::warn!("  Status poll failed: {} (retrying)", e),
            }
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            elapsed += POLL_INTERVAL_SECS;
        }
        Err(format!("Agent did not finish within {}s", max_wait).into())
    }

    /// Verify the agent is reachable and tools are available.
    pub async fn check_vm_ready(&self) -> Value {
        let mut checks = serde_json::Map::new();
        match self.agent.status().await {
            Ok(resp) => {
                let reachable = resp.get("status").and_then(Value::as_str) == Some("ok");
                checks.insert("agent_reachable".to_string(), json!(reachable));
                let data = resp.get("data").cloned().unwrap_or_else(|| json!({}));
                checks.insert(
                    "agent_status".to_string(),
                    data.get("status").cloned().unwrap_or(json!("unknown")),
                );
                checks.insert(
                    "agent_version".to_string(),
                    data.get("agent_version").cloned().unwrap_or(json!("unknown")),
                );
                if let Some(collectors) = data.get("collectors").and_then(Value::as_array) {
                    for c in collectors {
                        if let Some(name) = c.get("name").and_then(Value::as_str) {
                            checks.insert(
                                format!("collector_{}", name),
                                c.get("available").cloned().unwrap_or(json!(false)),
                            );
                        }
                    }
                }
            }
            Err(e) => {
                checks.insert("agent_reachable".to_string(), json!(false));
                checks.insert("agent_error".to_string(), json!(e.to_string()));
            }
        }
        checks.insert(
            "share_folder".to_string(),
            json!(self.config.share_dir.is_dir()),
        );
        let ready = checks.get("agent_reachable") == Some(&json!(true))
            && checks.get("share_folder") == Some(&json!(true));
        checks.insert("ready".to_string(), json!(ready));
        Value::Object(checks)
    }

    pub async fn cleanup_agent(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.agent.cleanup().await
    }

    pub async fn agent_status(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.agent.status().await
    }

    pub async fn agent_collectors(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.agent.collectors().await
    }

    pub async fn agent_artifacts(&self) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        self.agent.artifacts().await
    }
}

/// Background task: capture the VM display every `interval` seconds until
/// signalled to stop.
async fn screenshot_loop(
    vbox: VBoxClient,
    vm_name: String,
    screenshot_dir: PathBuf,
    interval: u64,
    stop: Arc<Notify>,
) {
    let mut idx: u32 = 0;
    loop {
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("screenshot_{:03}_{}.png", idx, ts);
        let filepath = screenshot_dir.join(&filename);
        match vbox
            .screenshot_png(&vm_name, &filepath.to_string_lossy())
            .await
        {
            Ok(result) if result.returncode == 0 => {
                log::info!("Screenshot {} -> {}", idx, filename)
            }
            Ok(result) => log::warn!(
                "VBoxManage screenshot {} failed (rc={})",
                idx,
                result.returncode
            ),
            Err(e) => log::warn!("Screenshot {} error: {}", idx, e),
        }
        idx += 1;
        tokio::select! {
            _ = stop.notified() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }
}

/// Newest `results_<base>_*.zip` in the share by modification time.
pub fn find_result_zip(share_dir: &Path, sample_name: &str) -> Option<PathBuf> {
    let base = Path::new(sample_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| sample_name.to_string());
    let prefix = format!("results_{}_", base);

    let mut matches: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(share_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if name.starts_with(&prefix) && name.ends_with(".zip") {
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            matches.push((mtime, path));
        }
    }
    matches.sort_by(|a, b| b.0.cmp(&a.0));
    matches.into_iter().next().map(|(_, p)| p)
}

/// Unpack the result archive into the report directory, returning the
/// archive's member names.
pub fn extract_results(
    zip_path: &Path,
    report_dir: &Path,
) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    log::info!("Found result package: {}", zip_path.display());
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .collect();
    archive.extract(report_dir)?;
    log::info!("Extracted {} files to {}", names.len(), report_dir.display());
    Ok(names)
}

/// Best-effort count of events in a recovered `sysmon_events.txt`. The
/// agent normally ships a JSON summary instead, in which case this is 0.
pub fn count_sysmon_events(report_dir: &Path) -> usize {
    for entry in WalkDir::new(report_dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name() == "sysmon_events.txt" {
            if let Ok(contents) = std::fs::read_to_string(entry.path()) {
                return contents.lines().filter(|l| l.contains("Event ID:")).count();
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn analysis_ids_are_ordered_by_start_time() {
        let id = new_analysis_id();
        // YYYYMMDD_HHMMSS_xxxxxxxx
        assert_eq!(id.len(), 8 + 1 + 6 + 1 + 8);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));

        // Lexicographic order of the timestamp prefix is chronological.
        assert!("20260101_000000_ffffffff" < "20260101_000001_00000000");
    }

    #[test]
    fn newest_result_zip_wins() {
        let share = tempdir().unwrap();
        let old = share.path().join("results_hello_20260101_000000.zip");
        let new = share.path().join("results_hello_20260101_000100.zip");
        let other = share.path().join("results_world_20260101_000200.zip");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&other, b"other").unwrap();
        std::fs::write(&new, b"new").unwrap();
        let mtime = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&new).unwrap();
        file.set_modified(mtime).unwrap();

        let found = find_result_zip(share.path(), "hello.exe").unwrap();
        assert_eq!(found, new);
    }

    #[test]
    fn no_matching_zip_yields_none() {
        let share = tempdir().unwrap();
        std::fs::write(share.path().join("results_other_1.zip"), b"x").unwrap();
        assert!(find_result_zip(share.path(), "hello.exe").is_none());
    }

    #[test]
    fn sysmon_event_count_is_best_effort() {
        let report = tempdir().unwrap();
        assert_eq!(count_sysmon_events(report.path()), 0);

        let dir = report.path().join("artifacts").join("sysmon");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("sysmon_events.txt")).unwrap();
        writeln!(f, "Event ID: 1").unwrap();
        writeln!(f, "something else").unwrap();
        writeln!(f, "Event ID: 3").unwrap();
        assert_eq!(count_sysmon_events(report.path()), 2);
    }

    #[test]
    fn extraction_round_trips_archive_members() {
        let work = tempdir().unwrap();
        let zip_path = work.path().join("results_hello_1.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer
            .start_file("artifacts/metadata.json", options)
            .unwrap();
        writer.write_all(b"{\"sample\":\"hello.exe\"}").unwrap();
        writer.finish().unwrap();

        let report = tempdir().unwrap();
        let names = extract_results(&zip_path, report.path()).unwrap();
        assert_eq!(names, vec!["artifacts/metadata.json".to_string()]);
        let extracted =
            std::fs::read_to_string(report.path().join("artifacts/metadata.json")).unwrap();
        assert_eq!(extracted, "{\"sample\":\"hello.exe\"}");
    }
}
