use crate::collectors::{self, Collector, CollectorInfo, CollectorReport, StartConfig};
use crate::package;
use crate::procutil::run_with_timeout;
use crate::state::AgentState;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessExt, System, SystemExt};
use walkdir::WalkDir;

const SYSMON_CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";
const DETONATE_TASK: &str = "GlasslabDetonate";
const PROCMON_WARMUP_SECS: u64 = 3;

#[derive(Debug, Serialize)]
pub struct ExecutionOutcome {
    pub status: String, // complete | failed | not_found
    pub sample: String,
    pub timeout: u64,
    pub collection: Vec<CollectorReport>,
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn failed(status: &str, sample: &str, timeout: u64, error: String) -> Self {
        ExecutionOutcome {
            status: status.to_string(),
            sample: sample.to_string(),
            timeout,
            collection: Vec::new(),
            package: None,
            error: Some(error),
        }
    }
}

/// Drives detonation and artifact collection inside the VM.
pub struct GuestAgent {
    pub share_path: PathBuf,
    pub workdir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub samples_dir: PathBuf,
    pub platform: String,
    pub state: AgentState,
    pub collectors: Vec<Arc<dyn Collector>>,
}

impl GuestAgent {
    pub fn new(
        share_path: PathBuf,
        workdir: PathBuf,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let artifacts_dir = workdir.join("artifacts");
        let samples_dir = workdir.join("samples");
        std::fs::create_dir_all(&artifacts_dir)?;
        std::fs::create_dir_all(&samples_dir)?;

        let collectors = collectors::build_registry(&workdir);
        let platform = System::new()
            .long_os_version()
            .unwrap_or_else(|| "unknown".to_string());

        log::info!(
            "Agent initialised  share={}  workdir={}",
            share_path.display(),
            workdir.display()
        );
        log::info!(
            "Collectors: {}",
            collectors
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(GuestAgent {
            share_path,
            workdir,
            artifacts_dir,
            samples_dir,
            platform,
            state: AgentState::new(),
            collectors,
        })
    }

    pub async fn collector_info(&self) -> Vec<CollectorInfo> {
        let mut out = Vec::with_capacity(self.collectors.len());
        for c in &self.collectors {
            out.push(CollectorInfo {
                name: c.name().to_string(),
                available: c.is_available().await,
            });
        }
        out
    }

    /// Every file under the artifacts directory, relative to it.
    pub fn list_artifacts(&self) -> Vec<String> {
        let mut result = Vec::new();
        for entry in WalkDir::new(&self.artifacts_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.artifacts_dir) {
                    result.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        result.sort();
        result
    }

    /// Run the detonation sequence. The caller has already moved the state
    /// to `executing`; this returns it to `idle` or `error`.
    pub async fn execute_sample(
        &self,
        filename: &str,
        timeout_secs: u64,
        screenshot_interval: u64,
    ) -> ExecutionOutcome {
        log::info!(
            "Execution start: {} (timeout={}s interval={}s)",
            filename,
            timeout_secs,
            screenshot_interval
        );

        let sample_src = self.share_path.join(filename);
        if !sample_src.is_file() {
            let msg = format!("Sample not found in shared folder: {}", filename);
            log::error!("{}", msg);
            self.state.set_error(&msg);
            return ExecutionOutcome::failed("not_found", filename, timeout_secs, msg);
        }

        match self
            .detonate(filename, &sample_src, timeout_secs, screenshot_interval)
            .await
        {
            Ok(outcome) => {
                self.state.set_idle();
                log::info!("Execution complete: {}", filename);
                outcome
            }
            Err(e) => {
                let msg = e.to_string();
                log::error!("Execution failed: {}", msg);
                self.state.set_error(&msg);
                ExecutionOutcome::failed("failed", filename, timeout_secs, msg)
            }
        }
    }

    async fn detonate(
        &self,
        filename: &str,
        sample_src: &Path,
        timeout_secs: u64,
        screenshot_interval: u64,
    ) -> Result<ExecutionOutcome, Box<dyn std::error::Error + Send + Sync>> {
        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());

        // Leftovers from a previous run would pollute the process filters.
        self.kill_matching_processes(&base);

        let sample_dst = self.samples_dir.join(&base);
        std::fs::copy(sample_src, &sample_dst)?;
        log::info!("Sample copied -> {}", sample_dst.display());

        for collector in &self.collectors {
            collector.set_sample(&base);
        }

        if let Err(e) = run_with_timeout("wevtutil", &["cl", SYSMON_CHANNEL], 30).await {
            log::warn!("Could not clear Sysmon channel: {}", e);
        }

        self.start_procmon().await;

        let cfg = StartConfig {
            screenshot_interval,
        };
        for collector in &self.collectors {
            if collector.has_lifecycle() {
                if let Err(e) = collector.start(&cfg).await {
                    log::warn!("Collector {} failed to start: {}", collector.name(), e);
                }
            }
        }

        self.launch_sample(&sample_dst).await;

        log::info!("Waiting {}s for sample behaviour...", timeout_secs);
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;

        for collector in &self.collectors {
            if collector.has_lifecycle() {
                collector.stop().await;
            }
        }

        self.state.set_collecting();
        let collection = self.run_collectors().await;

        let package = package::package_results(
            &self.workdir,
            &self.share_path,
            filename,
            &collection,
        )?;

        Ok(ExecutionOutcome {
            status: "complete".to_string(),
            sample: filename.to_string(),
            timeout: timeout_secs,
            collection,
            package,
            error: None,
        })
    }

    /// Run every collector without executing a sample. The caller has
    /// already verified no execution is in flight.
    pub async fn collect_only(&self) -> Vec<CollectorReport> {
        self.state.set_collecting();
        let results = self.run_collectors().await;
        self.state.set_idle();
        results
    }

    async fn run_collectors(&self) -> Vec<CollectorReport> {
        let mut results = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            log::info!("Running collector: {}", collector.name());
            results.push(collector.collect().await);
        }
        results
    }

    /// Remove collected artifacts, recreating an empty directory.
    /// Locked entries are left behind with a warning.
    pub fn cleanup(&self) {
        if self.artifacts_dir.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&self.artifacts_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let removed = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    if let Err(e) = removed {
                        log::warn!("Leaving locked entry {}: {}", path.display(), e);
                    }
                }
            }
        }
        if let Err(e) = std::fs::create_dir_all(&self.artifacts_dir) {
            log::error!("Could not recreate artifacts dir: {}", e);
        }
        log::info!("Artifacts cleaned up");
    }

    fn kill_matching_processes(&self, base: &str) {
        let needle = base.to_lowercase();
        let mut sys = System::new_all();
        sys.refresh_processes();
        for process in sys.processes().values() {
            if process.name().to_lowercase().contains(&needle) {
                log::info!("Terminating leftover process {}", process.name());
                process.kill();
            }
        }
    }

    async fn start_procmon(&self) {
        let Some(exe) = collectors::procmon::find_exe() else {
            log::warn!("Procmon not installed, process activity will be missing");
            return;
        };
        // A stale instance would hold the backing file open.
        let _ = run_with_timeout("taskkill", &["/F", "/IM", "Procmon64.exe"], 10).await;
        let _ = run_with_timeout("taskkill", &["/F", "/IM", "Procmon.exe"], 10).await;

        let backing = self.artifacts_dir.join("procmon").join("procmon.pml");
        if let Err(e) = std::fs::create_dir_all(self.artifacts_dir.join("procmon")) {
            log::warn!("Could not create procmon dir: {}", e);
            return;
        }
        let backing_arg = backing.to_string_lossy().to_string();
        match crate::procutil::spawn_detached(
            exe,
            &[
                "/AcceptEula",
                "/Quiet",
                "/Minimized",
                "/BackingFile",
                &backing_arg,
            ],
        ) {
            Ok(_) => {
                log::info!("Procmon started -> {}", backing.display());
                tokio::time::sleep(Duration::from_secs(PROCMON_WARMUP_SECS)).await;
            }
            Err(e) => log::warn!("Procmon failed to start: {}", e),
        }
    }

    /// Launch the sample, preferring an interactive scheduled task so its
    /// GUI lands on the visible desktop for screen capture. All mechanisms
    /// failing is logged but does not abort the run; capture and
    /// collection still produce a (mostly empty) result package.
    async fn launch_sample(&self, sample_path: &Path) {
        let path_arg = sample_path.to_string_lossy().to_string();

        let created = run_with_timeout(
            "schtasks",
            &[
                "/Create", "/TN", DETONATE_TASK, "/TR", &path_arg, "/SC", "ONCE", "/ST",
                "00:00", "/IT", "/RL", "HIGHEST", "/F",
            ],
            30,
        )
        .await;
        if matches!(created, Ok(ref out) if out.success()) {
            let ran = run_with_timeout("schtasks", &["/Run", "/TN", DETONATE_TASK], 30).await;
            let _ = run_with_timeout("schtasks", &["/Delete", "/TN", DETONATE_TASK, "/F"], 30).await;
            if matches!(ran, Ok(ref out) if out.success()) {
                log::info!("Sample launched via interactive scheduled task");
                return;
            }
        }

        if let Ok(out) = run_with_timeout("cmd", &["/C", "start", "", &path_arg], 30).await {
            if out.success() {
                log::info!("Sample launched via detached shell");
                return;
            }
        }

        match crate::procutil::spawn_detached(&path_arg, &[]) {
            Ok(_) => log::info!("Sample launched directly"),
            Err(e) => log::error!("All launch mechanisms failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn agent_in(dirs: (&Path, &Path)) -> GuestAgent {
        GuestAgent::new(dirs.0.to_path_buf(), dirs.1.to_path_buf()).unwrap()
    }

    #[test]
    fn cleanup_leaves_empty_artifacts_dir_and_is_idempotent() {
        let share = tempdir().unwrap();
        let work = tempdir().unwrap();
        let agent = agent_in((share.path(), work.path()));

        std::fs::create_dir_all(agent.artifacts_dir.join("sysmon")).unwrap();
        std::fs::write(agent.artifacts_dir.join("sysmon").join("x.json"), b"{}").unwrap();

        agent.cleanup();
        assert!(agent.artifacts_dir.is_dir());
        assert!(agent.list_artifacts().is_empty());

        agent.cleanup();
        assert!(agent.artifacts_dir.is_dir());
        assert!(agent.list_artifacts().is_empty());
    }

    #[test]
    fn list_artifacts_is_relative_and_sorted() {
        let share = tempdir().unwrap();
        let work = tempdir().unwrap();
        let agent = agent_in((share.path(), work.path()));

        std::fs::create_dir_all(agent.artifacts_dir.join("sysmon")).unwrap();
        std::fs::create_dir_all(agent.artifacts_dir.join("handle")).unwrap();
        std::fs::write(agent.artifacts_dir.join("sysmon/sysmon_summary.json"), b"{}").unwrap();
        std::fs::write(agent.artifacts_dir.join("handle/handle_snapshot.txt"), b"x").unwrap();

        assert_eq!(
            agent.list_artifacts(),
            vec![
                "handle/handle_snapshot.txt".to_string(),
                "sysmon/sysmon_summary.json".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn missing_sample_sets_error_state() {
        let share = tempdir().unwrap();
        let work = tempdir().unwrap();
        let agent = agent_in((share.path(), work.path()));

        agent.state.try_begin_execution("ghost.exe").unwrap();
        let outcome = agent.execute_sample("ghost.exe", 1, 2).await;
        assert_eq!(outcome.status, "not_found");
        let snap = agent.state.snapshot();
        assert_eq!(snap.status, "error");
        assert!(snap.last_error.unwrap().contains("ghost.exe"));
    }

    #[tokio::test]
    async fn zero_byte_sample_completes_and_exports_package() {
        let share = tempdir().unwrap();
        let work = tempdir().unwrap();
        let agent = agent_in((share.path(), work.path()));
        std::fs::write(share.path().join("hello.exe"), b"").unwrap();

        agent.state.try_begin_execution("hello.exe").unwrap();
        let outcome = agent.execute_sample("hello.exe", 1, 2).await;

        assert_eq!(outcome.status, "complete");
        assert_eq!(outcome.collection.len(), 6);
        let package = outcome.package.expect("package produced");
        assert!(package.starts_with("results_hello_"));
        assert!(share.path().join(&package).is_file());

        let snap = agent.state.snapshot();
        assert_eq!(snap.status, "idle");
        assert_eq!(snap.execution_count, 1);
    }

    #[tokio::test]
    async fn collect_only_returns_to_idle() {
        let share = tempdir().unwrap();
        let work = tempdir().unwrap();
        let agent = agent_in((share.path(), work.path()));

        let results = agent.collect_only().await;
        assert_eq!(results.len(), 6);
        assert_eq!(agent.state.snapshot().status, "idle");
        assert_eq!(agent.state.snapshot().execution_count, 1);
    }
}
