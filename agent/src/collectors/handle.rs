use super::{collector_dir, ensure_dir, Collector, CollectorReport};
use crate::procutil::run_with_timeout;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SEARCH_PATHS: &[&str] = &[
    r"C:\Tools\handle64.exe",
    r"C:\Tools\handle.exe",
    r"C:\SysinternalsSuite\handle64.exe",
    r"C:\SysinternalsSuite\handle.exe",
];

/// One-shot listing of open file/registry/mutex handles for the sample
/// process, system-wide when no sample is set.
pub struct HandleCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
}

fn find_exe() -> Option<&'static str> {
    SEARCH_PATHS.iter().copied().find(|p| Path::new(p).is_file())
}

impl HandleCollector {
    pub fn new(workdir: &Path) -> Self {
        HandleCollector {
            output_dir: collector_dir(workdir, "handle"),
            sample: Mutex::new(None),
        }
    }

    async fn collect_inner(&self) -> Result<CollectorReport, Box<dyn std::error::Error + Send + Sync>> {
        let Some(exe) = find_exe() else {
            log::warn!("Handle tool not found, skipping");
            return Ok(CollectorReport::unavailable(self.name()));
        };

        let sample = self.sample.lock().unwrap().clone();
        let args = snapshot_args(sample.as_deref());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let out = run_with_timeout(exe, &arg_refs, 30).await?;
        if !out.success() {
            return Ok(CollectorReport::error(self.name(), out.stderr.trim()));
        }
        if out.stdout.trim().is_empty() {
            return Ok(CollectorReport::no_data(self.name()));
        }

        ensure_dir(&self.output_dir)?;
        let snapshot_path = self.output_dir.join("handle_snapshot.txt");
        std::fs::write(&snapshot_path, &out.stdout)?;
        log::info!("Handle snapshot written");

        Ok(CollectorReport::ok(
            self.name(),
            vec![snapshot_path.to_string_lossy().to_string()],
        ))
    }
}

#[async_trait]
impl Collector for HandleCollector {
    fn name(&self) -> &'static str {
        "handle"
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
                log::error!("Handle collection failed: {}", e);
                CollectorReport::error(self.name(), &e.to_string())
            }
        }
    }
}

/// Handle tool arguments: all handles, no banner, scoped to the sample
/// process when one is set.
fn snapshot_args(sample_base: Option<&str>) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "-nobanner".to_string()];
    if let Some(base) = sample_base {
        args.push("-p".to_string());
        args.push(base.to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_scope_to_sample_when_set() {
        assert_eq!(
            snapshot_args(Some("sample.exe")),
            vec!["-a", "-nobanner", "-p", "sample.exe"]
        );
    }

    #[test]
    fn args_are_system_wide_without_sample() {
        assert_eq!(snapshot_args(None), vec!["-a", "-nobanner"]);
    }

    #[test]
    fn set_sample_flows_into_args() {
        let dir = tempfile::tempdir().unwrap();
        let collector = HandleCollector::new(dir.path());
        collector.set_sample("dropper.exe");
        let sample = collector.sample.lock().unwrap().clone();
        assert_eq!(
            snapshot_args(sample.as_deref()),
            vec!["-a", "-nobanner", "-p", "dropper.exe"]
        );
    }
}
