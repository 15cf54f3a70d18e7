use super::{collector_dir, ensure_dir, Collector, CollectorReport};
use crate::procutil::run_with_timeout;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SEARCH_PATHS: &[&str] = &[
    r"C:\Tools\Tcpvcon64.exe",
    r"C:\Tools\Tcpvcon.exe",
    r"C:\SysinternalsSuite\Tcpvcon64.exe",
    r"C:\SysinternalsSuite\Tcpvcon.exe",
];

/// One-shot snapshot of active TCP/UDP connections, reduced to rows that
/// mention the sample.
pub struct TcpvconCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
}

fn find_exe() -> Option<&'static str> {
    SEARCH_PATHS.iter().copied().find(|p| Path::new(p).is_file())
}

impl TcpvconCollector {
    pub fn new(workdir: &Path) -> Self {
        TcpvconCollector {
            output_dir: collector_dir(workdir, "tcpvcon"),
            sample: Mutex::new(None),
        }
    }

    async fn collect_inner(&self) -> Result<CollectorReport, Box<dyn std::error::Error + Send + Sync>> {
        let Some(exe) = find_exe() else {
            log::warn!("Tcpvcon not found, skipping");
            return Ok(CollectorReport::unavailable(self.name()));
        };

        let out = run_with_timeout(exe, &["-a", "-c", "-nobanner"], 30).await?;
        if !out.success() {
            return Ok(CollectorReport::error(self.name(), out.stderr.trim()));
        }
        if out.stdout.trim().is_empty() {
            return Ok(CollectorReport::no_data(self.name()));
        }

        let sample = self.sample.lock().unwrap().clone().unwrap_or_default();
        let filtered = filter_snapshot(&out.stdout, &sample);

        ensure_dir(&self.output_dir)?;
        let snapshot_path = self.output_dir.join("tcpvcon_snapshot.csv");
        std::fs::write(&snapshot_path, filtered)?;
        log::info!("Connection snapshot written");

        Ok(CollectorReport::ok(
            self.name(),
            vec![snapshot_path.to_string_lossy().to_string()],
        ))
    }
}

#[async_trait]
impl Collector for TcpvconCollector {
    fn name(&self) -> &'static str {
        "tcpvcon"
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
                log::error!("Tcpvcon collection failed: {}", e);
                CollectorReport::error(self.name(), &e.to_string())
            }
        }
    }
}

/// Keep the header row plus every row mentioning the sample basename
/// (case-insensitive). With no sample set, the full snapshot is kept.
pub fn filter_snapshot(raw: &str, sample_base: &str) -> String {
    if sample_base.is_empty() {
        return raw.to_string();
    }
    let needle = sample_base.to_lowercase();
    let mut lines = raw.lines();
    let mut out = Vec::new();
    if let Some(header) = lines.next() {
        out.push(header.to_string());
    }
    for line in lines {
        if line.to_lowercase().contains(&needle) {
            out.push(line.to_string());
        }
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = "Protocol,Process,PID,State,Local,Remote\n\
TCP,Sample.EXE,1234,ESTABLISHED,10.0.2.15:49713,203.0.113.9:4444\n\
TCP,svchost.exe,900,LISTENING,0.0.0.0:135,0.0.0.0:0\n\
UDP,sample.exe,1234,,10.0.2.15:5353,*:*\n";

    #[test]
    fn keeps_header_and_case_insensitive_matches() {
        let out = filter_snapshot(SNAPSHOT, "sample.exe");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Protocol"));
        assert!(lines[1].contains("Sample.EXE"));
        assert!(lines[2].contains("sample.exe"));
    }

    #[test]
    fn empty_sample_keeps_everything() {
        assert_eq!(filter_snapshot(SNAPSHOT, ""), SNAPSHOT);
    }
}
