pub mod handle;
pub mod network;
pub mod procmon;
pub mod screenshots;
pub mod sysmon;
pub mod tcpvcon;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options handed to lifecycle collectors when capture begins.
#[derive(Debug, Clone)]
pub struct StartConfig {
    pub screenshot_interval: u64,
}

/// What a single collector produced for this run.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorReport {
    pub collector: String,
    pub status: String, // ok | no_data | unavailable | error | not_implemented
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectorReport {
    pub fn ok(name: &str, files: Vec<String>) -> Self {
        CollectorReport {
            collector: name.to_string(),
            status: "ok".to_string(),
            files,
            error: None,
        }
    }

    pub fn no_data(name: &str) -> Self {
        CollectorReport {
            collector: name.to_string(),
            status: "no_data".to_string(),
            files: Vec::new(),
            error: None,
        }
    }

    pub fn unavailable(name: &str) -> Self {
        CollectorReport {
            collector: name.to_string(),
            status: "unavailable".to_string(),
            files: Vec::new(),
            error: None,
        }
    }

    pub fn error(name: &str, message: &str) -> Self {
        CollectorReport {
            collector: name.to_string(),
            status: "error".to_string(),
            files: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

/// One named unit of behavioral evidence gathering.
///
/// `collect` must never bubble an error out of the agent run: internal
/// failures are wrapped into an `error` report and the next collector
/// proceeds. Only collectors that run concurrently with the sample
/// (network capture, screenshots) override the lifecycle hooks.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Directory this collector writes its artifacts into. Created lazily.
    fn output_dir(&self) -> &Path;

    async fn is_available(&self) -> bool;

    /// Record the executable basename of the sample under analysis,
    /// used for filtering tool output down to sample activity.
    fn set_sample(&self, base: &str);

    fn has_lifecycle(&self) -> bool {
        false
    }

    async fn start(
        &self,
        _cfg: &StartConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn collect(&self) -> CollectorReport;
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorInfo {
    pub name: String,
    pub available: bool,
}

/// The fixed, ordered collector bank.
pub fn build_registry(workdir: &Path) -> Vec<Arc<dyn Collector>> {
    vec![
        Arc::new(sysmon::SysmonCollector::new(workdir)) as Arc<dyn Collector>,
        Arc::new(procmon::ProcmonCollector::new(workdir)),
        Arc::new(network::NetworkCollector::new(workdir)),
        Arc::new(screenshots::ScreenshotCollector::new(workdir)),
        Arc::new(tcpvcon::TcpvconCollector::new(workdir)),
        Arc::new(handle::HandleCollector::new(workdir)),
    ]
}

pub(crate) fn collector_dir(workdir: &Path, name: &str) -> PathBuf {
    workdir.join("artifacts").join(name)
}

pub(crate) fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Truncate on a character boundary, never mid-codepoint.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn registry_order_is_fixed() {
        let dir = tempdir().unwrap();
        let names: Vec<&str> = build_registry(dir.path()).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["sysmon", "procmon", "network", "screenshots", "tcpvcon", "handle"]
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 10), "ab");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
