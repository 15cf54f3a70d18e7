use super::{collector_dir, ensure_dir, Collector, CollectorReport, StartConfig};
use crate::procutil::{run_with_timeout, spawn_detached, stop_child};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Packet capture around the detonation window.
///
/// `start` launches tshark writing to `capture.pcap`; `stop` terminates it;
/// `collect` runs three read-side queries over the capture and emits a
/// summary JSON. A failing query becomes a `<query>_error` field instead of
/// failing the collector.
pub struct NetworkCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
    capture: Mutex<Option<tokio::process::Child>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequest {
    pub host: String,
    pub uri: String,
    pub method: String,
}

impl NetworkCollector {
    pub fn new(workdir: &Path) -> Self {
        NetworkCollector {
            output_dir: collector_dir(workdir, "network"),
            sample: Mutex::new(None),
            capture: Mutex::new(None),
        }
    }

    fn pcap_path(&self) -> PathBuf {
        self.output_dir.join("capture.pcap")
    }

    async fn collect_inner(&self) -> Result<CollectorReport, Box<dyn std::error::Error + Send + Sync>> {
        let pcap = self.pcap_path();
        if !pcap.is_file() {
            if !self.is_available().await {
                log::warn!("tshark not available, skipping network collection");
                return Ok(CollectorReport::unavailable(self.name()));
            }
            log::warn!("No capture file at {}", pcap.display());
            return Ok(CollectorReport::no_data(self.name()));
        }

        let pcap_arg = pcap.to_string_lossy().to_string();
        let sample = self.sample.lock().unwrap().clone().unwrap_or_default();
        let mut summary = serde_json::Map::new();
        summary.insert("sample".to_string(), json!(sample));

        match run_with_timeout("tshark", &["-r", &pcap_arg, "-q", "-z", "conv,tcp"], 60).await {
            Ok(out) if out.success() => {
                summary.insert(
                    "tcp_conversations".to_string(),
                    json!(parse_conversation_lines(&out.stdout)),
                );
            }
            Ok(out) => {
                summary.insert("tcp_conversations_error".to_string(), json!(out.stderr.trim()));
            }
            Err(e) => {
                summary.insert("tcp_conversations_error".to_string(), json!(e.to_string()));
            }
        }

        match run_with_timeout(
            "tshark",
            &["-r", &pcap_arg, "-T", "fields", "-e", "dns.qry.name"],
            60,
        )
        .await
        {
            Ok(out) if out.success() => {
                summary.insert("dns_queries".to_string(), json!(parse_dns_names(&out.stdout)));
            }
            Ok(out) => {
                summary.insert("dns_queries_error".to_string(), json!(out.stderr.trim()));
            }
            Err(e) => {
                summary.insert("dns_queries_error".to_string(), json!(e.to_string()));
            }
        }

        match run_with_timeout(
            "tshark",
            &[
                "-r",
                &pcap_arg,
                "-Y",
                "http.request",
                "-T",
                "fields",
                "-e",
                "http.host",
                "-e",
                "http.request.uri",
                "-e",
                "http.request.method",
            ],
            60,
        )
        .await
        {
            Ok(out) if out.success() => {
                summary.insert(
                    "http_requests".to_string(),
                    json!(parse_http_requests(&out.stdout)),
                );
            }
            Ok(out) => {
                summary.insert("http_requests_error".to_string(), json!(out.stderr.trim()));
            }
            Err(e) => {
                summary.insert("http_requests_error".to_string(), json!(e.to_string()));
            }
        }

        ensure_dir(&self.output_dir)?;
        let summary_path = self.output_dir.join("network_summary.json");
        std::fs::write(
            &summary_path,
            serde_json::to_vec_pretty(&serde_json::Value::Object(summary))?,
        )?;
        log::info!("Network summary written");

        Ok(CollectorReport::ok(
            self.name(),
            vec![
                summary_path.to_string_lossy().to_string(),
                pcap.to_string_lossy().to_string(),
            ],
        ))
    }
}

#[async_trait]
impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn is_available(&self) -> bool {
        match run_with_timeout("tshark", &["--version"], 10).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    fn set_sample(&self, base: &str) {
        *self.sample.lock().unwrap() = Some(base.to_string());
    }

    fn has_lifecycle(&self) -> bool {
        true
    }

    async fn start(
        &self,
        _cfg: &StartConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        ensure_dir(&self.output_dir)?;
        let pcap_arg = self.pcap_path().to_string_lossy().to_string();
        let iface = std::env::var("CAPTURE_INTERFACE").unwrap_or_else(|_| "1".to_string());
        let child = spawn_detached("tshark", &["-i", &iface, "-q", "-w", &pcap_arg])?;
        *self.capture.lock().unwrap() = Some(child);
        log::info!("Packet capture started on interface {}", iface);
        Ok(())
    }

    async fn stop(&self) {
        let child = self.capture.lock().unwrap().take();
        if let Some(child) = child {
            stop_child(child).await;
            log::info!("Packet capture stopped");
        }
    }

    async fn collect(&self) -> CollectorReport {
        match self.collect_inner().await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Network collection failed: {}", e);
                CollectorReport::error(self.name(), &e.to_string())
            }
        }
    }
}

/// Keep the data lines of `tshark -z conv,tcp`, dropping banner rules.
pub fn parse_conversation_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('='))
        .map(str::to_string)
        .collect()
}

/// Deduplicated, sorted DNS query names.
pub fn parse_dns_names(stdout: &str) -> Vec<String> {
    let set: BTreeSet<String> = stdout
        .lines()
        .flat_map(|l| l.split(',')) // multiple queries per packet
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    set.into_iter().collect()
}

/// Tab-separated `host\turi\tmethod` field lines.
pub fn parse_http_requests(stdout: &str) -> Vec<HttpRequest> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let mut parts = l.split('\t');
            HttpRequest {
                host: parts.next().unwrap_or("").trim().to_string(),
                uri: parts.next().unwrap_or("").trim().to_string(),
                method: parts.next().unwrap_or("").trim().to_string(),
            }
        })
        .collect()
}
