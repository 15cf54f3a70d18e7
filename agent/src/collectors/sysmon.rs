use super::{collector_dir, ensure_dir, Collector, CollectorReport};
use crate::procutil::run_with_timeout;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";
const MAX_IMAGES_LOADED: usize = 50;

/// Exports the Sysmon event log with `wevtutil`, reduces it to the sample
/// process tree, and writes a categorized `sysmon_summary.json`.
pub struct SysmonCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SysmonEvent {
    pub event_id: u32,
    pub process_id: u32,
    pub parent_process_id: u32,
    pub image: String,
    pub command_line: String,
    /// Target of the operation: file path, registry object, loaded image,
    /// DNS query name or network destination, depending on the event id.
    pub target: String,
    pub operation: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SysmonSummary {
    pub sample: String,
    pub total_events: usize,
    pub sample_events: usize,
    pub processes_created: Vec<ProcessEntry>,
    pub network_connections: Vec<NetworkEntry>,
    pub dns_queries: Vec<DnsEntry>,
    pub files_created: Vec<FileEntry>,
    pub registry_events: Vec<RegistryEntry>,
    pub images_loaded: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub image: String,
    pub command_line: String,
}

#[derive(Debug, Serialize)]
pub struct NetworkEntry {
    pub pid: u32,
    pub image: String,
    pub destination: String,
}

#[derive(Debug, Serialize)]
pub struct DnsEntry {
    pub pid: u32,
    pub image: String,
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub pid: u32,
    pub image: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct RegistryEntry {
    pub pid: u32,
    pub image: String,
    pub operation: String,
    pub key: String,
}

impl SysmonCollector {
    pub fn new(workdir: &Path) -> Self {
        SysmonCollector {
            output_dir: collector_dir(workdir, "sysmon"),
            sample: Mutex::new(None),
        }
    }

    async fn collect_inner(&self) -> Result<CollectorReport, Box<dyn std::error::Error + Send + Sync>> {
        if !self.is_available().await {
            log::warn!("Sysmon channel not available, skipping");
            return Ok(CollectorReport::unavailable(self.name()));
        }

        let out = run_with_timeout("wevtutil", &["qe", CHANNEL, "/f:xml"], 120).await?;
        if !out.success() {
            return Ok(CollectorReport::error(self.name(), out.stderr.trim()));
        }

        let sample = self.sample.lock().unwrap().clone().unwrap_or_default();
        let events = parse_event_stream(&out.stdout);
        if events.is_empty() {
            log::info!("No Sysmon events in channel");
            return Ok(CollectorReport::no_data(self.name()));
        }

        let summary = summarize_events(&events, &sample);
        ensure_dir(&self.output_dir)?;
        let summary_path = self.output_dir.join("sysmon_summary.json");
        std::fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;
        log::info!(
            "Sysmon summary written ({} of {} events matched sample)",
            summary.sample_events,
            summary.total_events
        );

        Ok(CollectorReport::ok(
            self.name(),
            vec![summary_path.to_string_lossy().to_string()],
        ))
    }
}

#[async_trait]
impl Collector for SysmonCollector {
    fn name(&self) -> &'static str {
        "sysmon"
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn is_available(&self) -> bool {
        match run_with_timeout("wevtutil", &["gl", CHANNEL], 10).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    fn set_sample(&self, base: &str) {
        *self.sample.lock().unwrap() = Some(base.to_string());
    }

    async fn collect(&self) -> CollectorReport {
        match self.collect_inner().await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Sysmon collection failed: {}", e);
                CollectorReport::error(self.name(), &e.to_string())
            }
        }
    }
}

// ─── XML field scanning ──────────────────────────────────────────────────
//
// Sysmon event XML is flat and predictable; plain string scanning beats a
// full XML parser here and tolerates the malformed fragments wevtutil
// occasionally emits.

fn xml_tag_inner(xml: &str, tag_name: &str) -> String {
    let start_patterns = [format!("<{}>", tag_name), format!("<{} ", tag_name)];
    for start_tag in start_patterns {
        if let Some(start_pos) = xml.find(&start_tag) {
            if let Some(content_offset) = xml[start_pos..].find('>') {
                let content_start = start_pos + content_offset + 1;
                let end_tag = format!("</{}", tag_name);
                if let Some(end_pos) = xml[content_start..].find(&end_tag) {
                    return xml[content_start..content_start + end_pos].trim().to_string();
                }
            }
        }
    }
    String::new()
}

fn data_field(xml: &str, field_name: &str) -> String {
    // Double quotes are standard; single quotes appear in some renderings.
    for pattern in [
        format!("Name=\"{}\">", field_name),
        format!("Name='{}'>", field_name),
    ] {
        if let Some(pos) = xml.find(&pattern) {
            let start = pos + pattern.len();
            if let Some(end) = xml[start..].find("</Data>") {
                return xml[start..start + end].to_string();
            }
        }
    }
    String::new()
}

fn parse_u32(s: &str) -> u32 {
    s.trim().parse().unwrap_or(0)
}

pub fn parse_event_xml(xml: &str) -> Option<SysmonEvent> {
    let event_id = parse_u32(&xml_tag_inner(xml, "EventID"));
    let pid = parse_u32(&data_field(xml, "ProcessId"));
    let image = data_field(xml, "Image");

    match event_id {
        1 => Some(SysmonEvent {
            event_id,
            process_id: pid,
            parent_process_id: parse_u32(&data_field(xml, "ParentProcessId")),
            image,
            command_line: data_field(xml, "CommandLine"),
            target: String::new(),
            operation: "ProcessCreate".to_string(),
        }),
        3 => {
            let dest = format!(
                "{}:{}",
                data_field(xml, "DestinationIp"),
                data_field(xml, "DestinationPort")
            );
            Some(SysmonEvent {
                event_id,
                process_id: pid,
                parent_process_id: 0,
                image,
                command_line: String::new(),
                target: dest,
                operation: "NetworkConnect".to_string(),
            })
        }
        7 => Some(SysmonEvent {
            event_id,
            process_id: pid,
            parent_process_id: 0,
            image,
            command_line: String::new(),
            target: data_field(xml, "ImageLoaded"),
            operation: "ImageLoad".to_string(),
        }),
        11 => Some(SysmonEvent {
            event_id,
            process_id: pid,
            parent_process_id: 0,
            image,
            command_line: String::new(),
            target: data_field(xml, "TargetFilename"),
            operation: "FileCreate".to_string(),
        }),
        12 | 13 | 14 => {
            // 12 = key create/delete, 13 = value set, 14 = key/value rename
            let op = match event_id {
                13 => "SetValue".to_string(),
                14 => "Rename".to_string(),
                _ => {
                    let et = data_field(xml, "EventType");
                    if et.is_empty() {
                        "KeyEvent".to_string()
                    } else {
                        et
                    }
                }
            };
            Some(SysmonEvent {
                event_id,
                process_id: pid,
                parent_process_id: 0,
                image,
                command_line: String::new(),
                target: data_field(xml, "TargetObject"),
                operation: op,
            })
        }
        22 => Some(SysmonEvent {
            event_id,
            process_id: pid,
            parent_process_id: 0,
            image,
            command_line: String::new(),
            target: data_field(xml, "QueryName"),
            operation: "DnsQuery".to_string(),
        }),
        _ => None,
    }
}

pub fn parse_event_stream(xml: &str) -> Vec<SysmonEvent> {
    let mut events = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Event") {
        let Some(end) = rest[start..].find("</Event>") else {
            break;
        };
        let block = &rest[start..start + end + "</Event>".len()];
        if let Some(event) = parse_event_xml(block) {
            events.push(event);
        }
        rest = &rest[start + end + "</Event>".len()..];
    }
    events
}

// ─── Sample process set ──────────────────────────────────────────────────

/// All pids belonging to the sample: seeded by images that mention the
/// sample basename, then closed over parent→child edges to a fixed point.
pub fn sample_process_set(events: &[SysmonEvent], sample_base: &str) -> HashSet<u32> {
    let mut set: HashSet<u32> = HashSet::new();
    if sample_base.is_empty() {
        return set;
    }
    let needle = sample_base.to_lowercase();

    let mut edges: HashMap<u32, u32> = HashMap::new(); // pid -> ppid
    for evt in events {
        if evt.event_id == 1 {
            edges.insert(evt.process_id, evt.parent_process_id);
        }
        if evt.process_id != 0 && evt.image.to_lowercase().contains(&needle) {
            set.insert(evt.process_id);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for (pid, ppid) in &edges {
            if set.contains(ppid) && !set.contains(pid) {
                set.insert(*pid);
                changed = true;
            }
        }
    }
    set
}

fn references_sample(evt: &SysmonEvent, needle: &str) -> bool {
    !needle.is_empty()
        && (evt.image.to_lowercase().contains(needle)
            || evt.target.to_lowercase().contains(needle)
            || evt.command_line.to_lowercase().contains(needle))
}

pub fn summarize_events(events: &[SysmonEvent], sample_base: &str) -> SysmonSummary {
    let set = sample_process_set(events, sample_base);
    let needle = sample_base.to_lowercase();

    let mut summary = SysmonSummary {
        sample: sample_base.to_string(),
        total_events: events.len(),
        ..Default::default()
    };

    let mut seen_images: HashSet<String> = HashSet::new();
    for evt in events {
        if !set.contains(&evt.process_id) && !references_sample(evt, &needle) {
            continue;
        }
        summary.sample_events += 1;
        match evt.event_id {
            1 => summary.processes_created.push(ProcessEntry {
                pid: evt.process_id,
                ppid: evt.parent_process_id,
                image: evt.image.clone(),
                command_line: evt.command_line.clone(),
            }),
            3 => summary.network_connections.push(NetworkEntry {
                pid: evt.process_id,
                image: evt.image.clone(),
                destination: evt.target.clone(),
            }),
            22 => summary.dns_queries.push(DnsEntry {
                pid: evt.process_id,
                image: evt.image.clone(),
                query: evt.target.clone(),
            }),
            11 => summary.files_created.push(FileEntry {
                pid: evt.process_id,
                image: evt.image.clone(),
                path: evt.target.clone(),
            }),
            12 | 13 | 14 => summary.registry_events.push(RegistryEntry {
                pid: evt.process_id,
                image: evt.image.clone(),
                operation: evt.operation.clone(),
                key: evt.target.clone(),
            }),
            7 => {
                if summary.images_loaded.len() < MAX_IMAGES_LOADED
                    && seen_images.insert(evt.target.to_lowercase())
                {
                    summary.images_loaded.push(evt.target.clone());
                }
            }
            _ => {}
        }
    }
    summary
}
