use crate::collectors::{truncate_chars, CollectorReport};
use chrono::Utc;
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Raw tool logs stay in the VM; only summaries travel.
const EXCLUDED_EXTENSIONS: &[&str] = &["pml", "csv", "pcap"];

const TCPVCON_EMBED_CHARS: usize = 20_000;
const HANDLE_EMBED_CHARS: usize = 30_000;

pub fn is_excluded(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXCLUDED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Aggregate every collector's summary into one document.
///
/// Summary-emitting collectors are embedded as parsed JSON; the connection
/// snapshot is embedded as raw CSV text, the handle snapshot as clipped
/// text, and screenshots as a count plus basenames.
pub fn build_analysis_summary(
    artifacts_dir: &Path,
    collection: &[CollectorReport],
) -> serde_json::Value {
    let mut summary = serde_json::Map::new();

    for report in collection {
        let name = report.collector.as_str();
        let entry = match name {
            "screenshots" => {
                let basenames: Vec<String> = report
                    .files
                    .iter()
                    .filter_map(|f| {
                        Path::new(f)
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                    })
                    .collect();
                json!({ "count": basenames.len(), "files": basenames })
            }
            "tcpvcon" => {
                match std::fs::read_to_string(artifacts_dir.join("tcpvcon").join("tcpvcon_snapshot.csv"))
                {
                    Ok(raw) => json!({ "raw": truncate_chars(&raw, TCPVCON_EMBED_CHARS) }),
                    Err(_) => json!({ "status": report.status }),
                }
            }
            "handle" => {
                match std::fs::read_to_string(artifacts_dir.join("handle").join("handle_snapshot.txt"))
                {
                    Ok(raw) => {
                        let clipped = truncate_chars(&raw, HANDLE_EMBED_CHARS);
                        let text = if clipped.len() < raw.len() {
                            format!("{}\n... [truncated]", clipped)
                        } else {
                            clipped.to_string()
                        };
                        json!({ "snapshot": text })
                    }
                    Err(_) => json!({ "status": report.status }),
                }
            }
            _ => {
                let summary_file = artifacts_dir
                    .join(name)
                    .join(format!("{}_summary.json", name));
                match std::fs::read_to_string(&summary_file)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
                {
                    Some(parsed) => parsed,
                    None => json!({ "status": report.status }),
                }
            }
        };
        summary.insert(name.to_string(), entry);
    }

    serde_json::Value::Object(summary)
}

/// Zip the run's artifacts and copy the archive to the shared channel.
///
/// Returns the archive name; a failed copy to the share is logged but keeps
/// the archive locally.
pub fn package_results(
    workdir: &Path,
    share_path: &Path,
    sample_name: &str,
    collection: &[CollectorReport],
) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    let artifacts_dir = workdir.join("artifacts");
    std::fs::create_dir_all(&artifacts_dir)?;

    let ts = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let base = Path::new(sample_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| sample_name.to_string());
    let zip_name = format!("results_{}_{}.zip", base, ts);
    let zip_path = workdir.join(&zip_name);

    let metadata_path = artifacts_dir.join("metadata.json");
    std::fs::write(
        &metadata_path,
        serde_json::to_vec_pretty(&json!({
            "sample": sample_name,
            "timestamp": ts,
            "agent_version": crate::AGENT_VERSION,
            "collectors": collection,
        }))?,
    )?;

    let summary_path = artifacts_dir.join("analysis_summary.json");
    std::fs::write(
        &summary_path,
        serde_json::to_vec_pretty(&build_analysis_summary(&artifacts_dir, collection))?,
    )?;

    let mut all_files: Vec<String> = collection
        .iter()
        .flat_map(|r| r.files.iter().cloned())
        .collect();
    all_files.push(metadata_path.to_string_lossy().to_string());
    all_files.push(summary_path.to_string_lossy().to_string());

    let file = File::create(&zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut packed = 0usize;
    for entry in &all_files {
        let path = Path::new(entry);
        if !path.is_file() || is_excluded(path) {
            continue;
        }
        let arcname = path
            .strip_prefix(workdir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(arcname, options)?;
        writer.write_all(&std::fs::read(path)?)?;
        packed += 1;
    }
    writer.finish()?;

    if packed == 0 {
        log::info!("No artifacts to package");
        let _ = std::fs::remove_file(&zip_path);
        return Ok(None);
    }

    let share_dest = share_path.join(&zip_name);
    match std::fs::copy(&zip_path, &share_dest) {
        Ok(_) => log::info!("Results package -> {}", share_dest.display()),
        Err(e) => log::error!("Failed to copy package to share: {}", e),
    }

    Ok(Some(zip_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn sample_collection(workdir: &Path) -> Vec<CollectorReport> {
        let artifacts = workdir.join("artifacts");
        let sysmon_summary = artifacts.join("sysmon").join("sysmon_summary.json");
        let procmon_summary = artifacts.join("procmon").join("procmon_summary.json");
        let procmon_csv = artifacts.join("procmon").join("procmon.csv");
        let pml = artifacts.join("procmon").join("procmon.pml");
        let pcap = artifacts.join("network").join("capture.pcap");
        let shot = artifacts.join("screenshots").join("screenshot_000_x.png");
        let tcpv = artifacts.join("tcpvcon").join("tcpvcon_snapshot.csv");
        let handle = artifacts.join("handle").join("handle_snapshot.txt");

        write(&sysmon_summary, r#"{"sample":"hello.exe","total_events":3}"#);
        write(&procmon_summary, r#"{"sample":"hello.exe","total_rows":9}"#);
        write(&procmon_csv, "a,b,c\n");
        write(&pml, "binary");
        write(&pcap, "pcap");
        write(&shot, "png");
        write(&tcpv, "Protocol,Process\nTCP,hello.exe\n");
        write(&handle, "hello.exe pid: 1234 File C:\\Temp\\x\n");

        vec![
            CollectorReport::ok("sysmon", vec![sysmon_summary.to_string_lossy().to_string()]),
            CollectorReport::ok(
                "procmon",
                vec![
                    procmon_summary.to_string_lossy().to_string(),
                    procmon_csv.to_string_lossy().to_string(),
                    pml.to_string_lossy().to_string(),
                ],
            ),
            CollectorReport::no_data("network"),
            CollectorReport::ok("screenshots", vec![shot.to_string_lossy().to_string()]),
            CollectorReport::ok("tcpvcon", vec![tcpv.to_string_lossy().to_string()]),
            CollectorReport::ok("handle", vec![handle.to_string_lossy().to_string()]),
        ]
    }

    #[test]
    fn archive_excludes_raw_logs_and_includes_summaries() {
        let workdir = tempdir().unwrap();
        let share = tempdir().unwrap();
        let collection = sample_collection(workdir.path());

        let name = package_results(workdir.path(), share.path(), "hello.exe", &collection)
            .unwrap()
            .unwrap();
        assert!(name.starts_with("results_hello_"));
        assert!(name.ends_with(".zip"));
        assert!(share.path().join(&name).is_file());

        let file = File::open(workdir.path().join(&name)).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();

        for n in &names {
            assert!(!n.ends_with(".pml"), "raw log leaked: {}", n);
            assert!(!n.ends_with(".csv"), "raw log leaked: {}", n);
            assert!(!n.ends_with(".pcap"), "raw log leaked: {}", n);
        }
        assert!(names.iter().any(|n| n.ends_with("metadata.json")));
        assert!(names.iter().any(|n| n.ends_with("analysis_summary.json")));
        assert!(names.iter().any(|n| n.ends_with("sysmon_summary.json")));
        assert!(names.iter().any(|n| n.ends_with("screenshot_000_x.png")));
    }

    #[test]
    fn extraction_reproduces_contents() {
        let workdir = tempdir().unwrap();
        let share = tempdir().unwrap();
        let collection = sample_collection(workdir.path());
        let name = package_results(workdir.path(), share.path(), "hello.exe", &collection)
            .unwrap()
            .unwrap();

        let out = tempdir().unwrap();
        let file = File::open(workdir.path().join(&name)).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        archive.extract(out.path()).unwrap();

        let original =
            std::fs::read_to_string(workdir.path().join("artifacts/sysmon/sysmon_summary.json"))
                .unwrap();
        let extracted =
            std::fs::read_to_string(out.path().join("artifacts/sysmon/sysmon_summary.json"))
                .unwrap();
        assert_eq!(original, extracted);
    }

    #[test]
    fn summary_embeds_per_collector_shapes() {
        let workdir = tempdir().unwrap();
        let collection = sample_collection(workdir.path());
        let artifacts = workdir.path().join("artifacts");
        let summary = build_analysis_summary(&artifacts, &collection);

        assert_eq!(summary["sysmon"]["total_events"], 3);
        assert_eq!(summary["screenshots"]["count"], 1);
        assert_eq!(summary["screenshots"]["files"][0], "screenshot_000_x.png");
        assert!(summary["tcpvcon"]["raw"]
            .as_str()
            .unwrap()
            .contains("TCP,hello.exe"));
        assert!(summary["handle"]["snapshot"]
            .as_str()
            .unwrap()
            .contains("pid: 1234"));
        // Collector without a summary file falls back to its status.
        assert_eq!(summary["network"]["status"], "no_data");
    }

    #[test]
    fn long_handle_snapshot_gets_truncation_marker() {
        let workdir = tempdir().unwrap();
        let artifacts = workdir.path().join("artifacts");
        let handle = artifacts.join("handle").join("handle_snapshot.txt");
        write(&handle, &"x".repeat(HANDLE_EMBED_CHARS + 100));
        let collection = vec![CollectorReport::ok(
            "handle",
            vec![handle.to_string_lossy().to_string()],
        )];
        let summary = build_analysis_summary(&artifacts, &collection);
        let text = summary["handle"]["snapshot"].as_str().unwrap();
        assert!(text.ends_with("... [truncated]"));
        assert!(text.len() < HANDLE_EMBED_CHARS + 100);
    }

    #[test]
    fn empty_collection_packages_nothing_but_metadata() {
        let workdir = tempdir().unwrap();
        let share = tempdir().unwrap();
        // metadata + summary always exist, so an archive is still produced
        let name = package_results(workdir.path(), share.path(), "hello.exe", &[])
            .unwrap()
            .unwrap();
        let file = File::open(workdir.path().join(&name)).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 2);
    }
}
