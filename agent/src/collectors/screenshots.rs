use super::{collector_dir, ensure_dir, Collector, CollectorReport, StartConfig};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const MIN_INTERVAL_SECS: u64 = 2;
const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Periodic capture of the primary display while the sample runs.
///
/// The loop is a background task driven by a cancellable timed wait; stop
/// signals it and joins with a timeout.
pub struct ScreenshotCollector {
    output_dir: PathBuf,
    sample: Mutex<Option<String>>,
    captured: Arc<Mutex<Vec<String>>>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScreenshotCollector {
    pub fn new(workdir: &Path) -> Self {
        ScreenshotCollector {
            output_dir: collector_dir(workdir, "screenshots"),
            sample: Mutex::new(None),
            captured: Arc::new(Mutex::new(Vec::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }
}

/// Grab the primary display and return PNG bytes.
fn capture_primary_png() -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let screens = screenshots::Screen::all().map_err(|e| format!("screen enumeration: {}", e))?;
    let screen = screens
        .iter()
        .find(|s| s.display_info.is_primary)
        .or_else(|| screens.first())
        .ok_or("no display available")?;
    let image = screen.capture().map_err(|e| format!("capture: {}", e))?;
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);
    image
        .write_to(&mut cursor, image::ImageOutputFormat::Png)
        .map_err(|e| format!("png encode: {}", e))?;
    Ok(buffer)
}

async fn capture_loop(
    output_dir: PathBuf,
    interval: u64,
    captured: Arc<Mutex<Vec<String>>>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    let mut idx: u32 = 0;
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("screenshot_{:03}_{}.png", idx, ts);
        let path = output_dir.join(&filename);
        match tokio::task::spawn_blocking(capture_primary_png).await {
            Ok(Ok(bytes)) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    log::warn!("Screenshot {} write failed: {}", idx, e);
                } else {
                    captured.lock().unwrap().push(path.to_string_lossy().to_string());
                    log::info!("Screenshot {} -> {}", idx, filename);
                }
            }
            Ok(Err(e)) => log::warn!("Screenshot {} failed: {}", idx, e),
            Err(e) => log::warn!("Screenshot {} task failed: {}", idx, e),
        }
        idx += 1;

        tokio::select! {
            _ = stop_notify.notified() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }
}

#[async_trait]
impl Collector for ScreenshotCollector {
    fn name(&self) -> &'static str {
        "screenshots"
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn is_available(&self) -> bool {
        // Enumerating existing image files always works.
        true
    }

    fn set_sample(&self, base: &str) {
        *self.sample.lock().unwrap() = Some(base.to_string());
    }

    fn has_lifecycle(&self) -> bool {
        true
    }

    async fn start(
        &self,
        cfg: &StartConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        ensure_dir(&self.output_dir)?;
        let interval = cfg.screenshot_interval.max(MIN_INTERVAL_SECS);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.captured.lock().unwrap().clear();

        let handle = tokio::spawn(capture_loop(
            self.output_dir.clone(),
            interval,
            Arc::clone(&self.captured),
            Arc::clone(&self.stop_flag),
            Arc::clone(&self.stop_notify),
        ));
        *self.worker.lock().unwrap() = Some(handle);
        log::info!("Screenshot capture started (interval={}s)", interval);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // notify_one buffers a permit, so a loop that is mid-capture still
        // observes the signal at its next wait.
        self.stop_notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                log::warn!("Screenshot loop did not stop within 10s");
            } else {
                log::info!("Screenshot capture stopped");
            }
        }
    }

    async fn collect(&self) -> CollectorReport {
        let mut files = self.captured.lock().unwrap().clone();

        // Pick up anything a separate capture mechanism dropped in the
        // output directory, deduplicated against our own captures.
        if let Ok(entries) = std::fs::read_dir(&self.output_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_image {
                    continue;
                }
                let as_str = path.to_string_lossy().to_string();
                if !files.contains(&as_str) {
                    files.push(as_str);
                }
            }
        }

        if files.is_empty() {
            log::info!("No screenshots found");
            return CollectorReport::no_data(self.name());
        }
        log::info!("Found {} screenshot(s)", files.len());
        CollectorReport::ok(self.name(), files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn collect_enumerates_and_deduplicates() {
        let dir = tempdir().unwrap();
        let collector = ScreenshotCollector::new(dir.path());
        ensure_dir(collector.output_dir()).unwrap();

        let a = collector.output_dir().join("screenshot_000_x.png");
        let b = collector.output_dir().join("screenshot_001_x.png");
        std::fs::write(&a, b"png").unwrap();
        std::fs::write(&b, b"png").unwrap();
        std::fs::write(collector.output_dir().join("notes.txt"), b"skip").unwrap();

        // One file already tracked by the capture loop.
        collector
            .captured
            .lock()
            .unwrap()
            .push(a.to_string_lossy().to_string());

        let report = collector.collect().await;
        assert_eq!(report.status, "ok");
        assert_eq!(report.files.len(), 2);
    }

    #[tokio::test]
    async fn collect_without_images_reports_no_data() {
        let dir = tempdir().unwrap();
        let collector = ScreenshotCollector::new(dir.path());
        ensure_dir(collector.output_dir()).unwrap();
        let report = collector.collect().await;
        assert_eq!(report.status, "no_data");
        assert!(report.files.is_empty());
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let dir = tempdir().unwrap();
        let collector = ScreenshotCollector::new(dir.path());
        collector.stop().await;
    }
}
