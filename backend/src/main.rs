mod agent_client;
mod ai;
mod analyzer;
mod orchestrator;
mod vbox;

use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use ai::copilot::CopilotProvider;
use ai::provider::ChatProvider;
use analyzer::ThreatAnalyzer;
use dotenv::dotenv;
use futures::TryStreamExt;
use orchestrator::{OrchestratorConfig, SandboxOrchestrator};
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

struct AppState {
    orchestrator: Arc<SandboxOrchestrator>,
    provider: Arc<dyn ChatProvider>,
    reports_dir: PathBuf,
    vbox: vbox::VBoxClient,
    vm_name: String,
}

fn ok(data: serde_json::Value) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok", "data": data }))
}

fn err(status: actix_web::http::StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "status": "error", "error": message }))
}

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok", "service": "glasslab-bridge" }))
}

#[derive(Debug, Deserialize)]
struct SubmitParams {
    timeout: Option<u64>,
    screenshot_interval: Option<u64>,
}

/// Upload a sample and run the full sandbox pipeline: stage to the shared
/// folder, detonate via the agent, poll, retrieve and unpack results.
#[post("/api/analysis/submit")]
async fn submit_analysis(
    state: web::Data<AppState>,
    params: web::Query<SubmitParams>,
    mut payload: actix_multipart::Multipart,
) -> impl Responder {
    let timeout = params.timeout.unwrap_or(60);
    let screenshot_interval = params.screenshot_interval.unwrap_or(5);
    if !(10..=300).contains(&timeout) {
        return err(
            actix_web::http::StatusCode::BAD_REQUEST,
            "Timeout must be between 10 and 300 seconds",
        );
    }
    if state.orchestrator.is_running() {
        return err(
            actix_web::http::StatusCode::CONFLICT,
            "Analysis already in progress",
        );
    }

    // Spool the upload into a scratch directory under its original name.
    let upload_dir =
        std::env::temp_dir().join(format!("glasslab_upload_{}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = std::fs::create_dir_all(&upload_dir) {
        return err(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to create upload dir: {}", e),
        );
    }

    let mut sample_path: Option<PathBuf> = None;
    while let Ok(Some(mut field)) = payload.try_next().await {
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(sanitize_filename);
        let Some(filename) = filename else { continue };

        let dest = upload_dir.join(&filename);
        let mut file = match std::fs::File::create(&dest) {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&upload_dir);
                return err(
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Failed to save uploaded file: {}", e),
                );
            }
        };
        while let Ok(Some(chunk)) = field.try_next().await {
            if let Err(e) = file.write_all(&chunk) {
                let _ = std::fs::remove_dir_all(&upload_dir);
                return err(
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Failed to save uploaded file: {}", e),
                );
            }
        }
        sample_path = Some(dest);
    }

    let Some(sample_path) = sample_path else {
        let _ = std::fs::remove_dir_all(&upload_dir);
        return err(
            actix_web::http::StatusCode::BAD_REQUEST,
            "Missing uploaded file field",
        );
    };

    let outcome = state
        .orchestrator
        .run_analysis(&sample_path, timeout, screenshot_interval)
        .await;
    let _ = std::fs::remove_dir_all(&upload_dir);

    match outcome {
        Ok(result) => ok(serde_json::to_value(&result).unwrap_or_else(|_| json!({}))),
        Err(conflict) => err(actix_web::http::StatusCode::CONFLICT, &conflict),
    }
}

/// Return the current or most recent analysis result.
#[get("/api/analysis/status")]
async fn analysis_status(state: web::Data<AppState>) -> impl Responder {
    match state.orchestrator.current_analysis() {
        Some(result) => ok(serde_json::to_value(&result).unwrap_or_else(|_| json!({}))),
        None => ok(json!({ "message": "No analysis has been run yet" })),
    }
}

#[post("/api/analysis/check-vm")]
async fn check_vm(state: web::Data<AppState>) -> impl Responder {
    ok(state.orchestrator.check_vm_ready().await)
}

#[post("/api/analysis/cleanup")]
async fn cleanup(state: web::Data<AppState>) -> impl Responder {
    match state.orchestrator.cleanup_agent().await {
        Ok(resp) => ok(resp),
        Err(e) => err(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Cleanup failed: {}", e),
        ),
    }
}

#[get("/api/analysis/agent/status")]
async fn agent_status(state: web::Data<AppState>) -> impl Responder {
    proxy_agent(state.orchestrator.agent_status().await)
}

#[get("/api/analysis/agent/collectors")]
async fn agent_collectors(state: web::Data<AppState>) -> impl Responder {
    proxy_agent(state.orchestrator.agent_collectors().await)
}

#[get("/api/analysis/agent/artifacts")]
async fn agent_artifacts(state: web::Data<AppState>) -> impl Responder {
    proxy_agent(state.orchestrator.agent_artifacts().await)
}

fn proxy_agent(
    resp: Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>>,
) -> HttpResponse {
    match resp {
        Ok(body) => {
            let data = body.get("data").cloned().unwrap_or(body);
            ok(data)
        }
        Err(e) => err(
            actix_web::http::StatusCode::BAD_GATEWAY,
            &format!("Agent unreachable: {}", e),
        ),
    }
}

/// Run the multi-agent AI pipeline over a stored report.
#[post("/api/analysis/{id}/ai-analyze")]
async fn ai_analyze(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let analysis_id = path.into_inner();
    let threat_analyzer =
        ThreatAnalyzer::new(state.reports_dir.clone(), Arc::clone(&state.provider));
    let report = threat_analyzer.analyze_report(&analysis_id).await;
    ok(report.to_value())
}

#[get("/api/analysis/{id}/ai-report")]
async fn ai_report(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let analysis_id = path.into_inner();
    let threat_analyzer =
        ThreatAnalyzer::new(state.reports_dir.clone(), Arc::clone(&state.provider));
    match threat_analyzer.get_ai_report(&analysis_id) {
        Some(report) => ok(report),
        None => err(
            actix_web::http::StatusCode::NOT_FOUND,
            &format!("No AI report for analysis: {}", analysis_id),
        ),
    }
}

// ─── VM control (VBoxManage passthrough) ────────────────────────────────

fn vbox_result(
    result: Result<vbox::CommandResult, Box<dyn std::error::Error + Send + Sync>>,
) -> HttpResponse {
    match result {
        Ok(r) => ok(json!({ "returncode": r.returncode, "stdout": r.stdout })),
        Err(e) => err(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
        ),
    }
}

#[get("/api/vms")]
async fn list_vms(state: web::Data<AppState>) -> impl Responder {
    vbox_result(state.vbox.list_vms().await)
}

#[get("/api/vms/running")]
async fn list_running_vms(state: web::Data<AppState>) -> impl Responder {
    vbox_result(state.vbox.list_running_vms().await)
}

#[get("/api/vms/info")]
async fn vm_info(state: web::Data<AppState>) -> impl Responder {
    vbox_result(state.vbox.show_vm_info(&state.vm_name).await)
}

#[derive(Debug, Deserialize)]
struct StartVmRequest {
    headless: Option<bool>,
}

#[post("/api/vms/start")]
async fn vm_start(state: web::Data<AppState>, body: web::Json<StartVmRequest>) -> impl Responder {
    vbox_result(
        state
            .vbox
            .start_vm(&state.vm_name, body.headless.unwrap_or(true))
            .await,
    )
}

#[post("/api/vms/poweroff")]
async fn vm_poweroff(state: web::Data<AppState>) -> impl Responder {
    vbox_result(state.vbox.poweroff_vm(&state.vm_name).await)
}

#[post("/api/vms/savestate")]
async fn vm_savestate(state: web::Data<AppState>) -> impl Responder {
    vbox_result(state.vbox.savestate_vm(&state.vm_name).await)
}

#[derive(Debug, Deserialize)]
struct ShutdownVmRequest {
    force: Option<bool>,
}

#[post("/api/vms/shutdown")]
async fn vm_shutdown(
    state: web::Data<AppState>,
    body: web::Json<ShutdownVmRequest>,
) -> impl Responder {
    vbox_result(
        state
            .vbox
            .shutdown(&state.vm_name, body.force.unwrap_or(false))
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    name: Option<String>,
}

#[post("/api/vms/snapshot/take")]
async fn vm_snapshot_take(
    state: web::Data<AppState>,
    body: web::Json<SnapshotRequest>,
) -> impl Responder {
    let Some(ref name) = body.name else {
        return err(
            actix_web::http::StatusCode::BAD_REQUEST,
            "Missing required field: 'name'",
        );
    };
    vbox_result(state.vbox.snapshot_take(&state.vm_name, name).await)
}

/// Restore a named snapshot, or the current one when no name is given.
#[post("/api/vms/snapshot/restore")]
async fn vm_snapshot_restore(
    state: web::Data<AppState>,
    body: web::Json<SnapshotRequest>,
) -> impl Responder {
    let result = match body.name {
        Some(ref name) => state.vbox.snapshot_restore(&state.vm_name, name).await,
        None => state.vbox.snapshot_restore_current(&state.vm_name).await,
    };
    vbox_result(result)
}

#[get("/api/vms/ip")]
async fn vm_ip(state: web::Data<AppState>) -> impl Responder {
    match state.vbox.vm_ip(&state.vm_name).await {
        Ok(Some(ip)) => ok(json!({ "ip": ip })),
        Ok(None) => err(
            actix_web::http::StatusCode::NOT_FOUND,
            "Guest has not published an IPv4 address yet",
        ),
        Err(e) => err(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
        ),
    }
}

/// Live capture of the VM display as a PNG.
#[get("/api/vms/screen")]
async fn vm_screen(state: web::Data<AppState>) -> impl Responder {
    let file = std::env::temp_dir().join(format!(
        "glasslab_screen_{}.png",
        uuid::Uuid::new_v4().simple()
    ));
    let capture = state
        .vbox
        .screenshot_png(&state.vm_name, &file.to_string_lossy())
        .await;
    let response = match capture {
        Ok(r) if r.returncode == 0 => match std::fs::read(&file) {
            Ok(bytes) => HttpResponse::Ok().content_type("image/png").body(bytes),
            Err(e) => err(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Screenshot unreadable: {}", e),
            ),
        },
        Ok(r) => err(
            actix_web::http::StatusCode::BAD_GATEWAY,
            &format!("VBoxManage screenshot failed: {}", r.stderr.trim()),
        ),
        Err(e) => err(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
        ),
    };
    let _ = std::fs::remove_file(&file);
    response
}

async fn not_found() -> HttpResponse {
    err(actix_web::http::StatusCode::NOT_FOUND, "Not found")
}

fn sanitize_filename(name: &str) -> String {
    // Keep only the final path component of whatever the client sent.
    name.replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or("sample.bin")
        .to_string()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(submit_analysis)
        .service(analysis_status)
        .service(check_vm)
        .service(cleanup)
        .service(agent_status)
        .service(agent_collectors)
        .service(agent_artifacts)
        .service(ai_analyze)
        .service(ai_report)
        .service(list_vms)
        .service(list_running_vms)
        .service(vm_info)
        .service(vm_start)
        .service(vm_poweroff)
        .service(vm_savestate)
        .service(vm_shutdown)
        .service(vm_snapshot_take)
        .service(vm_snapshot_restore)
        .service(vm_ip)
        .service(vm_screen)
        .default_service(web::route().to(not_found));
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080");
    let reports_dir = PathBuf::from(env_or("REPORTS_DIR", "storage/reports"));

    let config = OrchestratorConfig {
        agent_host: env_or("AGENT_HOST", "192.168.56.105"),
        agent_port: env_or("AGENT_PORT", "9090").parse().unwrap_or(9090),
        agent_timeout_secs: env_or("AGENT_TIMEOUT", "15").parse().unwrap_or(15),
        vm_name: env_or("VM_NAME", "WindowsSandbox"),
        vboxmanage_path: env_or("VBOXMANAGE_PATH", "VBoxManage"),
        share_dir: PathBuf::from(env_or("SHARE_DIR", "SandboxShare")),
        samples_dir: PathBuf::from(env_or("SAMPLES_DIR", "storage/samples")),
        reports_dir: reports_dir.clone(),
    };

    let vm_name = config.vm_name.clone();
    let vbox_client = vbox::VBoxClient::new(config.vboxmanage_path.clone());
    let orchestrator = match SandboxOrchestrator::new(config) {
        Ok(orch) => Arc::new(orch),
        Err(e) => {
            log::error!("Orchestrator initialisation failed: {}", e);
            std::process::exit(1);
        }
    };

    let ai_timeout = env_or("AI_TIMEOUT_SECONDS", "120").parse().unwrap_or(120);
    let provider: Arc<dyn ChatProvider> = Arc::new(CopilotProvider::new(
        env_or("COPILOT_TOKEN", ""),
        ai_timeout,
    ));

    let state = web::Data::new(AppState {
        orchestrator,
        provider,
        reports_dir,
        vbox: vbox_client,
        vm_name,
    });

    log::info!("Glasslab bridge listening on {}", bind_addr);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(bind_addr)?
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use tempfile::tempdir;

    fn make_state(reports_dir: &std::path::Path, agent_port: u16) -> web::Data<AppState> {
        let base = tempdir().unwrap().into_path();
        let config = OrchestratorConfig {
            agent_host: "127.0.0.1".to_string(),
            agent_port,
            agent_timeout_secs: 2,
            vm_name: "TestVM".to_string(),
            vboxmanage_path: "vboxmanage-test-missing".to_string(),
            share_dir: base.join("share"),
            samples_dir: base.join("samples"),
            reports_dir: reports_dir.to_path_buf(),
        };
        let vm_name = config.vm_name.clone();
        let vbox = vbox::VBoxClient::new(config.vboxmanage_path.clone());
        let orchestrator = Arc::new(SandboxOrchestrator::new(config).unwrap());
        let provider: Arc<dyn ChatProvider> =
            Arc::new(CopilotProvider::new(String::new(), 2));
        web::Data::new(AppState {
            orchestrator,
            provider,
            reports_dir: reports_dir.to_path_buf(),
            vbox,
            vm_name,
        })
    }

    #[actix_web::test]
    async fn health_is_ok() {
        let reports = tempdir().unwrap();
        let state = make_state(reports.path(), 1);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;
        let resp: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request())
                .await;
        assert_eq!(resp["status"], "ok");
    }

    #[actix_web::test]
    async fn status_before_any_run() {
        let reports = tempdir().unwrap();
        let state = make_state(reports.path(), 1);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;
        let resp: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/api/analysis/status")
                .to_request(),
        )
        .await;
        assert_eq!(resp["status"], "ok");
        assert!(resp["data"]["message"]
            .as_str()
            .unwrap()
            .contains("No analysis"));
    }

    #[actix_web::test]
    async fn submit_rejects_out_of_range_timeout() {
        let reports = tempdir().unwrap();
        let state = make_state(reports.path(), 1);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let body = "--X\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.exe\"\r\n\r\n\r\n--X--\r\n";
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/analysis/submit?timeout=5")
                .insert_header(("content-type", "multipart/form-data; boundary=X"))
                .set_payload(body)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn submit_with_unreachable_agent_fails_but_writes_manifest() {
        let reports = tempdir().unwrap();
        // Port 9 (discard) is closed in test environments; connect fails fast.
        let state = make_state(reports.path(), 9);
        let app =
            test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let body = "--X\r\nContent-Disposition: form-data; name=\"file\"; filename=\"hello.exe\"\r\n\r\npayload\r\n--X--\r\n";
        let resp: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/analysis/submit?timeout=10&screenshot_interval=2")
                .insert_header(("content-type", "multipart/form-data; boundary=X"))
                .set_payload(body)
                .to_request(),
        )
        .await;

        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["data"]["status"], "failed");
        assert_eq!(resp["data"]["sample_name"], "hello.exe");
        let id = resp["data"]["analysis_id"].as_str().unwrap();
        assert!(reports.path().join(id).join("analysis_manifest.json").is_file());

        // The failed run is the last-known analysis.
        let status: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/api/analysis/status")
                .to_request(),
        )
        .await;
        assert_eq!(status["data"]["status"], "failed");
    }

    #[actix_web::test]
    async fn ai_report_is_404_when_absent() {
        let reports = tempdir().unwrap();
        let state = make_state(reports.path(), 1);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/analysis/20260101_000000_abcd1234/ai-report")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn vm_control_surfaces_hypervisor_errors() {
        let reports = tempdir().unwrap();
        let state = make_state(reports.path(), 1);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        // The test VBoxManage binary does not exist; the route reports it.
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/vms/start")
                .set_json(serde_json::json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 500);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[::std::prelude::v1::test]
    fn filenames_are_sanitized_to_basename() {
        assert_eq!(sanitize_filename("hello.exe"), "hello.exe");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\mal.exe"), "mal.exe");
    }
}
