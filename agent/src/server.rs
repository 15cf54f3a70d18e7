use crate::runner::GuestAgent;
use crate::state::Status;
use actix_web::{get, post, web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared context handed to every request handler.
pub struct ServerContext {
    pub agent: Arc<GuestAgent>,
    pub shutdown: Arc<Notify>,
}

fn ok(data: serde_json::Value) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok", "data": data }))
}

fn err(status: actix_web::http::StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "status": "error", "error": message }))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    filename: Option<String>,
    timeout: Option<u64>,
    screenshot_interval: Option<u64>,
}

#[get("/api/status")]
async fn get_status(ctx: web::Data<ServerContext>) -> impl Responder {
    let mut data = serde_json::to_value(ctx.agent.state.snapshot()).unwrap_or_else(|_| json!({}));
    if let Some(obj) = data.as_object_mut() {
        obj.insert("agent_version".to_string(), json!(crate::AGENT_VERSION));
        obj.insert("platform".to_string(), json!(ctx.agent.platform));
        obj.insert(
            "collectors".to_string(),
            json!(ctx.agent.collector_info().await),
        );
    }
    ok(data)
}

#[get("/api/collectors")]
async fn get_collectors(ctx: web::Data<ServerContext>) -> impl Responder {
    ok(json!({ "collectors": ctx.agent.collector_info().await }))
}

#[get("/api/artifacts")]
async fn get_artifacts(ctx: web::Data<ServerContext>) -> impl Responder {
    let artifacts = ctx.agent.list_artifacts();
    ok(json!({ "count": artifacts.len(), "artifacts": artifacts }))
}

#[post("/api/execute")]
async fn post_execute(ctx: web::Data<ServerContext>, body: web::Bytes) -> impl Responder {
    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return err(actix_web::http::StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {}", e)),
    };

    let filename = match request.filename {
        Some(f) if !f.trim().is_empty() => f,
        _ => {
            return err(
                actix_web::http::StatusCode::BAD_REQUEST,
                "Missing required field: 'filename'",
            )
        }
    };
    let timeout = request.timeout.unwrap_or(60);
    // Anything faster than 2s just burns CPU on encode.
    let screenshot_interval = request.screenshot_interval.unwrap_or(5).max(2);

    // The transition happens before the acknowledgement: a status probe
    // racing this response can only observe `executing` or later.
    if let Err(conflict) = ctx.agent.state.try_begin_execution(&filename) {
        return err(actix_web::http::StatusCode::CONFLICT, &conflict);
    }

    let agent = Arc::clone(&ctx.agent);
    let spawned_filename = filename.clone();
    tokio::spawn(async move {
        let outcome = agent
            .execute_sample(&spawned_filename, timeout, screenshot_interval)
            .await;
        match serde_json::to_string(&outcome) {
            Ok(rendered) => log::info!("Background execution finished: {}", rendered),
            Err(_) => log::info!("Background execution finished: {}", outcome.status),
        }
    });

    ok(json!({
        "message": format!("Execution started for '{}'", filename),
        "timeout": timeout,
    }))
}

#[post("/api/collect")]
async fn post_collect(ctx: web::Data<ServerContext>) -> impl Responder {
    if ctx.agent.state.status() == Status::Executing {
        return err(
            actix_web::http::StatusCode::CONFLICT,
            "Cannot collect while executing",
        );
    }
    let collection = ctx.agent.collect_only().await;
    ok(json!({ "collection": collection }))
}

#[post("/api/cleanup")]
async fn post_cleanup(ctx: web::Data<ServerContext>) -> impl Responder {
    ctx.agent.cleanup();
    ok(json!({ "message": "Artifacts cleaned up" }))
}

#[post("/api/shutdown")]
async fn post_shutdown(ctx: web::Data<ServerContext>) -> impl Responder {
    ctx.shutdown.notify_one();
    ok(json!({ "message": "Agent shutting down" }))
}

async fn not_found() -> HttpResponse {
    err(actix_web::http::StatusCode::NOT_FOUND, "Not found")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_status)
        .service(get_collectors)
        .service(get_artifacts)
        .service(post_execute)
        .service(post_collect)
        .service(post_cleanup)
        .service(post_shutdown)
        .default_service(web::route().to(not_found));
}
