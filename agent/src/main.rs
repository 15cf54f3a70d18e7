mod collectors;
mod package;
mod procutil;
mod runner;
mod server;
mod state;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

pub const AGENT_VERSION: &str = "1.3.0";

/// Glasslab guest agent — sandbox VM command service.
///
/// Receives commands from the host bridge over HTTP, detonates samples,
/// collects behavioral artifacts and exports result packages through the
/// shared folder.
#[derive(Parser, Debug)]
#[command(name = "glasslab-agent", version = AGENT_VERSION)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Shared folder path (host <-> guest channel)
    #[arg(long, default_value = r"\\VBOXSVR\SandboxShare")]
    share: PathBuf,

    /// Local working directory for samples and artifacts
    #[arg(long, default_value = r"C:\Glasslab")]
    workdir: PathBuf,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    if !args.share.is_dir() {
        log::error!("Shared folder not accessible: {}", args.share.display());
        log::error!("Ensure the hypervisor shared folder is configured and mounted.");
        std::process::exit(1);
    }
    std::fs::create_dir_all(&args.workdir)?;

    let agent = match runner::GuestAgent::new(args.share.clone(), args.workdir.clone()) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            log::error!("Agent initialisation failed: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(Notify::new());
    let ctx = web::Data::new(server::ServerContext {
        agent,
        shutdown: Arc::clone(&shutdown),
    });

    log::info!("Glasslab Agent v{}", AGENT_VERSION);
    // The advertised address is derived from the bind address as-is; a
    // reverse-DNS lookup would hang on an isolated VM without DNS.
    log::info!("Listening on http://{}:{}", args.host, args.port);
    log::info!("Shared folder {}", args.share.display());
    log::info!("Working dir   {}", args.workdir.display());

    let http = HttpServer::new(move || {
        App::new()
            .app_data(ctx.clone())
            .configure(server::configure)
    })
    .bind((args.host.as_str(), args.port))?
    .run();

    let handle = http.handle();
    tokio::spawn(async move {
        shutdown.notified().await;
        log::info!("Shutdown requested, stopping server");
        handle.stop(true).await;
    });

    http.await?;
    log::info!("Agent stopped.");
    Ok(())
}
