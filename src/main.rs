use clap::Parser;
use tracing::{debug, info, warn};

use rtc2webm::config::Config;

#[derive(Parser)]
#[command(version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = Config::parse(args.config);

    rtc2webm::log::set(format!("rtc2webm={},webrtc=error", cfg.log.level));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    rtc2webm::metrics_register();

    let listener = tokio::net::TcpListener::bind(cfg.http.listen)
        .await
        .unwrap();
    info!("Server listening on {}", listener.local_addr().unwrap());
    info!("Recording to {}", cfg.record.output_dir.display());

    rtc2webm::server_up(cfg, listener, shutdown_signal()).await;
    info!("Server shutdown");
}

async fn shutdown_signal() {
    let str = rtc2webm::signal::wait_for_stop_signal().await;
    debug!("Received signal: {}", str);
}
