use std::time::Duration;

use clap::Parser;
use common::Context;
use engine::{default_registry, load_config_file, Supervisor, SupervisorOptions};
use log::info;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "fnhost", about = "Runs a function behind an event source")]
struct Args {
    /// Path to the configuration yaml file
    #[arg(short = 'f', default_value = "fnhost.yaml")]
    config: String,

    /// Whether the runner should automatically restart on error
    #[arg(long = "restart", default_value_t = true, action = clap::ArgAction::Set)]
    restart: bool,

    /// How long to wait before automatically restarting
    #[arg(long = "restart-wait", default_value = "10s", value_parser = parse_wait)]
    restart_wait: Duration,
}

fn parse_wait(s: &str) -> Result<Duration, String> {
    common::parse_duration(s).map_err(|e| e.to_string())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    let _ = LogTracer::init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    let config_path = match std::env::var("CONFIG_FILE") {
        Ok(path) if !path.is_empty() => path,
        _ => args.config,
    };

    let config = match load_config_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let registry = default_registry();
    let supervisor = Supervisor::new(
        registry,
        SupervisorOptions {
            auto_restart: args.restart,
            restart_wait: args.restart_wait,
        },
    );

    let ctx = Context::background();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down...");
            shutdown.cancel();
        }
    });

    info!("running fnhost runner...");
    if let Err(e) = supervisor.run(&ctx, config).await {
        eprintln!("runner failed: {e}");
        std::process::exit(1);
    }
}
