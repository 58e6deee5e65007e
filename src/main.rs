use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::{DriveConfig, PlannerConfig};
use swerve_zenoh_runtime::drive::landmark::Alliance;
use swerve_zenoh_runtime::runtime::{self, RuntimeOptions};

/// Swerve drive runtime over zenoh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Drive config JSON (geometry, limits, gains); defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Planner chassis config JSON (mass, MOI, wheel friction)
    #[arg(short, long)]
    planner_config: Option<PathBuf>,

    /// Alliance for landmark queries; unknown when omitted
    #[arg(short, long, value_enum)]
    alliance: Option<Alliance>,

    /// Control loop rate, overrides the config's loop period
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=1000))]
    hz: Option<u64>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut drive = DriveConfig::load_or_default(args.config.as_deref());
    if let Some(hz) = args.hz {
        drive.loop_period_s = 1.0 / hz as f64;
    }
    let planner = PlannerConfig::load_or_zero(args.planner_config.as_deref());
    info!("Alliance: {:?}", args.alliance);

    let options = RuntimeOptions {
        drive,
        planner,
        alliance: args.alliance,
    };
    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
