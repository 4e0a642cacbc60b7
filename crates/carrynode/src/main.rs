//! CarryNode - replays a contact trace through the CarryMesh router policy

use anyhow::{Context, Result};
use carrynode::{Config, Report, Scenario, World};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carrynode")]
#[command(about = "Replay a DTN contact trace through the CarryMesh router policy")]
#[command(version)]
struct Args {
    /// Configuration file [default: <user config dir>/carrynode/config.yaml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Contact trace to replay
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Log filter, overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config)?;
        println!(
            "Wrote default configuration to {}",
            config.config_path().display()
        );
        return Ok(());
    }

    let config = Config::load(args.config)?;
    init_logging(&config, args.log_level.as_deref())?;

    let scenario_path = args
        .scenario
        .context("No scenario given; pass one with --scenario")?;
    let scenario = Scenario::load(&scenario_path)?;

    info!(
        config = %config.config_path().display(),
        scenario = %scenario_path.display(),
        nodes = scenario.nodes.len(),
        events = scenario.events.len(),
        "Starting replay"
    );

    let mut world = World::new(
        &scenario.nodes,
        config.routing.clone(),
        &config.oracle_registry(),
    )?;
    let report = world.run(&scenario)?;
    print_report(&report);

    info!("Replay finished");
    Ok(())
}

fn init_logging(config: &Config, level: Option<&str>) -> Result<()> {
    let directive = level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("Replay ended at t={}s", report.end_time);
    println!(
        "{:<12} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "node",
        "created",
        "relayed",
        "delivered",
        "acked",
        "evicted",
        "expired",
        "denied",
        "aborted"
    );
    for (name, stats) in &report.nodes {
        println!(
            "{:<12} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8} {:>8}",
            name,
            stats.created,
            stats.relayed,
            stats.delivered,
            stats.acked,
            stats.evicted,
            stats.expired,
            stats.denied,
            stats.aborted
        );
    }

    let total = &report.total;
    println!(
        "{:<12} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "total",
        total.created,
        total.relayed,
        total.delivered,
        total.acked,
        total.evicted,
        total.expired,
        total.denied,
        total.aborted
    );
    if report.refused > 0 {
        println!("{} messages refused at creation", report.refused);
    }
    println!("Delivery ratio: {:.3}", report.delivery_ratio());
}
